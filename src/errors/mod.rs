use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Transport Error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation Error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Failures of the raw HTTP leg to the Proxmox API. Each kind is surfaced
/// separately so callers can distinguish "cluster unreachable" from "the
/// cluster said no".
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection to hypervisor API failed on {path}: {message}")]
    Connect {
        path: String,
        message: String,
    },

    #[error("request to {path} timed out")]
    Timeout {
        path: String,
    },

    #[error("hypervisor API returned {code} for {path}: {body}")]
    Status {
        code: u16,
        path: String,
        body: String,
    },

    #[error("could not decode response from {path}: {message}")]
    Decode {
        path: String,
        message: String,
    },
}

/// Admission rejections. Every variant carries the offending field and the
/// bound that was violated, so the portal can render an actionable message.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{field} = {value} is outside the allowed range [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{field} '{value}' is not on the allowed list")]
    NotAllowed {
        field: &'static str,
        value: String,
    },

    #[error("node {node} {resource} cap exceeded: limit {limit}, attempted total {attempted}")]
    NodeCapExceeded {
        node: String,
        resource: &'static str,
        limit: u64,
        attempted: u64,
    },

    #[error("proposed {resource} limit {proposed} exceeds physical capacity {physical} on node {node}")]
    ExceedsPhysical {
        node: String,
        resource: &'static str,
        proposed: u64,
        physical: u64,
    },

    #[error("unexpected payload shape from {path}: {message}")]
    MalformedPayload {
        path: String,
        message: String,
    },

    #[error("missing required field: {field}")]
    MissingField {
        field: &'static str,
    },
}

// Result type alias for convenience
pub type GatewayResult<T> = Result<T, GatewayError>;

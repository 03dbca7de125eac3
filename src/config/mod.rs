pub mod settings;

pub use settings::{NodeLimit, ResourceRange, Settings, SettingsSnapshot, VmLimits};

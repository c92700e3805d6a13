use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;

/// Settings of the intake side of the service.
///
/// Read from `config/default.toml`, then `config/local.toml`, then
/// `PULSESTORE__<SECTION>__<KEY>` environment variables. Missing values keep
/// their defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceSettings {
    #[serde(default)]
    pub intake: IntakeSettings,
    #[serde(default)]
    pub drain: DrainSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntakeSettings {
    /// Queue length beyond which a sensor is drained with priority; also the
    /// size of one drained batch.
    pub max_batch_size: usize,
    /// Milliseconds after which an undrained sensor overrides every other.
    pub max_time_millis: u64,
    pub mailbox_capacity: usize,
}

impl Default for IntakeSettings {
    fn default() -> Self {
        Self {
            max_batch_size: crate::queue_map::DEFAULT_MAX_BATCH_SIZE,
            max_time_millis: crate::queue_map::DEFAULT_MAX_AGE.as_millis() as u64,
            mailbox_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DrainSettings {
    /// Run the durable writer
    pub enabled: bool,
    /// Milliseconds to wait after an empty or failed pull
    pub pull_delay_ms: u64,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pull_delay_ms: 100,
        }
    }
}

impl ServiceSettings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_dir(Path::new("config"))
    }

    pub fn from_dir(config_dir: &Path) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Start with default settings
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local overrides
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("PULSESTORE")
                    .prefix_separator("__")
                    .separator("__"),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn setup() {
        INIT.call_once(|| {
            std::env::set_var("PULSESTORE__DRAIN__PULL_DELAY_MS", "250");
        });
    }

    #[test]
    fn test_default_settings() {
        let settings = ServiceSettings::default();
        assert_eq!(settings.intake.max_batch_size, 1000);
        assert_eq!(settings.intake.max_time_millis, 5000);
        assert!(settings.drain.enabled);
    }

    #[test]
    fn test_missing_files_fall_back_to_defaults() {
        let settings = ServiceSettings::from_dir(Path::new("does/not/exist")).unwrap();
        assert_eq!(settings.intake.mailbox_capacity, 1024);
    }

    #[test]
    fn test_environment_override() {
        setup();
        let settings = ServiceSettings::from_dir(Path::new("does/not/exist")).unwrap();
        assert_eq!(settings.drain.pull_delay_ms, 250);
    }
}

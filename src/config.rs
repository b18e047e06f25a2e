//! Daemon configuration, read from a TOML file with every field defaulted.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::output::{LogDriver, OutputDriver, SysfsPwmDriver};
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Fixed offset from UTC, without daylight saving
    pub utc_offset_secs: i64,
    /// Seconds between two ticks of the schedule loop
    pub tick_interval_secs: u64,
    /// Image file holding the persisted record
    pub store_path: PathBuf,
    /// Record address inside the image
    pub store_address: usize,
    /// HTTP listen address
    pub listen: String,
    /// Password required on every schedule submission. Empty rejects all.
    pub gatekeeper: String,
    /// Serves `/debug` for writing raw PWM duty to the outputs
    pub debug_page: bool,
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            utc_offset_secs: 3600,
            tick_interval_secs: 60,
            store_path: PathBuf::from("nightlight.eeprom"),
            store_address: 0,
            listen: "0.0.0.0:80".to_string(),
            gatekeeper: String::new(),
            debug_page: false,
            output: OutputConfig::default(),
        }
    }
}

/// Selects the output backend
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum OutputConfig {
    /// Log duty changes only
    #[default]
    Log,
    /// Linux sysfs PWM channels
    Sysfs {
        day_pwm: PathBuf,
        night_pwm: PathBuf,
        #[serde(default = "default_period_ns")]
        period_ns: u64,
    },
}

// 1 kHz
fn default_period_ns() -> u64 {
    1_000_000
}

impl Config {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_secs == 0 {
            return Err(Error::Config("tick_interval_secs must be positive".into()));
        }
        if self.utc_offset_secs.abs() > 14 * 3600 {
            return Err(Error::Config(format!(
                "utc_offset_secs {} is not a real UTC offset",
                self.utc_offset_secs
            )));
        }
        Ok(())
    }

    /// Builds the configured output driver
    pub fn build_driver(&self) -> Result<Box<dyn OutputDriver + Send>> {
        Ok(match &self.output {
            OutputConfig::Log => Box::new(LogDriver::new()),
            OutputConfig::Sysfs {
                day_pwm,
                night_pwm,
                period_ns,
            } => Box::new(SysfsPwmDriver::new(day_pwm, night_pwm, *period_ns)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.utc_offset_secs, 3600);
        assert_eq!(config.tick_interval_secs, 60);
        assert_eq!(config.listen, "0.0.0.0:80");
        assert!(config.gatekeeper.is_empty());
        assert!(!config.debug_page);
        assert_eq!(config.output, OutputConfig::Log);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let file = write_config(
            "gatekeeper = \"hunter2\"\nlisten = \"127.0.0.1:8080\"\ndebug_page = true\n",
        );
        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.gatekeeper, "hunter2");
        assert!(config.debug_page);
        assert_eq!(config.listen, "127.0.0.1:8080");
        assert_eq!(config.tick_interval_secs, 60);
    }

    #[test]
    fn test_sysfs_backend() {
        let file = write_config(
            "[output]\nbackend = \"sysfs\"\nday_pwm = \"/sys/class/pwm/pwmchip0/pwm0\"\nnight_pwm = \"/sys/class/pwm/pwmchip0/pwm1\"\n",
        );
        let config = Config::load_from(file.path()).unwrap();
        match config.output {
            OutputConfig::Sysfs { period_ns, .. } => assert_eq!(period_ns, 1_000_000),
            other => panic!("unexpected backend {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_files() {
        let file = write_config("tick_interval_secs = \"soon\"\n");
        assert!(matches!(Config::load_from(file.path()), Err(Error::Config(_))));

        let file = write_config("tick_interval_secs = 0\n");
        assert!(matches!(Config::load_from(file.path()), Err(Error::Config(_))));

        assert!(matches!(
            Config::load_from("/nonexistent/nightlight.toml"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_log_driver_builds() {
        let mut driver = Config::default().build_driver().unwrap();
        assert!(driver.set(crate::schedule::Channel::Day, 50).is_ok());
    }
}

//! Daemon configuration: typed tunables loaded from a TOML file.
//!
//! The on-disk *format* (an INI file parsed by hand) is out of scope per
//! the purpose statement; what is in scope is a typed surface for the
//! daemon's own knobs. Grounded in the config loader pattern of
//! `Yuvan-1166-PhoneConnect` (`dirs::config_dir` + `toml` + `serde`), with
//! documented defaults for every field instead of a single placeholder.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, Error, Result};

/// Default local HF feature bitmap (§6.3): echo-cancellation | call-waiting
/// | CLI | voice-recog | remote-volume-ctl.
pub const DEFAULT_LOCAL_FEATURES: u32 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Local Bluetooth adapter address to bind the RFCOMM/SCO listeners to.
    /// `None` lets the kernel pick the first available adapter.
    pub local_address: Option<String>,

    /// Local HF feature bitmap advertised in `AT+BRSF` and the SDP record.
    pub local_features: u32,

    /// Auto-reconnect delay after an involuntary RFCOMM drop, per §7.
    #[serde(with = "duration_secs")]
    pub reconnect_timeout: Duration,

    /// `RING`-without-`+CIEV` callsetup emulation timer, §4.4.
    #[serde(with = "duration_secs")]
    pub ring_timeout: Duration,

    /// Outbound dial/`+CCWA` callsetup emulation timer, §4.4.
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// Pump watchdog strike count before declaring `WatchdogTimeout`, §4.7.
    pub watchdog_strikes: u32,

    /// Optional hint forwarded to the pump's configuration derivation.
    pub packet_interval_ms: Option<u32>,
    /// Optional hint forwarded to the pump's configuration derivation.
    pub min_buffer_fill_ms: Option<u32>,
    /// Optional hint forwarded to the pump's configuration derivation.
    pub jitter_window_ms: Option<u32>,

    /// Local sound card driver selection; "null" is always available.
    pub sound_driver: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            local_address: None,
            local_features: DEFAULT_LOCAL_FEATURES,
            reconnect_timeout: Duration::from_secs(15),
            ring_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(20),
            watchdog_strikes: 2,
            packet_interval_ms: None,
            min_buffer_fill_ms: None,
            jitter_window_ms: None,
            sound_driver: "null".to_string(),
        }
    }
}

impl Config {
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hfp-hf")
            .join("config.toml")
    }

    /// Loads the config at the default path, falling back to defaults if
    /// the file does not exist.
    pub fn load_or_default() -> Result<Self> {
        Self::load(&Self::path())
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Configuration(ConfigError::NoKernelSupport(e.to_string())))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Configuration(ConfigError::BadScoConfig(e.to_string())))?;
        Ok(config)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Configuration(ConfigError::NoKernelSupport(e.to_string())))?;
        }
        let rendered = toml::to_string_pretty(self).expect("config must serialise");
        fs::write(path, rendered)
            .map_err(|e| Error::Configuration(ConfigError::NoKernelSupport(e.to_string())))?;
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.local_features, 15);
        assert_eq!(config.reconnect_timeout, Duration::from_secs(15));
        assert_eq!(config.ring_timeout, Duration::from_secs(5));
        assert_eq!(config.dial_timeout, Duration::from_secs(20));
        assert_eq!(config.watchdog_strikes, 2);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.local_features, config.local_features);
        assert_eq!(parsed.sound_driver, config.sound_driver);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load(std::path::Path::new("/nonexistent/hfp-hf/config.toml")).unwrap();
        assert_eq!(config.local_features, DEFAULT_LOCAL_FEATURES);
    }
}

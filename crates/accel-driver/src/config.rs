//! Runtime configuration for a device link

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;
use vs4l_abi::param::{
    self, SocFrequencies, MAX_REQUEST_SIZE, VERTEX_DEVICE_PATH, VS4L_TIMER_INTERVAL_SEC,
    VS4L_TIMER_TIMEOUT_SEC,
};

/// Default preset scenario file on the vendor partition
pub const DEFAULT_PRESET_FILE: &str = "/vendor/etc/enn/uenn_preset.json";

/// Link configuration
///
/// `Default` gives production values. [`LinkConfig::from_env`] lets a board
/// bring-up override them without a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Vertex device node
    pub device_path: PathBuf,
    /// Request slots per session
    pub max_request_size: usize,
    /// Watchdog deadline per VS4L call
    pub timer_timeout: Duration,
    /// Watchdog warning interval
    pub timer_interval: Duration,
    /// Frequency ceilings used for boost
    pub max_freq: SocFrequencies,
    /// Frequencies used for boost-on-execute
    pub tuned_freq: SocFrequencies,
    /// Preset scenario file
    pub preset_file: PathBuf,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from(VERTEX_DEVICE_PATH),
            max_request_size: MAX_REQUEST_SIZE,
            timer_timeout: Duration::from_secs(VS4L_TIMER_TIMEOUT_SEC),
            timer_interval: Duration::from_secs(VS4L_TIMER_INTERVAL_SEC),
            max_freq: param::TARGET_MAX_FREQ[0],
            tuned_freq: param::TARGET_TUNED_FREQ[0],
            preset_file: PathBuf::from(DEFAULT_PRESET_FILE),
        }
    }
}

impl LinkConfig {
    /// Defaults overridden by `ACCEL_DEVICE`, `ACCEL_MAX_REQUESTS`,
    /// `ACCEL_TIMEOUT_MS`, `ACCEL_PRESET_FILE` and `ACCEL_SOC`
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("ACCEL_DEVICE") {
            config.device_path = PathBuf::from(path);
        }
        if let Some(n) = parse_env::<usize>("ACCEL_MAX_REQUESTS") {
            if n > 0 {
                config.max_request_size = n;
            } else {
                warn!("ACCEL_MAX_REQUESTS must be positive, keeping {MAX_REQUEST_SIZE}");
            }
        }
        if let Some(ms) = parse_env::<u64>("ACCEL_TIMEOUT_MS") {
            config.timer_timeout = Duration::from_millis(ms);
        }
        if let Ok(path) = std::env::var("ACCEL_PRESET_FILE") {
            config.preset_file = PathBuf::from(path);
        }
        if let Some(soc) = parse_env::<u32>("ACCEL_SOC") {
            match (
                param::soc_frequencies(param::TARGET_MAX_FREQ, soc),
                param::soc_frequencies(param::TARGET_TUNED_FREQ, soc),
            ) {
                (Some(max), Some(tuned)) => {
                    config.max_freq = *max;
                    config.tuned_freq = *tuned;
                }
                _ => warn!("Unknown SoC {soc}, keeping {}", config.max_freq.soc),
            }
        }

        config
    }

    /// Shorter watchdog, for tests and bring-up
    #[must_use]
    pub fn with_timer(mut self, timeout: Duration, interval: Duration) -> Self {
        self.timer_timeout = timeout;
        self.timer_interval = interval;
        self
    }

    /// Different ring capacity
    #[must_use]
    pub fn with_max_request_size(mut self, n: usize) -> Self {
        self.max_request_size = n;
        self
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring {name}={raw}: not a number");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_production_board() {
        let config = LinkConfig::default();
        assert_eq!(config.device_path, PathBuf::from("/dev/vertex10"));
        assert_eq!(config.max_request_size, 16);
        assert_eq!(config.timer_timeout, Duration::from_secs(20));
        assert_eq!(config.timer_interval, Duration::from_secs(1));
        assert_eq!(config.max_freq.cl1_max, 2_304_000);
    }

    #[test]
    fn builders_override_fields() {
        let config = LinkConfig::default()
            .with_timer(Duration::from_millis(50), Duration::from_millis(10))
            .with_max_request_size(4);
        assert_eq!(config.timer_timeout, Duration::from_millis(50));
        assert_eq!(config.max_request_size, 4);
    }
}

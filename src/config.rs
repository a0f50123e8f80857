use crate::calls::VideoPreference;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Tunables for the call coordinator and session driver.
///
/// Durations are given in milliseconds when loaded from JSON. Every field is
/// optional there and falls back to [`CallConfig::default`].
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CallConfig {
    /// How long an incoming call rings before it is rejected with `Timeout`.
    #[serde(with = "millis")]
    pub ring_timeout: Duration,
    /// Upper bound for peer-connection factory creation.
    #[serde(with = "millis")]
    pub factory_timeout: Duration,
    /// Grace period before the "connection problem" sound after a transport drop.
    #[serde(with = "millis")]
    pub problem_sound_delay: Duration,
    /// Busy tone length plus a small budget, after which a rejected outgoing call disconnects.
    #[serde(with = "millis")]
    pub busy_disconnect_delay: Duration,
    /// Maximum wait for the quality lock when rendering debug stats.
    #[serde(with = "millis")]
    pub stats_lock_timeout: Duration,
    /// Frames must stall this long before incoming video counts as stopped.
    #[serde(with = "millis")]
    pub frame_stop_threshold: Duration,
    pub recent_call_ids_capacity: usize,
    /// Number of historical call records per contact consulted by missed-call detection.
    pub missed_call_lookback: usize,
    pub calls_enabled: bool,
    pub video_calls_enabled: bool,
    /// Always relay media, regardless of contact verification.
    pub force_turn: bool,
    pub allow_ipv6: bool,
    pub video_preference: VideoPreference,
    pub video_hardware_acceleration: bool,
}

impl std::fmt::Debug for CallConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallConfig")
            .field("ring_timeout", &self.ring_timeout)
            .field("factory_timeout", &self.factory_timeout)
            .field("calls_enabled", &self.calls_enabled)
            .field("video_calls_enabled", &self.video_calls_enabled)
            .field("force_turn", &self.force_turn)
            .field("allow_ipv6", &self.allow_ipv6)
            .field("video_preference", &self.video_preference)
            .finish_non_exhaustive()
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
            factory_timeout: Duration::from_secs(10),
            problem_sound_delay: Duration::from_secs(1),
            // busy tone is 4 x 1s
            busy_disconnect_delay: Duration::from_millis(4050),
            stats_lock_timeout: Duration::from_millis(50),
            frame_stop_threshold: Duration::from_secs(1),
            recent_call_ids_capacity: 64,
            missed_call_lookback: 4,
            calls_enabled: true,
            video_calls_enabled: true,
            force_turn: false,
            allow_ipv6: true,
            video_preference: VideoPreference::Auto,
            video_hardware_acceleration: true,
        }
    }
}

impl CallConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

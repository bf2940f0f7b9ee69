//! # Settings
//!
//! Immutable configuration values for endpoints, heartbeats, the watchdog and
//! the silo. All of them deserialize from JSON with every field optional.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid setting `{field}`: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

fn invalid(field: &'static str, message: impl Into<String>) -> SettingsError {
    SettingsError::Invalid { field, message: message.into() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Name announced during the connection handshake.
    pub name: String,
    /// Upper bound for a single call; expiry surfaces as a lost connection.
    pub call_timeout: Duration,
    pub connect_timeout: Duration,
    /// Shared secret. When set, peers must prove knowledge of it.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub max_frame_len: usize,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            name: "grainrun".to_string(),
            call_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            secret: None,
            max_frame_len: grainrpc::DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl EndpointSettings {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(invalid("call_timeout", "must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout", "must be greater than zero"));
        }
        if self.max_frame_len < 1024 {
            return Err(invalid("max_frame_len", "must be at least 1024 bytes"));
        }
        if self.secret.as_deref() == Some("") {
            return Err(invalid("secret", "must not be empty when set"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval: Duration,
    /// Number of intervals that may pass without an answer before the
    /// remote side is declared dead.
    pub skipped_heartbeat_threshold: u32,
    /// Whether a timed out beat counts while a debugger is attached.
    pub report_with_debugger: bool,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            skipped_heartbeat_threshold: 10,
            report_with_debugger: false,
        }
    }
}

impl HeartbeatSettings {
    /// `interval + threshold * interval`, saturating at `Duration::MAX`.
    pub fn failure_interval(&self) -> Duration {
        self.checked_failure_interval().unwrap_or(Duration::MAX)
    }

    fn checked_failure_interval(&self) -> Option<Duration> {
        self.interval
            .checked_mul(self.skipped_heartbeat_threshold)?
            .checked_add(self.interval)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(invalid("interval", "must be greater than zero"));
        }
        if self.skipped_heartbeat_threshold == 0 {
            return Err(invalid("skipped_heartbeat_threshold", "must be at least 1"));
        }
        if self.checked_failure_interval().is_none() {
            return Err(invalid("interval", "failure interval overflows"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureSettings {
    /// Time allowed to connect to a freshly started worker.
    pub endpoint_connect_timeout: Duration,
    pub heartbeat: HeartbeatSettings,
}

impl Default for FailureSettings {
    fn default() -> Self {
        Self {
            endpoint_connect_timeout: Duration::from_secs(2),
            heartbeat: HeartbeatSettings::default(),
        }
    }
}

impl FailureSettings {
    pub fn validate(&self) -> Result<()> {
        if self.endpoint_connect_timeout.is_zero() {
            return Err(invalid("endpoint_connect_timeout", "must be greater than zero"));
        }
        self.heartbeat.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub executable: PathBuf,
    /// Passed after the parent process id.
    pub args: Vec<String>,
    /// Time allowed for the worker to print its ready marker.
    pub ready_timeout: Duration,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("grain-host"),
            args: Vec::new(),
            ready_timeout: Duration::from_secs(10),
        }
    }
}

impl WatchdogSettings {
    pub fn for_executable(executable: impl Into<PathBuf>) -> Self {
        Self { executable: executable.into(), ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if self.executable.as_os_str().is_empty() {
            return Err(invalid("executable", "must not be empty"));
        }
        if self.ready_timeout.is_zero() {
            return Err(invalid("ready_timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiloSettings {
    pub endpoint: EndpointSettings,
    pub watchdog: WatchdogSettings,
    pub failure: FailureSettings,
}

impl SiloSettings {
    pub fn for_executable(executable: impl Into<PathBuf>) -> Self {
        Self {
            watchdog: WatchdogSettings::for_executable(executable),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint.validate()?;
        self.watchdog.validate()?;
        self.failure.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_interval_counts_skipped_beats() {
        let settings = HeartbeatSettings {
            interval: Duration::from_millis(100),
            skipped_heartbeat_threshold: 4,
            ..HeartbeatSettings::default()
        };
        assert_eq!(settings.failure_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_defaults() {
        let settings = SiloSettings::default();
        assert_eq!(settings.endpoint.call_timeout, Duration::from_secs(30));
        assert_eq!(settings.failure.heartbeat.failure_interval(), Duration::from_secs(11));
        assert!(!settings.failure.heartbeat.report_with_debugger);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let settings = SiloSettings::from_json(
            r#"{ "watchdog": { "executable": "/opt/worker" },
                 "failure": { "heartbeat": { "skipped_heartbeat_threshold": 3 } } }"#,
        )
        .unwrap();

        assert_eq!(settings.watchdog.executable, PathBuf::from("/opt/worker"));
        assert_eq!(settings.failure.heartbeat.skipped_heartbeat_threshold, 3);
        assert_eq!(settings.failure.heartbeat.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_threshold_is_rejected() {
        let result = SiloSettings::from_json(
            r#"{ "failure": { "heartbeat": { "skipped_heartbeat_threshold": 0 } } }"#,
        );
        assert!(matches!(
            result,
            Err(SettingsError::Invalid { field: "skipped_heartbeat_threshold", .. })
        ));
    }

    #[test]
    fn test_overflowing_failure_interval_is_rejected() {
        let settings = HeartbeatSettings {
            interval: Duration::from_secs(1 << 62),
            skipped_heartbeat_threshold: 10,
            ..HeartbeatSettings::default()
        };

        assert_eq!(settings.failure_interval(), Duration::MAX);
        assert!(matches!(settings.validate(), Err(SettingsError::Invalid { field: "interval", .. })));
    }

    #[test]
    fn test_secret_is_never_serialized() {
        let settings = EndpointSettings {
            secret: Some("hunter2".into()),
            ..EndpointSettings::default()
        };
        let json = serde_json::to_string(&settings).unwrap();
        assert!(!json.contains("hunter2"));
    }
}

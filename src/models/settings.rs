// Settings Model
// Service-wide configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::device::{DeviceConfig, StreamMode};
use crate::services::{RetryPolicy, ShellConfig, StopPolicy};

fn default_max_parallel_streams() -> usize {
    1
}

fn default_inactivity_timeout_secs() -> u64 {
    8
}

fn default_frame_inactivity_timeout_secs() -> u64 {
    0
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

fn default_login_shell() -> bool {
    true
}

fn default_terminate_grace_ms() -> u64 {
    2000
}

fn default_clean_retries() -> u32 {
    5
}

fn default_clean_interval_secs() -> u64 {
    1
}

fn default_ready_retries() -> u32 {
    20
}

fn default_ready_interval_secs() -> u64 {
    2
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8010
}

/// Service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Global ceiling on concurrently running streams, shared by both modes
    #[serde(default = "default_max_parallel_streams")]
    pub max_parallel_streams: usize,

    /// Segment streams without a download for this long are stopped (0 disables)
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,

    /// Same for frame streams; disabled by default since frames are pushed, not pulled
    #[serde(default = "default_frame_inactivity_timeout_secs")]
    pub frame_inactivity_timeout_secs: u64,

    #[serde(default = "default_shell")]
    pub shell: String,

    #[serde(default = "default_login_shell")]
    pub login_shell: bool,

    /// Time between SIGTERM and SIGKILL when stopping a process
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,

    #[serde(default = "default_clean_retries")]
    pub clean_retries: u32,

    #[serde(default = "default_clean_interval_secs")]
    pub clean_interval_secs: u64,

    #[serde(default = "default_ready_retries")]
    pub ready_retries: u32,

    #[serde(default = "default_ready_interval_secs")]
    pub ready_interval_secs: u64,

    /// Whether a stop waits for the last consumer or tears down immediately
    #[serde(default)]
    pub stop_policy: StopPolicy,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_parallel_streams: default_max_parallel_streams(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            frame_inactivity_timeout_secs: default_frame_inactivity_timeout_secs(),
            shell: default_shell(),
            login_shell: default_login_shell(),
            terminate_grace_ms: default_terminate_grace_ms(),
            clean_retries: default_clean_retries(),
            clean_interval_secs: default_clean_interval_secs(),
            ready_retries: default_ready_retries(),
            ready_interval_secs: default_ready_interval_secs(),
            stop_policy: StopPolicy::default(),
            data_dir: default_data_dir(),
            host: default_host(),
            port: default_port(),
            devices: Vec::new(),
        }
    }
}

impl Settings {
    pub fn shell_config(&self) -> ShellConfig {
        ShellConfig {
            shell: PathBuf::from(&self.shell),
            login: self.login_shell,
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
        }
    }

    pub fn clean_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.clean_retries, Duration::from_secs(self.clean_interval_secs))
    }

    pub fn ready_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.ready_retries, Duration::from_secs(self.ready_interval_secs))
    }

    /// Idle timeout for a mode, `None` when disabled
    pub fn inactivity_timeout(&self, mode: StreamMode) -> Option<Duration> {
        let secs = match mode {
            StreamMode::Frames => self.frame_inactivity_timeout_secs,
            StreamMode::Segments => self.inactivity_timeout_secs,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Directory holding one sub-directory of segments per device
    pub fn segments_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("segments")
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id == device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.clean_policy(), RetryPolicy::directory_clean());
        assert_eq!(settings.ready_policy(), RetryPolicy::stream_ready());
    }

    #[test]
    fn test_zero_timeout_disables_eviction() {
        let settings = Settings::default();
        assert_eq!(
            settings.inactivity_timeout(StreamMode::Segments),
            Some(Duration::from_secs(8))
        );
        assert_eq!(settings.inactivity_timeout(StreamMode::Frames), None);
    }

    #[test]
    fn test_stop_policy_parses_camel_case() {
        let settings: Settings = serde_json::from_str(r#"{"stopPolicy":"immediate"}"#).unwrap();
        assert_eq!(settings.stop_policy, StopPolicy::Immediate);
        assert_eq!(Settings::default().stop_policy, StopPolicy::RefCounted);
    }

    #[test]
    fn test_device_lookup() {
        let settings: Settings = serde_json::from_str(
            r#"{"devices":[{"id":"cam1","command":"true","mode":"segments"}]}"#,
        )
        .unwrap();
        assert_eq!(settings.device("cam1").map(|d| d.mode), Some(StreamMode::Segments));
        assert!(settings.device("cam2").is_none());
    }
}

// Device Model
// A capture device and the command that produces its stream

use serde::{Deserialize, Serialize};

/// How a device's process output is consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Raw MJPEG on stdout, split into frames
    #[default]
    Frames,
    /// HLS segments and playlist written to the device directory
    Segments,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Frames => "frames",
            StreamMode::Segments => "segments",
        }
    }
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device known to the service.
///
/// `command` is already fully resolved (no templating happens here) and is
/// run through the configured shell as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub mode: StreamMode,
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, command: impl Into<String>, mode: StreamMode) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            mode,
        }
    }
}

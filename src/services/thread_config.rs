// Thread Configuration Service
// Named, prioritised thread spawning for stream session workers.
// Uses thread-priority crate for OS-level priority hints.
// Falls back gracefully to normal priority if OS rejects the request.

use thread_priority::{set_current_thread_priority, ThreadPriority};

/// Classification of the threads a stream session runs.
/// Each kind maps to an appropriate OS thread priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionThreadKind {
    /// Reads process stdout and extracts frames (latency-critical)
    FrameDecoder,
    /// Forwards process stderr to the log
    StderrReader,
    /// Inactivity sweeps
    Monitor,
    /// Stops one evicted session off the sweep thread
    Teardown,
}

impl SessionThreadKind {
    /// Spawn a named thread with appropriate priority.
    /// Falls back to normal priority if the OS rejects the request.
    pub fn spawn<F, T>(self, name: &str, f: F) -> std::io::Result<std::thread::JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let priority = self.priority();
        let thread_name = name.to_string();
        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                if let Err(e) = set_current_thread_priority(priority) {
                    log::debug!("Thread '{}': priority not set: {:?}", thread_name, e);
                }
                f()
            })
    }

    fn priority(&self) -> ThreadPriority {
        match self {
            Self::FrameDecoder => ThreadPriority::Max,
            Self::StderrReader | Self::Monitor | Self::Teardown => ThreadPriority::Min,
        }
    }

    /// Human-readable label for thread names and logging
    pub fn label(&self) -> &'static str {
        match self {
            Self::FrameDecoder => "frame-decoder",
            Self::StderrReader => "stderr-reader",
            Self::Monitor => "monitor",
            Self::Teardown => "teardown",
        }
    }

    /// Thread name for a device-scoped worker, e.g. `frame-decoder:cam1`
    pub fn thread_name(&self, device_id: &str) -> String {
        format!("{}:{}", self.label(), device_id)
    }
}

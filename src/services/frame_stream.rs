// Frame Stream Service
// Runs capture commands that write MJPEG to stdout and delivers each JPEG frame to a callback

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use super::error::{StreamError, StreamResult};
use super::events::EventSink;
use super::frame_decoder::{run_decoder, DecoderExit, FrameCallback, FrameDecoder};
use super::process_supervisor::{ensure_supported_platform, ManagedProcess, OutputMode, ShellConfig};
use super::session_registry::{SessionInfo, Supervised};
use super::stream_core::{CoreConfig, StartOutcome, StopOutcome, StreamCore};
use super::thread_config::SessionThreadKind;
use crate::models::{DeviceConfig, Settings, StreamMode};

#[derive(Debug, Clone)]
pub struct FrameStreamConfig {
    pub core: CoreConfig,
    pub shell: ShellConfig,
}

impl FrameStreamConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            core: CoreConfig::from_settings(settings, StreamMode::Frames),
            shell: settings.shell_config(),
        }
    }
}

/// A capture process plus the thread decoding its stdout
struct FrameSession {
    device_id: String,
    process: Arc<ManagedProcess>,
    stop: Arc<AtomicBool>,
    decoder: Mutex<Option<JoinHandle<DecoderExit>>>,
}

impl FrameSession {
    fn launch(device: &DeviceConfig, shell: &ShellConfig, on_frame: FrameCallback) -> StreamResult<Self> {
        let process = Arc::new(ManagedProcess::spawn(
            &device.id,
            &device.command,
            None,
            OutputMode::Piped,
            shell,
        )?);

        let mut stdout = process.take_stdout().ok_or_else(|| {
            StreamError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "process stdout was not captured",
            ))
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let kind = SessionThreadKind::FrameDecoder;
        let decoder = kind.spawn(&kind.thread_name(&device.id), {
            let process = Arc::clone(&process);
            let stop = Arc::clone(&stop);
            let device_id = device.id.clone();
            move || {
                let mut decoder = FrameDecoder::new();
                let exit = run_decoder(&mut stdout, &mut decoder, &stop, &on_frame, &device_id);
                if let DecoderExit::Failed(e) = &exit {
                    log::warn!("[Stream:{}] Decoder failed, stopping process: {}", device_id, e);
                    process.terminate();
                }
                exit
            }
        })?;

        Ok(Self {
            device_id: device.id.clone(),
            process,
            stop,
            decoder: Mutex::new(Some(decoder)),
        })
    }

    fn decoder_running(&self) -> bool {
        self.decoder
            .lock()
            .map(|decoder| decoder.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

impl Supervised for FrameSession {
    fn is_alive(&self) -> bool {
        self.process.is_alive() && self.decoder_running()
    }

    fn terminate(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.process.terminate();

        let handle = self
            .decoder
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        // A frame callback that stops its own stream runs on the decoder thread
        if handle.thread().id() == thread::current().id() {
            return;
        }
        match handle.join() {
            Ok(exit) => log::debug!("[Stream:{}] Decoder finished: {:?}", self.device_id, exit),
            Err(_) => log::warn!("[Stream:{}] Decoder thread panicked", self.device_id),
        }
    }
}

/// Frame-mode stream service
pub struct FrameStreamService {
    core: StreamCore,
    shell: ShellConfig,
}

impl FrameStreamService {
    pub fn new(config: FrameStreamConfig, events: Arc<dyn EventSink>) -> StreamResult<Self> {
        ensure_supported_platform(&config.shell.shell)?;
        let core = StreamCore::new(StreamMode::Frames, &config.core, events, None)?;
        Ok(Self {
            core,
            shell: config.shell,
        })
    }

    /// Start streaming `device`, or join its running stream.
    ///
    /// Frames go to the callback of the consumer that launched the process;
    /// `on_frame` of a joining consumer is not used.
    pub fn start(&self, device: &DeviceConfig, on_frame: FrameCallback) -> StreamResult<StartOutcome> {
        let shell = &self.shell;
        self.core.start(&device.id, || {
            let session = FrameSession::launch(device, shell, on_frame)?;
            Ok(Arc::new(session) as Arc<dyn Supervised>)
        })
    }

    pub fn stop(&self, device_id: &str) -> StreamResult<StopOutcome> {
        self.core.stop(device_id)
    }

    pub fn keep_alive(&self, device_id: &str) -> StreamResult<()> {
        self.core.keep_alive(device_id)
    }

    pub fn add_consumer(&self, device_id: &str) -> StreamResult<usize> {
        self.core.add_consumer(device_id)
    }

    pub fn is_streaming(&self, device_id: &str) -> bool {
        self.core.is_streaming(device_id)
    }

    pub fn can_start_more(&self) -> bool {
        self.core.can_admit()
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.core.active_sessions()
    }

    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

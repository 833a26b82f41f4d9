// Segment Stream Service
// Runs commands that write HLS segments into a per-device directory.
// A stream counts as started once the directory holds its first files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::error::{StreamError, StreamResult};
use super::events::EventSink;
use super::path_validator::{resolve_segment_file, validate_device_id, SEGMENT_EXTENSIONS};
use super::process_supervisor::{ensure_supported_platform, ManagedProcess, OutputMode, ShellConfig};
use super::retry::{self, RetryPolicy};
use super::session_registry::{SessionInfo, Supervised};
use super::stream_core::{CoreConfig, StartOutcome, StopOutcome, StreamCore, TeardownHook};
use crate::models::{DeviceConfig, Settings, StreamMode};

/// Segment or playlist files required before a stream is ready
pub const READY_FILE_COUNT: usize = 2;

#[derive(Debug, Clone)]
pub struct SegmentStreamConfig {
    pub core: CoreConfig,
    pub shell: ShellConfig,
    /// Parent of the per-device directories
    pub base_dir: PathBuf,
    pub clean_policy: RetryPolicy,
    pub ready_policy: RetryPolicy,
}

impl SegmentStreamConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            core: CoreConfig::from_settings(settings, StreamMode::Segments),
            shell: settings.shell_config(),
            base_dir: settings.segments_dir(),
            clean_policy: settings.clean_policy(),
            ready_policy: settings.ready_policy(),
        }
    }
}

/// Segment-mode stream service
pub struct SegmentStreamService {
    core: StreamCore,
    shell: ShellConfig,
    base_dir: PathBuf,
    clean_policy: RetryPolicy,
    ready_policy: RetryPolicy,
}

impl SegmentStreamService {
    pub fn new(config: SegmentStreamConfig, events: Arc<dyn EventSink>) -> StreamResult<Self> {
        ensure_supported_platform(&config.shell.shell)?;
        fs::create_dir_all(&config.base_dir)?;

        let after_teardown: TeardownHook = {
            let base_dir = config.base_dir.clone();
            let clean_policy = config.clean_policy;
            Arc::new(move |device_id: &str| {
                let dir = base_dir.join(device_id);
                if let Err(e) = clean_directory(&dir, clean_policy) {
                    log::warn!("[Stream:{}] Could not clean {}: {}", device_id, dir.display(), e);
                }
            })
        };

        let core = StreamCore::new(StreamMode::Segments, &config.core, events, Some(after_teardown))?;
        Ok(Self {
            core,
            shell: config.shell,
            base_dir: config.base_dir,
            clean_policy: config.clean_policy,
            ready_policy: config.ready_policy,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn device_dir(&self, device_id: &str) -> PathBuf {
        self.base_dir.join(device_id)
    }

    /// Start streaming `device` into its directory, or join the running stream.
    ///
    /// Blocks until the first segment files appear. On any failure the process
    /// is stopped and the directory cleaned before the error is returned.
    pub fn start(&self, device: &DeviceConfig) -> StreamResult<StartOutcome> {
        validate_device_id(&device.id).map_err(StreamError::InvalidPath)?;
        self.core.start(&device.id, || {
            let process = self.launch(device)?;
            Ok(process as Arc<dyn Supervised>)
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

    /// Resolve a segment or playlist of a running stream and refresh its inactivity timer
    pub fn open_segment(&self, device_id: &str, file_name: &str) -> StreamResult<PathBuf> {
        self.core.keep_alive(device_id)?;
        resolve_segment_file(&self.device_dir(device_id), file_name).map_err(StreamError::InvalidPath)
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

    fn launch(&self, device: &DeviceConfig) -> StreamResult<Arc<ManagedProcess>> {
        let dir = self.device_dir(&device.id);
        fs::create_dir_all(&dir)?;
        clean_directory(&dir, self.clean_policy)?;

        let process = Arc::new(ManagedProcess::spawn(
            &device.id,
            &device.command,
            Some(&dir),
            OutputMode::Discard,
            &self.shell,
        )?);

        log::info!("[Stream:{}] Waiting for segments in {}", device.id, dir.display());
        let polled = retry::poll(self.ready_policy, || {
            !process.is_alive() || count_stream_files(&dir) >= READY_FILE_COUNT
        });

        let failure = match polled {
            Err(e) => Some(e),
            Ok(()) if count_stream_files(&dir) < READY_FILE_COUNT => {
                Some(StreamError::ProcessExited(device.id.clone()))
            }
            Ok(()) => None,
        };

        if let Some(e) = failure {
            log::warn!("[Stream:{}] Stream did not become ready: {}", device.id, e);
            process.terminate();
            if let Err(clean_err) = clean_directory(&dir, self.clean_policy) {
                log::warn!("[Stream:{}] Could not clean {}: {}", device.id, dir.display(), clean_err);
            }
            return Err(e);
        }

        log::info!("[Stream:{}] Segments available", device.id);
        Ok(process)
    }
}

/// Number of `.ts` / `.m3u8` files directly inside `dir`
pub fn count_stream_files(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| {
            entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| SEGMENT_EXTENSIONS.contains(&ext))
        })
        .count()
}

/// Empty `dir`, retrying while a dying process may still be writing into it.
/// A missing directory counts as clean.
pub fn clean_directory(dir: &Path, policy: RetryPolicy) -> StreamResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    retry::poll(policy, || {
        remove_entries(dir);
        is_empty_dir(dir)
    })
}

fn remove_entries(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        let removed = match entry.file_type() {
            Ok(t) if t.is_dir() => fs::remove_dir_all(&path),
            _ => fs::remove_file(&path),
        };
        match removed {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::debug!("Could not remove {}: {}", path.display(), e),
        }
    }
}

fn is_empty_dir(dir: &Path) -> bool {
    match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) => e.kind() == io::ErrorKind::NotFound,
    }
}


#[cfg(all(test, unix))]
mod service_tests {
    use super::*;
    use crate::services::events::{RecordingEventSink, STREAM_STARTED_EVENT, STREAM_STOPPED_EVENT};
    use crate::services::session_registry::{StopPolicy, StreamCapacity};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const WRITE_SEGMENTS: &str = "echo '#EXTM3U' > index.m3u8; echo seg > 000.ts; sleep 30";

    fn service(timeout: Option<Duration>) -> (SegmentStreamService, Arc<RecordingEventSink>, TempDir) {
        let temp = tempdir().unwrap();
        let events = Arc::new(RecordingEventSink::new());
        let config = SegmentStreamConfig {
            core: CoreConfig {
                capacity: StreamCapacity::new(1),
                policy: StopPolicy::RefCounted,
                inactivity_timeout: timeout,
                sweep_period: Duration::from_millis(50),
            },
            shell: ShellConfig {
                login: false,
                terminate_grace: Duration::from_millis(500),
                ..ShellConfig::default()
            },
            base_dir: temp.path().join("segments"),
            clean_policy: RetryPolicy::new(3, Duration::from_millis(20)),
            ready_policy: RetryPolicy::new(10, Duration::from_millis(100)),
        };
        let service = SegmentStreamService::new(config, Arc::clone(&events) as Arc<dyn EventSink>).unwrap();
        (service, events, temp)
    }

    #[test]
    fn test_start_waits_for_segments_and_stop_cleans() {
        let (service, events, _temp) = service(None);
        let dir = service.device_dir("cam1");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale.ts"), "old").unwrap();

        let device = DeviceConfig::new("cam1", WRITE_SEGMENTS, StreamMode::Segments);
        assert_eq!(service.start(&device).unwrap(), StartOutcome::Started);
        assert!(!dir.join("stale.ts").exists());
        assert!(count_stream_files(&dir) >= READY_FILE_COUNT);

        let playlist = service.open_segment("cam1", "index.m3u8").unwrap();
        assert!(playlist.ends_with("index.m3u8"));
        assert!(matches!(
            service.open_segment("cam1", "../cam2/index.m3u8"),
            Err(StreamError::InvalidPath(_))
        ));

        assert_eq!(service.stop("cam1").unwrap(), StopOutcome::Stopped);
        assert!(is_empty_dir(&dir));
        assert_eq!(events.count(STREAM_STARTED_EVENT), 1);
        assert_eq!(events.count(STREAM_STOPPED_EVENT), 1);
    }

    #[test]
    fn test_readiness_failure_frees_slot() {
        let (service, events, _temp) = service(None);
        let device = DeviceConfig::new("cam1", "echo only-one > 000.ts; sleep 30", StreamMode::Segments);

        let err = service.start(&device).unwrap_err();
        assert!(matches!(err, StreamError::RetriesExhausted { attempts: 10 }));
        assert!(!service.is_streaming("cam1"));
        assert!(service.can_start_more());
        assert!(is_empty_dir(&service.device_dir("cam1")));
        assert!(events.events().is_empty());
    }

    #[test]
    fn test_process_exit_before_ready_fails_fast() {
        let (service, _, _temp) = service(None);
        let device = DeviceConfig::new("cam1", "exit 1", StreamMode::Segments);

        let err = service.start(&device).unwrap_err();
        assert!(matches!(err, StreamError::ProcessExited(_)));
        assert!(service.can_start_more());
    }

    #[test]
    fn test_open_segment_keeps_stream_alive() {
        let (service, events, _temp) = service(Some(Duration::from_millis(400)));
        let device = DeviceConfig::new("cam1", WRITE_SEGMENTS, StreamMode::Segments);
        service.start(&device).unwrap();

        for _ in 0..6 {
            std::thread::sleep(Duration::from_millis(150));
            service.open_segment("cam1", "000.ts").unwrap();
        }
        assert!(service.is_streaming("cam1"));

        let start = std::time::Instant::now();
        while service.is_streaming("cam1") && start.elapsed() < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!service.is_streaming("cam1"));
        assert!(matches!(
            service.open_segment("cam1", "000.ts"),
            Err(StreamError::NotStreaming(_))
        ));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(events.count(STREAM_STOPPED_EVENT), 1);
    }

    #[test]
    fn test_invalid_device_id_is_rejected() {
        let (service, _, _temp) = service(None);
        let device = DeviceConfig::new("../escape", WRITE_SEGMENTS, StreamMode::Segments);
        assert!(matches!(service.start(&device), Err(StreamError::InvalidPath(_))));
    }
}

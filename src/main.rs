use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use chrono::{DateTime, Local};
use dashmap::DashMap;
use log::{LevelFilter, Log, Metadata, Record};
use serde::Serialize;
use serde_json::{json, Value};
use std::{
    env,
    fs::OpenOptions,
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::signal;

use streamkeeper::models::{DeviceConfig, Settings, StreamMode};
use streamkeeper::services::{
    apply_env_overrides, EventSink, FrameCallback, FrameStreamConfig, FrameStreamService,
    LogEventSink, SegmentStreamConfig, SegmentStreamService, SettingsManager, StartOutcome,
    StopOutcome, StreamCapacity, StreamError, StreamResult,
};

type ApiResponse = (StatusCode, Json<Value>);

// ============================================================================
// Logging
// ============================================================================

struct ServerLogger {
    file: Mutex<std::fs::File>,
    level: LevelFilter,
}

impl ServerLogger {
    fn new(log_dir: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let log_path = log_dir.join("streamkeeper.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        Ok(Self {
            file: Mutex::new(file),
            level: LevelFilter::Info,
        })
    }
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let date = timestamp.format("%Y-%m-%d");
        let time = timestamp.format("%H:%M:%S");
        let target = record.target();
        let level = record.level();
        let line = format!("[{date}][{time}][{target}][{level}] {}", record.args());

        if let Ok(mut file) = self.file.try_lock() {
            let _ = writeln!(file, "{line}");
        }
        eprintln!("{line}");
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

fn init_logger(log_dir: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let logger = ServerLogger::new(log_dir)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

// ============================================================================
// State
// ============================================================================

/// Frames seen for one device since the server started
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct FrameStats {
    frames: u64,
    last_frame_bytes: usize,
    last_frame_at: Option<DateTime<Local>>,
}

#[derive(Clone)]
struct AppState {
    settings: Arc<Settings>,
    frames: Arc<FrameStreamService>,
    segments: Arc<SegmentStreamService>,
    frame_stats: Arc<DashMap<String, FrameStats>>,
}

impl AppState {
    fn device(&self, device_id: &str) -> StreamResult<DeviceConfig> {
        self.settings
            .device(device_id)
            .cloned()
            .ok_or_else(|| StreamError::UnknownDevice(device_id.to_string()))
    }

    fn frame_callback(&self, device_id: &str) -> FrameCallback {
        let stats = Arc::clone(&self.frame_stats);
        let device_id = device_id.to_string();
        Arc::new(move |frame: Bytes| {
            let mut entry = stats.entry(device_id.clone()).or_default();
            entry.frames += 1;
            entry.last_frame_bytes = frame.len();
            entry.last_frame_at = Some(Local::now());
        })
    }

    fn start(&self, device_id: &str) -> StreamResult<StartOutcome> {
        let device = self.device(device_id)?;
        match device.mode {
            StreamMode::Frames => self.frames.start(&device, self.frame_callback(&device.id)),
            StreamMode::Segments => self.segments.start(&device),
        }
    }

    fn stop(&self, device_id: &str) -> StreamResult<StopOutcome> {
        match self.device(device_id)?.mode {
            StreamMode::Frames => self.frames.stop(device_id),
            StreamMode::Segments => self.segments.stop(device_id),
        }
    }

    fn keep_alive(&self, device_id: &str) -> StreamResult<()> {
        match self.device(device_id)?.mode {
            StreamMode::Frames => self.frames.keep_alive(device_id),
            StreamMode::Segments => self.segments.keep_alive(device_id),
        }
    }

    fn shutdown(&self) {
        self.frames.shutdown();
        self.segments.shutdown();
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn ok_response(data: Value) -> ApiResponse {
    (StatusCode::OK, Json(json!({ "ok": true, "data": data })))
}

fn error_response(err: StreamError) -> ApiResponse {
    let status = match &err {
        StreamError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        StreamError::NotStreaming(_) | StreamError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        StreamError::InvalidPath(_) => StatusCode::BAD_REQUEST,
        StreamError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if err.is_rejection() {
        log::info!("Request rejected: {}", err);
    } else {
        log::warn!("Request failed: {}", err);
    }
    (status, Json(json!({ "ok": false, "error": err.to_string() })))
}

/// Run a blocking service call off the async runtime
async fn run_blocking<T, F>(f: F) -> Result<T, ApiResponse>
where
    F: FnOnce() -> StreamResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(error_response(e)),
        Err(e) => {
            log::warn!("Blocking task failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "ok": false, "error": "Internal error" })),
            ))
        }
    }
}

async fn health() -> ApiResponse {
    (StatusCode::OK, Json(json!({ "ok": true })))
}

async fn list_devices(State(state): State<AppState>) -> ApiResponse {
    let devices: Vec<Value> = state
        .settings
        .devices
        .iter()
        .map(|device| {
            let streaming = match device.mode {
                StreamMode::Frames => state.frames.is_streaming(&device.id),
                StreamMode::Segments => state.segments.is_streaming(&device.id),
            };
            json!({ "id": device.id, "mode": device.mode, "streaming": streaming })
        })
        .collect();
    ok_response(json!(devices))
}

async fn list_streams(State(state): State<AppState>) -> ApiResponse {
    let frame_stats: serde_json::Map<String, Value> = state
        .frame_stats
        .iter()
        .filter_map(|entry| {
            serde_json::to_value(entry.value())
                .ok()
                .map(|stats| (entry.key().clone(), stats))
        })
        .collect();

    ok_response(json!({
        "frames": state.frames.active_sessions(),
        "segments": state.segments.active_sessions(),
        "frameStats": frame_stats,
        "maxParallelStreams": state.settings.max_parallel_streams,
    }))
}

async fn start_stream(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResponse {
    match run_blocking(move || state.start(&device_id)).await {
        Ok(outcome) => ok_response(json!(outcome)),
        Err(response) => response,
    }
}

async fn stop_stream(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResponse {
    match run_blocking(move || state.stop(&device_id)).await {
        Ok(outcome) => ok_response(json!(outcome)),
        Err(response) => response,
    }
}

async fn keep_alive(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResponse {
    // May wait behind a start that is still polling for readiness
    match run_blocking(move || state.keep_alive(&device_id)).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "ok": true }))),
        Err(response) => response,
    }
}

// ============================================================================
// Startup / shutdown
// ============================================================================

fn parse_host(host: &str) -> IpAddr {
    host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Graceful shutdown signal handler
/// Waits for Ctrl+C or SIGTERM, then stops every stream
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received, stopping streams...");
    if let Err(e) = tokio::task::spawn_blocking(move || state.shutdown()).await {
        log::warn!("Error stopping streams: {}", e);
    }
    log::info!("All streams stopped, server shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = env::var("STREAMKEEPER_DATA_DIR").unwrap_or_else(|_| "data".to_string());
    let log_dir = env::var("STREAMKEEPER_LOG_DIR").unwrap_or_else(|_| format!("{data_dir}/logs"));

    let data_dir_path = PathBuf::from(&data_dir);
    let log_dir_path = PathBuf::from(&log_dir);
    std::fs::create_dir_all(&data_dir_path)?;
    std::fs::create_dir_all(&log_dir_path)?;

    init_logger(&log_dir_path)?;
    log::info!("Streamkeeper {} starting", env!("CARGO_PKG_VERSION"));
    log::info!("  Data directory: {}", data_dir);
    log::info!("  Log directory: {}", log_dir);

    let settings_manager = SettingsManager::new(&data_dir_path);
    let mut settings = settings_manager.load()?;
    apply_env_overrides(&mut settings, |key| env::var(key).ok())?;
    log::info!(
        "  {} device(s) configured, max {} parallel stream(s)",
        settings.devices.len(),
        settings.max_parallel_streams
    );

    // Both modes count against one ceiling
    let capacity = StreamCapacity::new(settings.max_parallel_streams);
    let mut frame_config = FrameStreamConfig::from_settings(&settings);
    frame_config.core.capacity = capacity.clone();
    let mut segment_config = SegmentStreamConfig::from_settings(&settings);
    segment_config.core.capacity = capacity;

    let events: Arc<dyn EventSink> = Arc::new(LogEventSink);
    let frames = FrameStreamService::new(frame_config, Arc::clone(&events))?;
    let segments = SegmentStreamService::new(segment_config, events)?;

    let address = SocketAddr::new(parse_host(&settings.host), settings.port);
    let state = AppState {
        settings: Arc::new(settings),
        frames: Arc::new(frames),
        segments: Arc::new(segments),
        frame_stats: Arc::new(DashMap::new()),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/devices", get(list_devices))
        .route("/api/streams", get(list_streams))
        .route("/api/streams/:device_id/start", post(start_stream))
        .route("/api/streams/:device_id/stop", post(stop_stream))
        .route("/api/streams/:device_id/keepalive", post(keep_alive))
        .with_state(state.clone());

    log::info!("Streamkeeper listening on http://{address}");
    let listener = tokio::net::TcpListener::bind(address).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

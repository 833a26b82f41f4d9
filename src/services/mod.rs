// Streamkeeper Services
// Session management, process supervision and stream orchestration

mod error;
mod retry;
mod frame_decoder;
mod thread_config;
mod process_supervisor;
mod session_registry;
mod inactivity_monitor;
mod events;
mod stream_core;
mod frame_stream;
mod segment_stream;
mod path_validator;
mod settings_manager;

pub use error::*;
pub use retry::*;
pub use frame_decoder::*;
pub use thread_config::*;
pub use process_supervisor::*;
pub use session_registry::*;
pub use inactivity_monitor::*;
pub use events::*;
pub use stream_core::*;
pub use frame_stream::*;
pub use segment_stream::*;
pub use path_validator::*;
pub use settings_manager::*;

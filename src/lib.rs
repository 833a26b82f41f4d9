// Streamkeeper
// Supervises per-device capture processes: frame extraction, segment streams,
// concurrency limits and inactivity teardown

pub mod models;
pub mod services;

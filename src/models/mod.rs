// Streamkeeper Models
// Data structures for the service

mod device;
mod settings;

pub use device::*;
pub use settings::*;

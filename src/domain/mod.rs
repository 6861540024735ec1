pub mod buffers;
pub mod characteristics;
pub mod conversions;
pub mod latch;
pub mod models;
pub mod settings;

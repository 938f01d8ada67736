//! Job repository backends.

pub mod file;
pub mod memory;

pub use file::FileJobRepository;
pub use memory::InMemoryJobRepository;

//! Output mailbox backends.

pub mod memory;

pub use memory::InMemoryOutputMailbox;

//! Infrastructure adapters for repositories, mailboxes, and the media proxy.

pub mod mailbox;
pub mod proxy;
pub mod repository;

pub use mailbox::InMemoryOutputMailbox;
pub use proxy::InMemoryMediaProxy;
pub use repository::{FileJobRepository, InMemoryJobRepository};

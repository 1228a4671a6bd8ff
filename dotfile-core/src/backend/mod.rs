//! Concrete [`Backend`](crate::storage::Backend) implementations

pub mod local;
pub mod memory;
pub mod sqlite;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

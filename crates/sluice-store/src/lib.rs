//! Storage backends: metadata persistence (SQLite, in-memory) and the
//! resources that resource nodes watch (filesystem directory, in-memory).

pub mod fs;
pub mod memory;
pub mod sqlite;

pub use fs::FilesystemResource;
pub use memory::{InMemoryMetadataStore, MemoryResource};
pub use sqlite::SqliteMetadataStore;

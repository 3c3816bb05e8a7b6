//! Append-only history of backup attempts.

mod base;
mod memory;
mod sqlite;

pub use base::*;
pub use memory::MemoryHistoryStore;
pub use sqlite::SqliteHistoryStore;

mod backend;
mod memory;
mod postgres;
mod sqlite;

pub use backend::{glob_to_like, glob_to_regex, Backend, BulkOp};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

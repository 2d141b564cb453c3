pub mod pool;
pub mod schema;
pub mod tasks;

pub use pool::{create_memory_pool, create_pool, DbPool};
pub use tasks::SqliteTaskStore;

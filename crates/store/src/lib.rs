pub mod counters;
pub mod sqlite;

pub use counters::{CounterStore, RedisCounterStore};
pub use sqlite::SqliteApiKeyStore;

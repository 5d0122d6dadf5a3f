pub mod cache;
pub mod memory;
pub mod redis_store;
pub mod trait_def;
pub mod watermarks;

pub use cache::ContextCache;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use trait_def::{KvStore, SetOp, StoreError, StoreResult};
pub use watermarks::WatermarkStore;

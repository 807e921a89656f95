// Durable store abstraction: key/value + hash + sorted-set + set + list
// primitives with scripted compare-and-del for lock release. The engine owns
// no canonical state; everything user-visible round-trips through here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineResult;

pub mod lock;
pub mod memory;
pub mod redis_store;

pub use lock::{LockGuard, LockManager};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> EngineResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> EngineResult<()>;
    /// SET NX with a TTL; returns whether the key was planted. Lease locks
    /// are built on this.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool>;
    async fn del(&self, key: &str) -> EngineResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<()>;
    /// Atomic `if get(key) == expected then del(key)`; the only scripted
    /// operation the store needs. Returns whether the key was deleted.
    async fn compare_and_del(&self, key: &str, expected: &str) -> EngineResult<bool>;

    async fn hgetall(&self, key: &str) -> EngineResult<HashMap<String, String>>;
    async fn hset(&self, key: &str, fields: &[(String, String)]) -> EngineResult<()>;
    /// Pipelined multi-key hash write used by the risk write-back batch.
    async fn hset_batch(&self, entries: &[(String, Vec<(String, String)>)]) -> EngineResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> EngineResult<bool>;
    async fn srem(&self, key: &str, member: &str) -> EngineResult<bool>;
    async fn smembers(&self, key: &str) -> EngineResult<Vec<String>>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> EngineResult<()>;
    async fn zrem(&self, key: &str, member: &str) -> EngineResult<bool>;
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> EngineResult<Vec<String>>;
    /// Remove by ascending-rank range; used to cap bounded indexes.
    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> EngineResult<()>;
    async fn zcard(&self, key: &str) -> EngineResult<u64>;

    async fn lpush(&self, key: &str, value: &str) -> EngineResult<()>;
    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> EngineResult<()>;
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> EngineResult<Vec<String>>;
}

pub type SharedStore = Arc<dyn DurableStore>;

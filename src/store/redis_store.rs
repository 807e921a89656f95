// Redis-backed durable store. One multiplexed connection shared by every
// task; all commands run through it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::DurableStore;
use crate::error::EngineResult;

/// Atomic compare-and-del used for lock release.
const RELEASE_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> EngineResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_tokio_connection().await?;
        info!("Connected to redis store at {}", url);
        Ok(Self { connection })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl DurableStore for RedisStore {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut con = self.conn();
        Ok(con.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut con = self.conn();
        let _: () = con.set(key, value).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        let mut con = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> EngineResult<bool> {
        let mut con = self.conn();
        let removed: i64 = con.del(key).await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<()> {
        let mut con = self.conn();
        let _: bool = con.pexpire(key, ttl.as_millis() as i64).await?;
        Ok(())
    }

    async fn compare_and_del(&self, key: &str, expected: &str) -> EngineResult<bool> {
        let mut con = self.conn();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut con)
            .await?;
        Ok(deleted > 0)
    }

    async fn hgetall(&self, key: &str) -> EngineResult<HashMap<String, String>> {
        let mut con = self.conn();
        Ok(con.hgetall(key).await?)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> EngineResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut con = self.conn();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: i64 = cmd.query_async(&mut con).await?;
        Ok(())
    }

    async fn hset_batch(&self, entries: &[(String, Vec<(String, String)>)]) -> EngineResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut con = self.conn();
        let mut pipe = redis::pipe();
        for (key, fields) in entries {
            if fields.is_empty() {
                continue;
            }
            let mut cmd = redis::cmd("HSET");
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
            pipe.add_command(cmd).ignore();
        }
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> EngineResult<bool> {
        let mut con = self.conn();
        let added: i64 = con.sadd(key, member).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> EngineResult<bool> {
        let mut con = self.conn();
        let removed: i64 = con.srem(key, member).await?;
        Ok(removed > 0)
    }

    async fn smembers(&self, key: &str) -> EngineResult<Vec<String>> {
        let mut con = self.conn();
        Ok(con.smembers(key).await?)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> EngineResult<()> {
        let mut con = self.conn();
        let _: i64 = con.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> EngineResult<bool> {
        let mut con = self.conn();
        let removed: i64 = con.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> EngineResult<Vec<String>> {
        let mut con = self.conn();
        Ok(con.zrangebyscore(key, min, max).await?)
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> EngineResult<()> {
        let mut con = self.conn();
        let _: i64 = con.zremrangebyrank(key, start as isize, stop as isize).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> EngineResult<u64> {
        let mut con = self.conn();
        let count: u64 = con.zcard(key).await?;
        Ok(count)
    }

    async fn lpush(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut con = self.conn();
        let _: i64 = con.lpush(key, value).await?;
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> EngineResult<()> {
        let mut con = self.conn();
        let _: () = con.ltrim(key, start as isize, stop as isize).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> EngineResult<Vec<String>> {
        let mut con = self.conn();
        Ok(con.lrange(key, start as isize, stop as isize).await?)
    }
}

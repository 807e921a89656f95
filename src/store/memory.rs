// In-memory store with the same semantics as the Redis backend. Used by unit
// and scenario tests, and as a local fallback when no store URL is set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::DurableStore;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    // (score, member), kept sorted by score then member.
    ZSet(Vec<(f64, String)>),
    List(VecDeque<String>),
}

#[derive(Default)]
struct Inner {
    values: HashMap<String, Value>,
    expirations: HashMap<String, Instant>,
}

impl Inner {
    fn purge_expired(&mut self, key: &str) {
        if let Some(deadline) = self.expirations.get(key) {
            if Instant::now() >= *deadline {
                self.values.remove(key);
                self.expirations.remove(key);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| EngineError::Store(format!("memory store poisoned: {}", e)))
    }
}

fn wrong_type(key: &str) -> EngineError {
    EngineError::Store(format!("wrong value type at key {}", key))
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> EngineResult<Option<String>> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        match inner.values.get(key) {
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut inner = self.lock()?;
        inner.values.insert(key.to_string(), Value::Str(value.to_string()));
        inner.expirations.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> EngineResult<bool> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        if inner.values.contains_key(key) {
            return Ok(false);
        }
        inner.values.insert(key.to_string(), Value::Str(value.to_string()));
        inner.expirations.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn del(&self, key: &str) -> EngineResult<bool> {
        let mut inner = self.lock()?;
        inner.expirations.remove(key);
        Ok(inner.values.remove(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> EngineResult<()> {
        let mut inner = self.lock()?;
        if inner.values.contains_key(key) {
            inner.expirations.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn compare_and_del(&self, key: &str, expected: &str) -> EngineResult<bool> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        let matches = matches!(inner.values.get(key), Some(Value::Str(s)) if s == expected);
        if matches {
            inner.values.remove(key);
            inner.expirations.remove(key);
        }
        Ok(matches)
    }

    async fn hgetall(&self, key: &str) -> EngineResult<HashMap<String, String>> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        match inner.values.get(key) {
            Some(Value::Hash(h)) => Ok(h.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(HashMap::new()),
        }
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> EngineResult<()> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        let entry = inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Hash(HashMap::new()));
        match entry {
            Value::Hash(h) => {
                for (field, value) in fields {
                    h.insert(field.clone(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hset_batch(&self, entries: &[(String, Vec<(String, String)>)]) -> EngineResult<()> {
        for (key, fields) in entries {
            self.hset(key, fields).await?;
        }
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> EngineResult<bool> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        let entry = inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::Set(HashSet::new()));
        match entry {
            Value::Set(s) => Ok(s.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> EngineResult<bool> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        match inner.values.get_mut(key) {
            Some(Value::Set(s)) => Ok(s.remove(member)),
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn smembers(&self, key: &str) -> EngineResult<Vec<String>> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        match inner.values.get(key) {
            Some(Value::Set(s)) => {
                let mut members: Vec<String> = s.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> EngineResult<()> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        let entry = inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::ZSet(Vec::new()));
        match entry {
            Value::ZSet(z) => {
                z.retain(|(_, m)| m != member);
                z.push((score, member.to_string()));
                z.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal).then(a.1.cmp(&b.1)));
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn zrem(&self, key: &str, member: &str) -> EngineResult<bool> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        match inner.values.get_mut(key) {
            Some(Value::ZSet(z)) => {
                let before = z.len();
                z.retain(|(_, m)| m != member);
                Ok(z.len() < before)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        }
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> EngineResult<Vec<String>> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        match inner.values.get(key) {
            Some(Value::ZSet(z)) => Ok(z
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .map(|(_, m)| m.clone())
                .collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }

    async fn zremrangebyrank(&self, key: &str, start: i64, stop: i64) -> EngineResult<()> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        if let Some(Value::ZSet(z)) = inner.values.get_mut(key) {
            let len = z.len() as i64;
            let norm = |i: i64| -> i64 {
                if i < 0 {
                    (len + i).max(0)
                } else {
                    i.min(len.saturating_sub(1))
                }
            };
            if len == 0 {
                return Ok(());
            }
            let (start, stop) = (norm(start), norm(stop));
            if start > stop {
                return Ok(());
            }
            z.drain(start as usize..=(stop as usize).min(len as usize - 1));
        }
        Ok(())
    }

    async fn zcard(&self, key: &str) -> EngineResult<u64> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        match inner.values.get(key) {
            Some(Value::ZSet(z)) => Ok(z.len() as u64),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn lpush(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        let entry = inner
            .values
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(l) => {
                l.push_front(value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> EngineResult<()> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        if let Some(Value::List(l)) = inner.values.get_mut(key) {
            let len = l.len() as i64;
            let norm = |i: i64| -> i64 {
                if i < 0 {
                    (len + i).max(0)
                } else {
                    i
                }
            };
            let (start, stop) = (norm(start), norm(stop).min(len - 1));
            if start > stop || len == 0 {
                l.clear();
                return Ok(());
            }
            let kept: VecDeque<String> = l
                .iter()
                .skip(start as usize)
                .take((stop - start + 1) as usize)
                .cloned()
                .collect();
            *l = kept;
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> EngineResult<Vec<String>> {
        let mut inner = self.lock()?;
        inner.purge_expired(key);
        match inner.values.get(key) {
            Some(Value::List(l)) => {
                let len = l.len() as i64;
                if len == 0 {
                    return Ok(Vec::new());
                }
                let norm = |i: i64| -> i64 {
                    if i < 0 {
                        (len + i).max(0)
                    } else {
                        i
                    }
                };
                let (start, stop) = (norm(start), norm(stop).min(len - 1));
                if start > stop {
                    return Ok(Vec::new());
                }
                Ok(l.iter()
                    .skip(start as usize)
                    .take((stop - start + 1) as usize)
                    .cloned()
                    .collect())
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_respects_ttl() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("lock:a", "tok1", Duration::from_millis(10))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("lock:a", "tok2", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store
            .set_if_absent("lock:a", "tok3", Duration::from_millis(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn compare_and_del_only_matches_holder() {
        let store = MemoryStore::new();
        store.set("lock:b", "tok").await.unwrap();
        assert!(!store.compare_and_del("lock:b", "other").await.unwrap());
        assert!(store.compare_and_del("lock:b", "tok").await.unwrap());
        assert!(!store.compare_and_del("lock:b", "tok").await.unwrap());
    }

    #[tokio::test]
    async fn zset_range_and_cap() {
        let store = MemoryStore::new();
        for (score, member) in [(1.0, "a"), (3.0, "c"), (2.0, "b")] {
            store.zadd("z", score, member).await.unwrap();
        }
        let mid = store.zrangebyscore("z", 1.5, 3.0).await.unwrap();
        assert_eq!(mid, vec!["b".to_string(), "c".to_string()]);
        store.zremrangebyrank("z", 0, 0).await.unwrap();
        assert_eq!(store.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn list_push_trim_range() {
        let store = MemoryStore::new();
        for v in ["1", "2", "3", "4"] {
            store.lpush("l", v).await.unwrap();
        }
        store.ltrim("l", 0, 2).await.unwrap();
        let items = store.lrange("l", 0, -1).await.unwrap();
        assert_eq!(items, vec!["4".to_string(), "3".to_string(), "2".to_string()]);
    }
}

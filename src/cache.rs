use crate::clock::Clock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

/// 超过该条目数时写入前顺带清理过期项
const PURGE_THRESHOLD: usize = 4096;

struct Entry<V> {
    value: V,
    inserted_at: i64,
}

/// 带过期时间的键值缓存
/// 每个键独立过期，写入遵循最后写入者胜出；`insert_if_absent` 为单键原子的检查并插入。
pub struct TtlCache<K, V> {
    ttl: i64,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: ttl.as_secs() as i64,
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn expired(&self, entry: &Entry<V>, now: i64) -> bool {
        now - entry.inserted_at >= self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut guard = self.entries.lock();
        match guard.get(key) {
            Some(entry) if !self.expired(entry, now) => Some(entry.value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&self, key: K, value: V) {
        let now = self.clock.now();
        let mut guard = self.entries.lock();
        if guard.len() >= PURGE_THRESHOLD {
            guard.retain(|_, e| now - e.inserted_at < self.ttl);
        }
        guard.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
    }

    /// 键不存在（或已过期）时写入并返回 true；已存在则返回 false
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let now = self.clock.now();
        let mut guard = self.entries.lock();
        if let Some(entry) = guard.get(&key)
            && !self.expired(entry, now)
        {
            return false;
        }
        if guard.len() >= PURGE_THRESHOLD {
            guard.retain(|_, e| now - e.inserted_at < self.ttl);
        }
        guard.insert(
            key,
            Entry {
                value,
                inserted_at: now,
            },
        );
        true
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.value)
    }

    /// 清理所有过期项，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.entries.lock();
        let before = guard.len();
        guard.retain(|_, e| now - e.inserted_at < self.ttl);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache(clock: Arc<ManualClock>) -> TtlCache<String, i64> {
        TtlCache::new(Duration::from_secs(3600), clock)
    }

    #[test]
    fn insert_if_absent_is_single_shot_within_ttl() {
        let clock = Arc::new(ManualClock::new(1_000));
        let c = cache(clock.clone());

        assert!(c.insert_if_absent("a".into(), 1));
        assert!(!c.insert_if_absent("a".into(), 2));
        assert_eq!(c.get(&"a".to_string()), Some(1));

        clock.advance(3599);
        assert!(!c.insert_if_absent("a".into(), 3));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(1_000));
        let c = cache(clock.clone());
        c.insert("a".into(), 1);
        c.insert("b".into(), 2);

        clock.advance(3600);
        assert!(!c.contains(&"a".to_string()));
        assert!(c.insert_if_absent("a".into(), 9));
        assert_eq!(c.purge_expired(), 1);
        assert_eq!(c.len(), 1);
    }
}

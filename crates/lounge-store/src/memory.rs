use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

/// Process-local stand-in for the remote store. Same operations, same TTL
/// semantics; expired keys are dropped on access and by [`MemoryStore::sweep`].
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<MemoryData>,
}

#[derive(Default)]
struct MemoryData {
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    /// member -> score
    scored: HashMap<String, HashMap<String, i64>>,
    counters: HashMap<String, i64>,
    expiries: HashMap<String, Instant>,
}

impl MemoryData {
    fn evict_if_expired(&mut self, key: &str, now: Instant) {
        if self.expiries.get(key).is_some_and(|at| *at <= now) {
            self.remove(key);
        }
    }

    fn remove(&mut self, key: &str) {
        self.hashes.remove(key);
        self.sets.remove(key);
        self.scored.remove(key);
        self.counters.remove(key);
        self.expiries.remove(key);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_data<F, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce(&mut MemoryData) -> T,
    {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.evict_if_expired(key, Instant::now());
        f(&mut data)
    }

    pub fn hash_set(&self, key: &str, field: &str, value: &str) {
        self.with_data(key, |d| {
            d.hashes
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
        })
    }

    pub fn hash_get(&self, key: &str, field: &str) -> Option<String> {
        self.with_data(key, |d| d.hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    pub fn hash_get_all(&self, key: &str) -> HashMap<String, String> {
        self.with_data(key, |d| d.hashes.get(key).cloned().unwrap_or_default())
    }

    pub fn hash_del(&self, key: &str, field: &str) {
        self.with_data(key, |d| {
            if let Some(hash) = d.hashes.get_mut(key) {
                hash.remove(field);
                if hash.is_empty() {
                    d.remove(key);
                }
            }
        })
    }

    pub fn set_add(&self, key: &str, member: &str) {
        self.with_data(key, |d| {
            d.sets
                .entry(key.to_string())
                .or_default()
                .insert(member.to_string());
        })
    }

    pub fn set_remove(&self, key: &str, member: &str) {
        self.with_data(key, |d| {
            if let Some(set) = d.sets.get_mut(key) {
                set.remove(member);
                if set.is_empty() {
                    d.remove(key);
                }
            }
        })
    }

    pub fn set_is_member(&self, key: &str, member: &str) -> bool {
        self.with_data(key, |d| d.sets.get(key).is_some_and(|s| s.contains(member)))
    }

    pub fn set_members(&self, key: &str) -> HashSet<String> {
        self.with_data(key, |d| d.sets.get(key).cloned().unwrap_or_default())
    }

    /// Increment a counter, starting the TTL only when the key is created.
    pub fn incr_with_expiry(&self, key: &str, ttl: Duration) -> i64 {
        self.with_data(key, |d| {
            let count = d.counters.entry(key.to_string()).or_insert(0);
            *count += 1;
            let count = *count;
            if count == 1 {
                d.expiries.insert(key.to_string(), Instant::now() + ttl);
            }
            count
        })
    }

    pub fn scored_add(&self, key: &str, members: &[String], score: i64, floor: i64) {
        self.with_data(key, |d| {
            let scored = d.scored.entry(key.to_string()).or_default();
            for member in members {
                scored.insert(member.clone(), score);
            }
            scored.retain(|_, s| *s >= floor);
            if scored.is_empty() {
                d.remove(key);
            }
        })
    }

    pub fn scored_from(&self, key: &str, floor: i64) -> HashSet<String> {
        self.with_data(key, |d| {
            d.scored
                .get(key)
                .map(|scored| {
                    scored
                        .iter()
                        .filter(|(_, s)| **s >= floor)
                        .map(|(member, _)| member.clone())
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let expired: Vec<String> = data
            .expiries
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            data.remove(key);
        }
        expired.len()
    }
}

//! In-process pairing cache: bounded size, TTL, approximate LRU eviction.

use crate::pairing::PairingResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheEntry {
    result: Arc<PairingResult>,
    inserted_at: Instant,
    last_access: Instant,
}

pub struct PairingCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
    ttl: Duration,
}

impl PairingCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<PairingResult>> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(fingerprint) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                entry.last_access = now;
                Some(entry.result.clone())
            }
            Some(_) => {
                entries.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, fingerprint: String, result: Arc<PairingResult>) {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        if entries.len() >= self.max_entries && !entries.contains_key(&fingerprint) {
            // Approximate LRU: evict expired entries first, then the single
            // least-recently-accessed survivor.
            let ttl = self.ttl;
            entries.retain(|_, entry| now.duration_since(entry.inserted_at) < ttl);
            if entries.len() >= self.max_entries {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.last_access)
                    .map(|(key, _)| key.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            fingerprint,
            CacheEntry {
                result,
                inserted_at: now,
                last_access: now,
            },
        );
    }

    pub fn invalidate(&self, fingerprint: &str) {
        self.entries.lock().remove(fingerprint);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

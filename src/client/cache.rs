//! Exact-match response cache keyed by normalized conversation content.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::planner::estimate::is_cjk;
use crate::types::{ChatResponse, Message};

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Canonicalize text for key matching: lowercased, whitespace runs collapsed
/// to one space, punctuation dropped. CJK characters pass through untouched
/// so dense scripts are not destroyed.
pub(crate) fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else if c.is_alphanumeric() || is_cjk(c) {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.extend(c.to_lowercase());
        }
        // Everything else (punctuation, symbols) is dropped.
    }
    out
}

/// Deterministic cache key over the normalized message sequence, the model
/// id, and the temperature rounded to one decimal place. The `v1:` prefix
/// versions the keying scheme.
pub fn cache_key(messages: &[Message], model: &str, temperature: f32) -> String {
    let mut hasher = Sha256::new();

    for msg in messages {
        hasher.update(msg.role.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(normalize(&msg.content).as_bytes());
        hasher.update(b";");
    }
    hasher.update(b"|");
    hasher.update(model.as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{:.1}", temperature).as_bytes());

    format!("v1:{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Cache counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expired: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

struct CacheEntry {
    response: ChatResponse,
    inserted_at: Instant,
    /// Recency stamp from the shared tick counter; smallest is evicted first.
    touched: u64,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
}

/// Bounded in-memory response cache: LRU eviction at capacity plus a fixed
/// TTL per entry. Cloning is cheap; clones share the store.
#[derive(Clone)]
pub struct ResponseCache {
    state: Arc<Mutex<CacheState>>,
    counters: Arc<CacheCounters>,
    capacity: usize,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
            })),
            counters: Arc::new(CacheCounters::default()),
            capacity,
            ttl,
        }
    }

    /// Look up a response. Expired entries are removed on sight and count as
    /// misses; a hit refreshes the entry's recency.
    pub fn get(&self, key: &str) -> Option<ChatResponse> {
        let mut state = self.state.lock().expect("response cache mutex poisoned");
        state.tick += 1;
        let tick = state.tick;

        let mut stale = false;
        if let Some(entry) = state.entries.get_mut(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                entry.touched = tick;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.response.clone());
            }
            stale = true;
        }
        if stale {
            state.entries.remove(key);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response, evicting the least-recently-used entry when at
    /// capacity. Re-inserting a key refreshes its TTL and recency.
    pub fn insert(&self, key: String, response: ChatResponse) {
        let mut state = self.state.lock().expect("response cache mutex poisoned");
        state.tick += 1;
        let tick = state.tick;

        if !state.entries.contains_key(&key) && state.entries.len() >= self.capacity {
            let lru_key = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(k, _)| k.clone());
            if let Some(lru_key) = lru_key {
                state.entries.remove(&lru_key);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }

        state.entries.insert(
            key,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
                touched: tick,
            },
        );
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop every expired entry. Called by the governor's maintenance task.
    pub fn sweep(&self) {
        let mut state = self.state.lock().expect("response cache mutex poisoned");
        let before = state.entries.len();
        let ttl = self.ttl;
        state.entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        let dropped = before - state.entries.len();
        if dropped > 0 {
            self.counters
                .expired
                .fetch_add(dropped as u64, Ordering::Relaxed);
            tracing::debug!(dropped, "Swept expired cache entries");
        }
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .state
            .lock()
            .expect("response cache mutex poisoned")
            .entries
            .len();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            entries,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

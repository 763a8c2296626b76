//! Per-bucket statistics: the `cmd_get`/`cmd_set` counters and the
//! `topkeys` shards the sub-document executor updates on every command
//! (spec §4.5 "Side effects", §5 "eight independently locked LRU maps
//! selected by `hash(key) & 7`; each op holds only its shard's lock").

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const SHARD_COUNT: usize = 8;
const MAX_KEYS_PER_SHARD: usize = 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct KeyStats {
    pub get_hits: u64,
    pub cmd_set: u64,
    pub last_access_unix_secs: u64,
}

#[derive(Default)]
struct TopKeysShard {
    entries: HashMap<Vec<u8>, KeyStats>,
    order: VecDeque<Vec<u8>>,
}

impl TopKeysShard {
    fn touch(&mut self, key: &[u8], is_set: bool) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if let Some(s) = self.entries.get_mut(key) {
            if is_set {
                s.cmd_set += 1;
            } else {
                s.get_hits += 1;
            }
            s.last_access_unix_secs = now;
            return;
        }

        if self.entries.len() >= MAX_KEYS_PER_SHARD {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        let mut stats = KeyStats {
            last_access_unix_secs: now,
            ..Default::default()
        };
        if is_set {
            stats.cmd_set = 1;
        } else {
            stats.get_hits = 1;
        }
        self.entries.insert(key.to_vec(), stats);
        self.order.push_back(key.to_vec());
    }
}

fn shard_for(key: &[u8]) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in key {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash & 0x7) as usize
}

pub struct Stats {
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    shards: [Mutex<TopKeysShard>; SHARD_COUNT],
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            cmd_get: AtomicU64::new(0),
            cmd_set: AtomicU64::new(0),
            shards: Default::default(),
        }
    }

    /// Record a non-mutator sub-document op against `key` (spec §4.5: "on a
    /// non-mutator path, `get` counters and a `topkeys` update ... uses the
    /// key actually operated on").
    pub fn record_get(&self, key: &[u8]) {
        self.cmd_get.fetch_add(1, Ordering::Relaxed);
        let shard = &self.shards[shard_for(key)];
        shard.lock().unwrap().touch(key, false);
    }

    /// Record a mutator sub-document op against `key`.
    pub fn record_set(&self, key: &[u8]) {
        self.cmd_set.fetch_add(1, Ordering::Relaxed);
        let shard = &self.shards[shard_for(key)];
        shard.lock().unwrap().touch(key, true);
    }

    pub fn cmd_get_count(&self) -> u64 {
        self.cmd_get.load(Ordering::Relaxed)
    }

    pub fn cmd_set_count(&self) -> u64 {
        self.cmd_set.load(Ordering::Relaxed)
    }

    pub fn key_stats(&self, key: &[u8]) -> Option<KeyStats> {
        let shard = &self.shards[shard_for(key)];
        shard.lock().unwrap().entries.get(key).copied()
    }
}

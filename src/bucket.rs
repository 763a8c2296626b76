//! Bucket registry (spec C7): maps a connection to a storage engine handle;
//! serializes bucket delete against in-flight commands without holding the
//! registry lock across the wait (spec §4.7's "must not hold the bucket's
//! lock across that wait").

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::storage::StorageEngine;

const MAX_NAME_LEN: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketError {
    InvalidName,
    AlreadyExists,
    NotFound,
    CapacityExceeded,
}

fn validate_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '%'))
}

/// A live bucket: its storage engine plus the in-flight command count that
/// `delete` drains before tearing the bucket down.
pub struct BucketHandle {
    pub name: String,
    pub storage: Arc<dyn StorageEngine>,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl BucketHandle {
    /// Mark the start of a command against this bucket. The returned guard
    /// decrements the count and wakes any pending `delete` when dropped.
    pub fn begin_command(self: &Arc<Self>) -> CommandGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        CommandGuard {
            handle: self.clone(),
        }
    }

    fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

pub struct CommandGuard {
    handle: Arc<BucketHandle>,
}

impl Drop for CommandGuard {
    fn drop(&mut self) {
        if self.handle.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.handle.drained.notify_waiters();
        }
    }
}

pub struct BucketRegistry {
    buckets: Mutex<HashMap<String, Arc<BucketHandle>>>,
    max_buckets: usize,
}

impl BucketRegistry {
    pub fn new(max_buckets: usize) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_buckets,
        }
    }

    pub fn create(&self, name: &str, storage: Arc<dyn StorageEngine>) -> Result<(), BucketError> {
        if !validate_name(name) {
            return Err(BucketError::InvalidName);
        }
        let mut buckets = self.buckets.lock().unwrap();
        if buckets.contains_key(name) {
            return Err(BucketError::AlreadyExists);
        }
        if buckets.len() >= self.max_buckets {
            return Err(BucketError::CapacityExceeded);
        }
        buckets.insert(
            name.to_string(),
            Arc::new(BucketHandle {
                name: name.to_string(),
                storage,
                in_flight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        );
        Ok(())
    }

    pub fn select(&self, name: &str) -> Result<Arc<BucketHandle>, BucketError> {
        self.buckets
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or(BucketError::NotFound)
    }

    /// Remove `name` from the registry, then wait (without holding the
    /// registry lock) for every command already in flight against it to
    /// finish.
    pub async fn delete(&self, name: &str) -> Result<(), BucketError> {
        let handle = {
            let mut buckets = self.buckets.lock().unwrap();
            buckets.remove(name).ok_or(BucketError::NotFound)?
        };

        loop {
            if handle.in_flight_count() == 0 {
                break;
            }
            // Register for the next wakeup before re-checking the count, so a
            // `CommandGuard` drop between the check above and this await can't
            // be missed (`Notify::notified` only wakes waiters registered at
            // the moment `notify_waiters` is called).
            let notified = handle.drained.notified();
            if handle.in_flight_count() == 0 {
                break;
            }
            notified.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn store() -> Arc<dyn StorageEngine> {
        Arc::new(MemoryStore::new(1 << 20))
    }

    #[test]
    fn create_then_select_round_trips() {
        let reg = BucketRegistry::new(10);
        reg.create("default", store()).unwrap();
        let handle = reg.select("default").unwrap();
        assert_eq!(handle.name, "default");
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let reg = BucketRegistry::new(10);
        reg.create("default", store()).unwrap();
        assert_eq!(
            reg.create("default", store()),
            Err(BucketError::AlreadyExists)
        );
    }

    #[test]
    fn invalid_name_is_rejected() {
        let reg = BucketRegistry::new(10);
        assert_eq!(reg.create("", store()), Err(BucketError::InvalidName));
        assert_eq!(
            reg.create(&"a".repeat(101), store()),
            Err(BucketError::InvalidName)
        );
        assert_eq!(
            reg.create("bad name!", store()),
            Err(BucketError::InvalidName)
        );
    }

    #[test]
    fn capacity_is_enforced() {
        let reg = BucketRegistry::new(1);
        reg.create("a", store()).unwrap();
        assert_eq!(
            reg.create("b", store()),
            Err(BucketError::CapacityExceeded)
        );
    }

    #[test]
    fn select_missing_is_not_found() {
        let reg = BucketRegistry::new(10);
        assert_eq!(reg.select("missing"), Err(BucketError::NotFound));
    }

    #[tokio::test]
    async fn delete_waits_for_in_flight_commands_to_drain() {
        let reg = BucketRegistry::new(10);
        reg.create("default", store()).unwrap();
        let handle = reg.select("default").unwrap();

        let guard = handle.begin_command();
        let reg = Arc::new(reg);
        let reg2 = reg.clone();
        let deleter = tokio::spawn(async move { reg2.delete("default").await });

        tokio::task::yield_now().await;
        assert!(!deleter.is_finished());

        drop(guard);
        deleter.await.unwrap().unwrap();
        assert_eq!(reg.select("default"), Err(BucketError::NotFound));
    }

    #[tokio::test]
    async fn delete_missing_bucket_is_not_found() {
        let reg = BucketRegistry::new(10);
        assert_eq!(reg.delete("missing").await, Err(BucketError::NotFound));
    }
}

//! Per-key async lock table used for single-flight work.
//!
//! Holders of the same key serialize; different keys never contend beyond a
//! brief shard lock in the `DashMap`. Entries are removed once the last
//! holder or waiter is gone, so the table only tracks in-flight keys.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    contended: AtomicU64,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive ownership of `key`.
    pub async fn lock(&self, key: &str) -> KeyedGuard<'_> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = match mutex.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                self.contended.fetch_add(1, Ordering::Relaxed);
                debug!(key, "waiting for in-flight holder");
                mutex.clone().lock_owned().await
            }
        };

        KeyedGuard {
            table: self,
            key: key.to_string(),
            mutex,
            guard: Some(guard),
        }
    }

    /// Keys currently held or awaited.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }

    /// How many `lock` calls had to wait for another holder.
    pub fn contended(&self) -> u64 {
        self.contended.load(Ordering::Relaxed)
    }
}

/// Releases the key on drop.
pub struct KeyedGuard<'a> {
    table: &'a KeyedLocks,
    key: String,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Table entry + our handle: nobody else is waiting.
        self.table.locks.remove_if(&self.key, |_, m| {
            Arc::ptr_eq(m, &self.mutex) && Arc::strong_count(m) == 2
        });
    }
}

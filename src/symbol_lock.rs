// =============================================================================
// SymbolLockRegistry — per-(userId, symbol) mutual exclusion (C4)
// =============================================================================
//
// A concurrent map of lazily-created per-key locks shared between the
// execution path (OrderOrchestrator) and the reconciliation path
// (UserDataReconciler). This is the only cross-path synchronization in the
// system; both components acquire the same key around any state transition
// on that (userId, symbol) pair, preventing reconciliation from overwriting
// Trade state mid-execution and vice versa (§4.4).
//
// The registry itself is guarded by `parking_lot::RwLock` because entries
// are only created/looked-up, never held across `.await`. The per-key lock
// is a `tokio::sync::Mutex` because it *is* held across `.await` points
// (REST calls, DB writes) for the whole duration of one ENTRY/DCA/CLOSE/
// MOVE_SL/CANCEL operation or one stream-event handling.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

type Key = (Uuid, String);

#[derive(Default)]
pub struct SymbolLockRegistry {
    locks: RwLock<HashMap<Key, Arc<Mutex<()>>>>,
}

impl SymbolLockRegistry {
    pub fn new() -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `(user_id, symbol)`, creating it lazily if this
    /// is the first time this key has been locked. Holds the returned guard
    /// for the whole critical section; drop it to release.
    pub async fn acquire(&self, user_id: Uuid, symbol: &str) -> OwnedMutexGuard<()> {
        let key = (user_id, symbol.to_string());

        let entry = {
            let read = self.locks.read();
            read.get(&key).cloned()
        };

        let mutex = match entry {
            Some(m) => m,
            None => {
                let mut write = self.locks.write();
                write
                    .entry(key)
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            }
        };

        mutex.lock_owned().await
    }

    /// Number of distinct (user, symbol) keys ever locked. Useful for tests
    /// and diagnostics; entries are never evicted since the set of active
    /// (user, symbol) pairs is small and bounded by real trading activity.
    pub fn key_count(&self) -> usize {
        self.locks.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_key_serializes() {
        let registry = Arc::new(SymbolLockRegistry::new());
        let user = Uuid::new_v4();

        let order = Arc::new(Mutex::new(Vec::<u32>::new()));

        let r1 = registry.clone();
        let o1 = order.clone();
        let h1 = tokio::spawn(async move {
            let _g = r1.acquire(user, "BTCUSDT").await;
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            o1.lock().await.push(1);
        });

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let r2 = registry.clone();
        let o2 = order.clone();
        let h2 = tokio::spawn(async move {
            let _g = r2.acquire(user, "BTCUSDT").await;
            o2.lock().await.push(2);
        });

        h1.await.unwrap();
        h2.await.unwrap();

        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn different_symbols_run_concurrently() {
        let registry = Arc::new(SymbolLockRegistry::new());
        let user = Uuid::new_v4();

        let _g1 = registry.acquire(user, "BTCUSDT").await;
        // A lock on a different symbol for the same user must not block.
        let g2_fut = registry.acquire(user, "ETHUSDT");
        let result = tokio::time::timeout(std::time::Duration::from_millis(100), g2_fut).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn key_count_grows_lazily() {
        let registry = SymbolLockRegistry::new();
        assert_eq!(registry.key_count(), 0);
        let user = Uuid::new_v4();
        let _g = registry.acquire(user, "BTCUSDT").await;
        assert_eq!(registry.key_count(), 1);
    }
}

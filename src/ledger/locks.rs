//! Per-account serialization of atomic units.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::models::AccountId;

/// One async mutex per account. Units on the same account queue behind each
/// other; units on different accounts never share a guard.
///
/// Only accounts with a holder or a waiter keep an entry: idle mutexes are
/// pruned whenever a new account is inserted.
#[derive(Clone, Default)]
pub struct AccountLocks {
    locks: Arc<RwLock<HashMap<AccountId, Arc<Mutex<()>>>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `account_id`. Released when the guard drops.
    pub async fn acquire(&self, account_id: &AccountId) -> OwnedMutexGuard<()> {
        let existing = self.locks.read().await.get(account_id).cloned();
        let lock = match existing {
            Some(lock) => lock,
            None => {
                let mut locks = self.locks.write().await;
                // Every clone is taken under this map's lock, so a count of one
                // means no task holds or awaits the mutex.
                locks.retain(|id, lock| id == account_id || Arc::strong_count(lock) > 1);
                locks.entry(account_id.clone()).or_default().clone()
            }
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_account_serializes() {
        let locks = AccountLocks::new();
        let id = AccountId::parse("u1").unwrap();

        let guard = locks.acquire(&id).await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&id)).await;
        assert!(blocked.is_err());

        drop(guard);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&id)).await;
        assert!(reacquired.is_ok());
        assert_eq!(locks.locks.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = AccountLocks::new();
        let a = AccountId::parse("alice").unwrap();
        let b = AccountId::parse("bob").unwrap();
        let c = AccountId::parse("carol").unwrap();

        drop(locks.acquire(&a).await);
        let held = locks.acquire(&b).await;
        assert_eq!(locks.locks.read().await.len(), 1);

        // bob is still held, so inserting carol keeps him
        let _other = locks.acquire(&c).await;
        {
            let map = locks.locks.read().await;
            assert_eq!(map.len(), 2);
            assert!(map.contains_key(&b));
        }

        drop(held);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&b)).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn test_different_accounts_do_not_contend() {
        let locks = AccountLocks::new();
        let a = AccountId::parse("alice").unwrap();
        let b = AccountId::parse("bob").unwrap();

        let _held = locks.acquire(&a).await;
        let other = tokio::time::timeout(Duration::from_millis(50), locks.acquire(&b)).await;
        assert!(other.is_ok());
    }
}

//! Per-key async locks and the idempotent top-up callback built on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::OwnedMutexGuard;
use tracing::info;

use onerelay_storage::{Storage, StorageResult, TopUpStatus};

/// Lock table keyed by string.
///
/// Entries are held weakly, so the table only tracks keys somebody is
/// currently holding or waiting on.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(key).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    let mutex = Arc::new(tokio::sync::Mutex::new(()));
                    locks.insert(key.to_string(), Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }

    /// Keys with a live holder or waiter.
    pub fn len(&self) -> usize {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, weak| weak.strong_count() > 0);
        locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopUpOutcome {
    Credited,
    AlreadyProcessed,
    NotFound,
}

/// Payment confirmations; retried callbacks for one trade credit once.
pub struct TopUpService {
    storage: Arc<dyn Storage>,
    locks: KeyedLocks,
}

impl TopUpService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn complete(&self, trade_no: &str) -> StorageResult<TopUpOutcome> {
        let _guard = self.locks.lock(trade_no).await;

        let Some(top_up) = self.storage.find_top_up(trade_no).await? else {
            return Ok(TopUpOutcome::NotFound);
        };
        if top_up.status != TopUpStatus::Pending {
            return Ok(TopUpOutcome::AlreadyProcessed);
        }
        if !self.storage.complete_top_up(trade_no).await? {
            return Ok(TopUpOutcome::AlreadyProcessed);
        }
        info!(
            event = "top_up_credited",
            trade_no = %trade_no,
            user_id = top_up.user_id,
            amount = top_up.amount
        );
        Ok(TopUpOutcome::Credited)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use onerelay_storage::{NewUser, ROLE_COMMON, SeaOrmStorage};

    use super::*;

    #[tokio::test]
    async fn same_key_serializes_and_table_drains() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.lock("trade-1").await;
        assert_eq!(locks.len(), 1);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("trade-1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let _other = tokio::time::timeout(Duration::from_secs(1), locks.lock("trade-2"))
            .await
            .unwrap();

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        drop(_other);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn duplicate_confirmations_credit_once() {
        let storage = SeaOrmStorage::connect("sqlite::memory:").await.unwrap();
        storage.sync().await.unwrap();
        let user_id = storage
            .insert_user(&NewUser {
                username: "payer".to_string(),
                group: "default".to_string(),
                quota: 0,
                role: ROLE_COMMON,
            })
            .await
            .unwrap();
        storage.insert_top_up(user_id, "T-100", 5_000).await.unwrap();
        let storage: Arc<dyn Storage> = Arc::new(storage);
        let service = Arc::new(TopUpService::new(storage.clone()));

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.complete("T-100").await })
        };
        let second = {
            let service = service.clone();
            tokio::spawn(async move { service.complete("T-100").await })
        };
        let (first, second) = tokio::time::timeout(Duration::from_secs(5), async {
            (first.await.unwrap().unwrap(), second.await.unwrap().unwrap())
        })
        .await
        .unwrap();

        let mut outcomes = vec![first, second];
        outcomes.sort_by_key(|o| *o == TopUpOutcome::Credited);
        assert_eq!(
            outcomes,
            vec![TopUpOutcome::AlreadyProcessed, TopUpOutcome::Credited]
        );
        assert_eq!(storage.get_user(user_id).await.unwrap().unwrap().quota, 5_000);
        assert_eq!(
            service.complete("T-404").await.unwrap(),
            TopUpOutcome::NotFound
        );
    }
}

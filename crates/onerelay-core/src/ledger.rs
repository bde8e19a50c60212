use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use onerelay_storage::{QuotaField, Storage, StorageResult};

/// Applies quota movements to storage, either immediately or in batches.
///
/// Batched mode folds every delta for the same (field, id) into one pending
/// value and writes it on [`QuotaLedger::flush`]. Both modes end at the same
/// balance; batched mode only delays when storage sees it.
pub struct QuotaLedger {
    storage: Arc<dyn Storage>,
    batched: bool,
    pending: Mutex<HashMap<(QuotaField, i64), i64>>,
}

impl QuotaLedger {
    pub fn new(storage: Arc<dyn Storage>, batched: bool) -> Self {
        Self {
            storage,
            batched,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_batched(&self) -> bool {
        self.batched
    }

    pub async fn apply(&self, field: QuotaField, id: i64, delta: i64) -> StorageResult<()> {
        if delta == 0 {
            return Ok(());
        }
        if !self.batched {
            return self.storage.apply_quota_delta(field, id, delta).await;
        }
        *self.lock_pending().entry((field, id)).or_insert(0) += delta;
        Ok(())
    }

    /// Delta queued for (field, id) and not yet written.
    pub fn pending_delta(&self, field: QuotaField, id: i64) -> i64 {
        self.lock_pending()
            .get(&(field, id))
            .copied()
            .unwrap_or(0)
    }

    /// Writes every queued delta; failed writes are queued again.
    ///
    /// Returns the number of (field, id) entries written.
    pub async fn flush(&self) -> StorageResult<usize> {
        let drained: Vec<((QuotaField, i64), i64)> = self.lock_pending().drain().collect();

        let mut written = 0;
        let mut first_error = None;
        for ((field, id), delta) in drained {
            if delta == 0 {
                continue;
            }
            match self.storage.apply_quota_delta(field, id, delta).await {
                Ok(()) => written += 1,
                Err(err) => {
                    warn!(event = "ledger_flush_failed", ?field, id, delta, error = %err);
                    *self.lock_pending().entry((field, id)).or_insert(0) += delta;
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                if written > 0 {
                    debug!(event = "ledger_flushed", entries = written);
                }
                Ok(written)
            }
        }
    }

    /// Flushes on a fixed interval for as long as the runtime lives.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let ledger = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = ledger.flush().await {
                    warn!(event = "ledger_flush_tick_failed", error = %err);
                }
            }
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<(QuotaField, i64), i64>> {
        // Deltas stay valid even if a holder panicked.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use onerelay_storage::{NewUser, ROLE_COMMON, SeaOrmStorage};

    use super::*;

    async fn storage_with_user() -> (Arc<dyn Storage>, i64) {
        let storage = SeaOrmStorage::connect("sqlite::memory:").await.unwrap();
        storage.sync().await.unwrap();
        let user_id = storage
            .insert_user(&NewUser {
                username: "bob".to_string(),
                group: "default".to_string(),
                quota: 1_000,
                role: ROLE_COMMON,
            })
            .await
            .unwrap();
        (Arc::new(storage), user_id)
    }

    #[tokio::test]
    async fn direct_and_batched_modes_converge() {
        let (storage, user_id) = storage_with_user().await;
        let direct = QuotaLedger::new(storage.clone(), false);
        direct.apply(QuotaField::UserQuota, user_id, 100).await.unwrap();
        direct.apply(QuotaField::UserQuota, user_id, -30).await.unwrap();
        assert_eq!(storage.get_user(user_id).await.unwrap().unwrap().quota, 930);

        let batched = QuotaLedger::new(storage.clone(), true);
        batched.apply(QuotaField::UserQuota, user_id, 100).await.unwrap();
        batched.apply(QuotaField::UserQuota, user_id, -30).await.unwrap();
        assert_eq!(batched.pending_delta(QuotaField::UserQuota, user_id), 70);
        assert_eq!(storage.get_user(user_id).await.unwrap().unwrap().quota, 930);

        assert_eq!(batched.flush().await.unwrap(), 1);
        assert_eq!(batched.pending_delta(QuotaField::UserQuota, user_id), 0);
        assert_eq!(storage.get_user(user_id).await.unwrap().unwrap().quota, 860);
        assert_eq!(batched.flush().await.unwrap(), 0);
    }
}

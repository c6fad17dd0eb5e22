//! Status reconciliation
//!
//! Applies terminal outcomes to the record store and propagates them to the
//! other records of the same nonce slot. All writes for one
//! (account, network) go through the slot lock.

use crate::error::WatcherResult;
use crate::state::{
    NonceFilter, RecordFilter, RecordStore, RecordUpdate, TransactionRecord, TxStatus,
};
use crate::tx::SlotLocks;

use alloy_primitives::B256;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of `apply_status`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Record already carried this terminal result
    Unchanged,
    Updated {
        /// Same-nonce siblings marked replaced
        replaced: usize,
        /// Lower-nonce siblings marked unknown
        dropped: usize,
    },
    /// No record with this hash
    Missing,
}

/// What the restart sweep changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestartSummary {
    pub failed: usize,
    pub unknown: usize,
    pub pruned: usize,
}

pub struct StatusReconciler {
    store: Arc<dyn RecordStore>,
    locks: SlotLocks,
    retention_limit: usize,
}

impl StatusReconciler {
    pub fn new(store: Arc<dyn RecordStore>, retention_limit: usize) -> Self {
        Self {
            store,
            locks: SlotLocks::new(),
            retention_limit,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Insert a freshly submitted record, flagging it as a replacement when
    /// its nonce slot is already occupied
    pub async fn insert_pending(
        &self,
        mut record: TransactionRecord,
    ) -> WatcherResult<TransactionRecord> {
        let slot = record.slot();
        let _guard = self.locks.acquire(&slot).await;

        let occupants = self
            .store
            .find(&RecordFilter::slot(&slot).with_nonce(NonceFilter::Eq(record.nonce)))
            .await?;
        record.is_replacement = occupants.iter().any(|r| r.hash != record.hash);

        self.store.add(record.clone()).await?;
        debug!(
            "Recorded {} as pending (nonce {}, replacement={})",
            record.hash, record.nonce, record.is_replacement
        );
        Ok(record)
    }

    /// Persist a terminal status and cascade it to the nonce slot.
    ///
    /// A terminal record is left alone when it is already confirmed or when
    /// the incoming result is not more confirmed than the stored one.
    pub async fn apply_status(
        &self,
        hash: &B256,
        status: TxStatus,
        block_number: Option<u64>,
        confirmed: bool,
    ) -> WatcherResult<ApplyOutcome> {
        let Some(record) = self.store.get(hash).await? else {
            return Ok(ApplyOutcome::Missing);
        };

        let _guard = self.locks.acquire(&record.slot()).await;
        let Some(record) = self.store.get(hash).await? else {
            return Ok(ApplyOutcome::Missing);
        };

        if record.status.is_terminal() && (record.confirmed || !confirmed) {
            debug!(
                "{} already {} (confirmed={}), ignoring {} (confirmed={})",
                hash, record.status, record.confirmed, status, confirmed
            );
            return Ok(ApplyOutcome::Unchanged);
        }

        let update = RecordUpdate {
            status: Some(status),
            block_number,
            confirmed: Some(confirmed),
        };
        self.store.update(hash, &update).await?;
        info!(
            "{} {} -> {} (block {:?}, confirmed={})",
            hash, record.status, status, block_number, confirmed
        );

        let (replaced, dropped) = match status {
            TxStatus::Success | TxStatus::Error => self.cascade(&record).await?,
            _ => (0, 0),
        };

        Ok(ApplyOutcome::Updated { replaced, dropped })
    }

    /// Settle the siblings of a record whose slot was just spent
    async fn cascade(&self, settled: &TransactionRecord) -> WatcherResult<(usize, usize)> {
        let slot = settled.slot();
        let network = settled.network.to_string();

        let replaced = self
            .store
            .update_where(
                &RecordFilter::slot(&slot)
                    .with_nonce(NonceFilter::Eq(settled.nonce))
                    .with_statuses(&[TxStatus::Pending, TxStatus::Unknown])
                    .excluding(settled.hash),
                &RecordUpdate::status(TxStatus::Replaced),
            )
            .await?;

        let dropped = self
            .store
            .update_where(
                &RecordFilter::slot(&slot)
                    .with_nonce(NonceFilter::Lt(settled.nonce))
                    .with_statuses(&[TxStatus::Pending])
                    .excluding(settled.hash),
                &RecordUpdate::status(TxStatus::Unknown),
            )
            .await?;

        for hash in &replaced {
            info!("{} replaced by {}", hash, settled.hash);
        }
        for hash in &dropped {
            info!("{} dropped, nonce passed by {}", hash, settled.hash);
        }
        crate::metrics::record_cascade(&network, "replaced", replaced.len());
        crate::metrics::record_cascade(&network, "dropped", dropped.len());

        Ok((replaced.len(), dropped.len()))
    }

    /// Give up on a watch: `unknown`, but only if nothing else settled it
    pub async fn expire(&self, hash: &B256) -> WatcherResult<bool> {
        let Some(record) = self.store.get(hash).await? else {
            return Ok(false);
        };

        let _guard = self.locks.acquire(&record.slot()).await;
        match self.store.get(hash).await? {
            Some(current) if current.status == TxStatus::Pending => {
                self.store
                    .update(hash, &RecordUpdate::status(TxStatus::Unknown))
                    .await?;
                info!("{} status could not be determined", hash);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Normalize records left behind by a previous process.
    ///
    /// Must run before any watch is started.
    pub async fn reconcile_on_restart(&self) -> WatcherResult<RestartSummary> {
        let mut summary = RestartSummary::default();

        let successes = self
            .store
            .find(&RecordFilter::status(TxStatus::Success))
            .await?;
        for success in &successes {
            // no chain context here, so siblings fail rather than get replaced
            let failed = self
                .store
                .update_where(
                    &RecordFilter::slot(&success.slot())
                        .with_nonce(NonceFilter::Eq(success.nonce))
                        .with_statuses(&[TxStatus::Pending, TxStatus::Unknown])
                        .excluding(success.hash),
                    &RecordUpdate::status(TxStatus::Error),
                )
                .await?;
            summary.failed += failed.len();
        }

        summary.unknown = self
            .store
            .update_where(
                &RecordFilter::status(TxStatus::Pending),
                &RecordUpdate::status(TxStatus::Unknown),
            )
            .await?
            .len();

        summary.pruned = self.prune(&HashSet::new()).await?;

        info!(
            "Restart reconciliation: {} failed, {} unknown, {} pruned",
            summary.failed, summary.unknown, summary.pruned
        );
        Ok(summary)
    }

    /// Apply the retention policy, sparing `protected` hashes
    pub async fn prune(&self, protected: &HashSet<B256>) -> WatcherResult<usize> {
        let pruned = self.store.prune(self.retention_limit, protected).await?;
        if pruned > 0 {
            debug!("Pruned {} records beyond the newest {}", pruned, self.retention_limit);
            crate::metrics::RECORDS_PRUNED.inc_by(pruned as u64);
        }
        self.locks.release_idle();
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{MemoryRecordStore, NetworkRef};

    fn network() -> NetworkRef {
        NetworkRef::Substrate {
            genesis_hash: B256::repeat_byte(0x91),
        }
    }

    fn record(seed: u8, account: &str, nonce: u64, status: TxStatus, timestamp: i64) -> TransactionRecord {
        let mut record = TransactionRecord::new_pending(
            B256::repeat_byte(seed),
            account.to_string(),
            network(),
            nonce,
            "transfer",
        );
        record.status = status;
        record.timestamp = timestamp;
        record
    }

    async fn reconciler(records: Vec<TransactionRecord>) -> StatusReconciler {
        let store = Arc::new(MemoryRecordStore::new());
        for r in records {
            store.add(r).await.unwrap();
        }
        StatusReconciler::new(store, 100)
    }

    async fn status_of(reconciler: &StatusReconciler, seed: u8) -> TransactionRecord {
        reconciler
            .store()
            .get(&B256::repeat_byte(seed))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_repeated_terminal_status_is_unchanged() {
        let mut done = record(1, "0xa", 5, TxStatus::Success, 1);
        done.confirmed = true;
        done.block_number = Some(100);
        let sibling = record(2, "0xa", 5, TxStatus::Pending, 2);
        let reconciler = reconciler(vec![done.clone(), sibling.clone()]).await;

        let outcome = reconciler
            .apply_status(&done.hash, TxStatus::Success, Some(100), true)
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Unchanged);
        assert_eq!(status_of(&reconciler, 1).await, done);
        assert_eq!(status_of(&reconciler, 2).await, sibling);
    }

    #[tokio::test]
    async fn test_confirmation_upgrades_but_never_downgrades() {
        let reconciler = reconciler(vec![record(1, "0xa", 5, TxStatus::Pending, 1)]).await;
        let hash = B256::repeat_byte(1);

        let first = reconciler
            .apply_status(&hash, TxStatus::Error, Some(10), false)
            .await
            .unwrap();
        assert!(matches!(first, ApplyOutcome::Updated { .. }));
        assert_eq!(
            reconciler.apply_status(&hash, TxStatus::Error, Some(10), false).await.unwrap(),
            ApplyOutcome::Unchanged
        );

        let upgraded = reconciler
            .apply_status(&hash, TxStatus::Error, Some(10), true)
            .await
            .unwrap();
        assert!(matches!(upgraded, ApplyOutcome::Updated { .. }));
        assert!(status_of(&reconciler, 1).await.confirmed);

        assert_eq!(
            reconciler.apply_status(&hash, TxStatus::Success, Some(11), false).await.unwrap(),
            ApplyOutcome::Unchanged
        );
        assert_eq!(status_of(&reconciler, 1).await.status, TxStatus::Error);
    }

    #[tokio::test]
    async fn test_success_cascades_through_nonce_slot() {
        let reconciler = reconciler(vec![
            record(0xa, "0xa", 5, TxStatus::Pending, 1),
            record(0xb, "0xa", 5, TxStatus::Pending, 2),
            record(0xc, "0xa", 4, TxStatus::Pending, 3),
            record(0xd, "0xa", 6, TxStatus::Pending, 4),
            // other sender, same nonce
            record(0xe, "0xb", 5, TxStatus::Pending, 5),
        ])
        .await;

        let outcome = reconciler
            .apply_status(&B256::repeat_byte(0xa), TxStatus::Success, Some(100), true)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ApplyOutcome::Updated {
                replaced: 1,
                dropped: 1
            }
        );
        let a = status_of(&reconciler, 0xa).await;
        assert_eq!((a.status, a.block_number, a.confirmed), (TxStatus::Success, Some(100), true));
        assert_eq!(status_of(&reconciler, 0xb).await.status, TxStatus::Replaced);
        assert_eq!(status_of(&reconciler, 0xc).await.status, TxStatus::Unknown);
        assert_eq!(status_of(&reconciler, 0xd).await.status, TxStatus::Pending);
        assert_eq!(status_of(&reconciler, 0xe).await.status, TxStatus::Pending);
    }

    #[tokio::test]
    async fn test_cascade_status_filters() {
        let reconciler = reconciler(vec![
            record(1, "0xa", 5, TxStatus::Pending, 1),
            record(2, "0xa", 5, TxStatus::Unknown, 2),
            record(3, "0xa", 5, TxStatus::Error, 3),
            record(4, "0xa", 4, TxStatus::Unknown, 4),
            record(5, "0xa", 3, TxStatus::Success, 5),
        ])
        .await;

        reconciler
            .apply_status(&B256::repeat_byte(1), TxStatus::Error, Some(7), false)
            .await
            .unwrap();

        assert_eq!(status_of(&reconciler, 2).await.status, TxStatus::Replaced);
        assert_eq!(status_of(&reconciler, 3).await.status, TxStatus::Error);
        assert_eq!(status_of(&reconciler, 4).await.status, TxStatus::Unknown);
        assert_eq!(status_of(&reconciler, 5).await.status, TxStatus::Success);
    }

    #[tokio::test]
    async fn test_insert_pending_flags_replacements() {
        let reconciler = reconciler(vec![record(1, "0xa", 5, TxStatus::Pending, 1)]).await;

        let fresh = reconciler
            .insert_pending(record(2, "0xa", 6, TxStatus::Pending, 2))
            .await
            .unwrap();
        assert!(!fresh.is_replacement);

        let speed_up = reconciler
            .insert_pending(record(3, "0xa", 5, TxStatus::Pending, 3))
            .await
            .unwrap();
        assert!(speed_up.is_replacement);
        assert!(status_of(&reconciler, 3).await.is_replacement);

        assert!(reconciler
            .insert_pending(record(3, "0xa", 5, TxStatus::Pending, 4))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_record() {
        let reconciler = reconciler(vec![]).await;
        assert_eq!(
            reconciler
                .apply_status(&B256::repeat_byte(9), TxStatus::Success, None, true)
                .await
                .unwrap(),
            ApplyOutcome::Missing
        );
    }

    #[tokio::test]
    async fn test_expire_only_touches_pending() {
        let reconciler = reconciler(vec![
            record(1, "0xa", 1, TxStatus::Pending, 1),
            record(2, "0xa", 2, TxStatus::Success, 2),
        ])
        .await;

        assert!(reconciler.expire(&B256::repeat_byte(1)).await.unwrap());
        assert!(!reconciler.expire(&B256::repeat_byte(2)).await.unwrap());
        assert!(!reconciler.expire(&B256::repeat_byte(3)).await.unwrap());
        assert_eq!(status_of(&reconciler, 1).await.status, TxStatus::Unknown);
        assert_eq!(status_of(&reconciler, 2).await.status, TxStatus::Success);
    }

    #[tokio::test]
    async fn test_restart_normalization() {
        let reconciler = reconciler(vec![
            record(1, "0xa", 5, TxStatus::Success, 1),
            record(2, "0xa", 5, TxStatus::Pending, 2),
            record(3, "0xa", 5, TxStatus::Unknown, 3),
            record(4, "0xa", 6, TxStatus::Pending, 4),
            record(5, "0xb", 1, TxStatus::Pending, 5),
            record(6, "0xb", 0, TxStatus::Replaced, 6),
        ])
        .await;

        let summary = reconciler.reconcile_on_restart().await.unwrap();

        assert_eq!(
            summary,
            RestartSummary {
                failed: 2,
                unknown: 2,
                pruned: 0
            }
        );
        assert_eq!(status_of(&reconciler, 1).await.status, TxStatus::Success);
        assert_eq!(status_of(&reconciler, 2).await.status, TxStatus::Error);
        assert_eq!(status_of(&reconciler, 3).await.status, TxStatus::Error);
        assert_eq!(status_of(&reconciler, 4).await.status, TxStatus::Unknown);
        assert_eq!(status_of(&reconciler, 5).await.status, TxStatus::Unknown);
        assert_eq!(status_of(&reconciler, 6).await.status, TxStatus::Replaced);
    }

    #[tokio::test]
    async fn test_restart_applies_retention() {
        let records = (0..105u8)
            .map(|i| record(i + 1, "0xa", i as u64, TxStatus::Success, i as i64))
            .collect();
        let reconciler = reconciler(records).await;

        let summary = reconciler.reconcile_on_restart().await.unwrap();
        assert_eq!(summary.pruned, 5);
        assert_eq!(reconciler.store().recent(1000).await.unwrap().len(), 100);
        // the five oldest are gone
        assert!(reconciler.store().get(&B256::repeat_byte(5)).await.unwrap().is_none());
        assert!(reconciler.store().get(&B256::repeat_byte(6)).await.unwrap().is_some());
    }
}

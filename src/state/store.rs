//! Record store abstraction and the in-memory implementation

use super::record::{NetworkRef, SlotKey, TransactionRecord, TxStatus};
use crate::error::{WatcherError, WatcherResult};

use alloy_primitives::B256;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

/// Nonce comparison used by sibling lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceFilter {
    Eq(u64),
    Lt(u64),
}

/// Conjunctive record predicate. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub account: Option<String>,
    pub network: Option<NetworkRef>,
    pub nonce: Option<NonceFilter>,
    pub statuses: Option<Vec<TxStatus>>,
    pub exclude_hash: Option<B256>,
}

impl RecordFilter {
    /// All records of one sender on one network
    pub fn slot(key: &SlotKey) -> Self {
        Self {
            account: Some(key.account.clone()),
            network: Some(key.network),
            ..Default::default()
        }
    }

    pub fn status(status: TxStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    pub fn with_nonce(mut self, nonce: NonceFilter) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_statuses(mut self, statuses: &[TxStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn excluding(mut self, hash: B256) -> Self {
        self.exclude_hash = Some(hash);
        self
    }

    pub fn matches(&self, record: &TransactionRecord) -> bool {
        if let Some(account) = &self.account {
            if &record.account != account {
                return false;
            }
        }
        if let Some(network) = &self.network {
            if &record.network != network {
                return false;
            }
        }
        match self.nonce {
            Some(NonceFilter::Eq(nonce)) if record.nonce != nonce => return false,
            Some(NonceFilter::Lt(nonce)) if record.nonce >= nonce => return false,
            _ => {}
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&record.status) {
                return false;
            }
        }
        self.exclude_hash != Some(record.hash)
    }
}

/// Partial update of a record. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub status: Option<TxStatus>,
    pub block_number: Option<u64>,
    pub confirmed: Option<bool>,
}

impl RecordUpdate {
    pub fn status(status: TxStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, record: &mut TransactionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(block_number) = self.block_number {
            record.block_number = Some(block_number);
        }
        if let Some(confirmed) = self.confirmed {
            record.confirmed = confirmed;
        }
    }
}

/// Record counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub unknown: u64,
    pub pending: u64,
    pub success: u64,
    pub error: u64,
    pub replaced: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: TxStatus, count: u64) {
        match status {
            TxStatus::Unknown => self.unknown += count,
            TxStatus::Pending => self.pending += count,
            TxStatus::Success => self.success += count,
            TxStatus::Error => self.error += count,
            TxStatus::Replaced => self.replaced += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.unknown + self.pending + self.success + self.error + self.replaced
    }
}

/// Durable keyed storage of transaction records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a new record; fails if the hash is already recorded
    async fn add(&self, record: TransactionRecord) -> WatcherResult<()>;

    async fn get(&self, hash: &B256) -> WatcherResult<Option<TransactionRecord>>;

    /// Returns false if no record has this hash
    async fn update(&self, hash: &B256, update: &RecordUpdate) -> WatcherResult<bool>;

    async fn find(&self, filter: &RecordFilter) -> WatcherResult<Vec<TransactionRecord>>;

    /// Apply an update to every matching record, returning the touched hashes
    async fn update_where(
        &self,
        filter: &RecordFilter,
        update: &RecordUpdate,
    ) -> WatcherResult<Vec<B256>>;

    async fn delete(&self, hash: &B256) -> WatcherResult<bool>;

    /// Most recent records, newest first
    async fn recent(&self, limit: usize) -> WatcherResult<Vec<TransactionRecord>>;

    /// Delete everything older than the newest `keep` records, except
    /// pending records and the `protected` hashes. Returns the number deleted.
    async fn prune(&self, keep: usize, protected: &HashSet<B256>) -> WatcherResult<usize>;

    async fn count_by_status(&self) -> WatcherResult<StatusCounts>;

    async fn health_check(&self) -> WatcherResult<()>;
}

/// In-process record store
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<B256, TransactionRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Newest first, ties broken by hash so pruning is deterministic
fn by_recency(a: &TransactionRecord, b: &TransactionRecord) -> std::cmp::Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| a.hash.cmp(&b.hash))
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn add(&self, record: TransactionRecord) -> WatcherResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.hash) {
            return Err(WatcherError::DuplicateTransaction {
                hash: record.hash.to_string(),
            });
        }
        records.insert(record.hash, record);
        Ok(())
    }

    async fn get(&self, hash: &B256) -> WatcherResult<Option<TransactionRecord>> {
        Ok(self.records.read().await.get(hash).cloned())
    }

    async fn update(&self, hash: &B256, update: &RecordUpdate) -> WatcherResult<bool> {
        match self.records.write().await.get_mut(hash) {
            Some(record) => {
                update.apply(record);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find(&self, filter: &RecordFilter) -> WatcherResult<Vec<TransactionRecord>> {
        let mut found: Vec<_> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        found.sort_by(by_recency);
        Ok(found)
    }

    async fn update_where(
        &self,
        filter: &RecordFilter,
        update: &RecordUpdate,
    ) -> WatcherResult<Vec<B256>> {
        let mut touched = Vec::new();
        for record in self.records.write().await.values_mut() {
            if filter.matches(record) {
                update.apply(record);
                touched.push(record.hash);
            }
        }
        Ok(touched)
    }

    async fn delete(&self, hash: &B256) -> WatcherResult<bool> {
        Ok(self.records.write().await.remove(hash).is_some())
    }

    async fn recent(&self, limit: usize) -> WatcherResult<Vec<TransactionRecord>> {
        let mut all: Vec<_> = self.records.read().await.values().cloned().collect();
        all.sort_by(by_recency);
        all.truncate(limit);
        Ok(all)
    }

    async fn prune(&self, keep: usize, protected: &HashSet<B256>) -> WatcherResult<usize> {
        let mut records = self.records.write().await;

        let mut ordered: Vec<&TransactionRecord> = records.values().collect();
        ordered.sort_by(|a, b| by_recency(a, b));

        let doomed: Vec<B256> = ordered
            .into_iter()
            .skip(keep)
            .filter(|r| r.status != TxStatus::Pending && !protected.contains(&r.hash))
            .map(|r| r.hash)
            .collect();

        for hash in &doomed {
            records.remove(hash);
        }

        if !doomed.is_empty() {
            debug!("Pruned {} records beyond the newest {}", doomed.len(), keep);
        }
        Ok(doomed.len())
    }

    async fn count_by_status(&self) -> WatcherResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        for record in self.records.read().await.values() {
            counts.add(record.status, 1);
        }
        Ok(counts)
    }

    async fn health_check(&self) -> WatcherResult<()> {
        Ok(())
    }
}

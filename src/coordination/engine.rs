//! Watch coordination: the entry point for newly submitted transactions

use super::reconciler::{ApplyOutcome, StatusReconciler};
use crate::chain::{ChainManager, ConfirmationWatcher, NetworkHandle, WatchEvent};
use crate::error::{WatcherError, WatcherResult};
use crate::events::DispatchOutcome;
use crate::notify::{ErrorReporter, NotificationKind, Notifier};
use crate::state::{normalize_address, NetworkRef, TransactionRecord, TransferInfo, TxStatus};
use crate::tx::{compute_hash, SignedPayload};

use alloy_primitives::B256;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Informational fields stored with the record
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    pub label: String,
    pub site_url: Option<String>,
    pub transfer: Option<TransferInfo>,
}

/// Starts watches and routes their results
pub struct WatchCoordinator {
    chains: Arc<ChainManager>,
    reconciler: Arc<StatusReconciler>,
    notifier: Arc<dyn Notifier>,
    reporter: Arc<dyn ErrorReporter>,
    timeout: Duration,
    /// Live watches by transaction hash
    active: Arc<DashMap<B256, AbortHandle>>,
}

impl WatchCoordinator {
    pub fn new(
        chains: Arc<ChainManager>,
        reconciler: Arc<StatusReconciler>,
        notifier: Arc<dyn Notifier>,
        reporter: Arc<dyn ErrorReporter>,
        timeout: Duration,
    ) -> Self {
        Self {
            chains,
            reconciler,
            notifier,
            reporter,
            timeout,
            active: Arc::new(DashMap::new()),
        }
    }

    /// Record a submitted extrinsic as pending and watch it in the background.
    ///
    /// Fails only if the transaction cannot be recorded; watch failures are
    /// reported, never returned.
    pub async fn watch(
        &self,
        genesis_hash: &B256,
        payload: &SignedPayload,
        signature: &str,
        options: WatchOptions,
    ) -> WatcherResult<B256> {
        let network = self.chains.get(genesis_hash)?;

        let signed_for = payload.genesis_hash()?;
        if signed_for != network.genesis_hash {
            return Err(WatcherError::NetworkMismatch {
                expected: network.genesis_hash.to_string(),
                actual: signed_for.to_string(),
            });
        }

        let hash = compute_hash(&*network.registry().await, payload, signature)?;

        let network_ref = NetworkRef::Substrate {
            genesis_hash: network.genesis_hash,
        };
        let mut record = TransactionRecord::new_pending(
            hash,
            normalize_address(&payload.address, &network_ref)?,
            network_ref,
            payload.nonce()?,
            options.label,
        );
        record.site_url = options.site_url;
        record.transfer = options.transfer;

        let record = self.reconciler.insert_pending(record).await?;
        info!(
            "Watching {} on {} (nonce {}{})",
            hash,
            network.name,
            record.nonce,
            if record.is_replacement { ", replacement" } else { "" }
        );

        let mut protected = self.protected_hashes();
        protected.insert(hash);
        if let Err(e) = self.reconciler.prune(&protected).await {
            self.reporter.report(&e, &network.tags());
        }

        crate::metrics::WATCHES_STARTED
            .with_label_values(&[&network.name])
            .inc();
        self.spawn_watch(network, hash);

        Ok(hash)
    }

    fn spawn_watch(&self, network: Arc<NetworkHandle>, hash: B256) {
        let watcher = ConfirmationWatcher::new(network.clone(), self.timeout, self.reporter.clone());
        let router = OutcomeRouter {
            network,
            hash,
            reconciler: self.reconciler.clone(),
            notifier: self.notifier.clone(),
            reporter: self.reporter.clone(),
            started: Instant::now(),
        };
        let active = self.active.clone();
        let span = info_span!("watch", watch_id = %Uuid::new_v4(), hash = %hash);

        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(
            async move {
                let _ = registered_rx.await;

                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let (result, _) = tokio::join!(watcher.watch(hash, events_tx), router.run(events_rx));

                if let Err(e) = result {
                    router.report(&e);
                    router.expire().await;
                }
                active.remove(&hash);
            }
            .instrument(span),
        );

        self.active.insert(hash, handle.abort_handle());
        let _ = registered_tx.send(());
    }

    /// Hashes with a live watch
    pub fn protected_hashes(&self) -> HashSet<B256> {
        self.active.iter().map(|e| *e.key()).collect()
    }

    pub fn active_watches(&self) -> usize {
        self.active.len()
    }

    /// Delete a record at the user's request
    pub async fn dismiss(&self, hash: &B256) -> WatcherResult<bool> {
        let deleted = self.reconciler.store().delete(hash).await?;
        if deleted {
            info!("Dismissed {}", hash);
        }
        Ok(deleted)
    }

    /// Abort all live watches
    pub fn stop(&self) {
        let count = self.active.len();
        for entry in self.active.iter() {
            entry.value().abort();
        }
        self.active.clear();
        info!("Watch coordinator stopped ({} watches aborted)", count);
    }
}

/// Maps watch events onto the store and notifications
struct OutcomeRouter {
    network: Arc<NetworkHandle>,
    hash: B256,
    reconciler: Arc<StatusReconciler>,
    notifier: Arc<dyn Notifier>,
    reporter: Arc<dyn ErrorReporter>,
    started: Instant,
}

impl OutcomeRouter {
    async fn run(&self, mut events: mpsc::UnboundedReceiver<WatchEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                WatchEvent::Included {
                    block_number,
                    tx_index,
                    ..
                } => {
                    // transient: notification only, the record stays pending
                    self.notify(NotificationKind::Submitted, Some((block_number, tx_index)))
                        .await;
                }
                WatchEvent::Final {
                    outcome,
                    block_number,
                    tx_index,
                    confirmed,
                } => {
                    self.settle(outcome, block_number, tx_index, confirmed).await;
                }
                WatchEvent::TimedOut => self.expire().await,
            }
        }
    }

    async fn settle(&self, outcome: DispatchOutcome, block_number: u64, tx_index: u32, confirmed: bool) {
        let (status, kind) = match outcome {
            DispatchOutcome::Success => (TxStatus::Success, NotificationKind::Success),
            DispatchOutcome::Failed => (TxStatus::Error, NotificationKind::Error),
        };

        match self
            .reconciler
            .apply_status(&self.hash, status, Some(block_number), confirmed)
            .await
        {
            Ok(ApplyOutcome::Updated { .. }) => {
                crate::metrics::record_outcome(&self.network.name, status.as_str());
                crate::metrics::WATCH_LATENCY
                    .with_label_values(&[&self.network.name])
                    .observe(self.started.elapsed().as_secs_f64());
                self.notify(kind, Some((block_number, tx_index))).await;
            }
            Ok(ApplyOutcome::Unchanged) => {
                debug!("{} already settled as {}", self.hash, status);
            }
            Ok(ApplyOutcome::Missing) => {
                debug!("{} was dismissed while being watched", self.hash);
            }
            Err(e) => self.report(&e),
        }
    }

    async fn expire(&self) {
        match self.reconciler.expire(&self.hash).await {
            Ok(true) => crate::metrics::record_outcome(&self.network.name, TxStatus::Unknown.as_str()),
            Ok(false) => {}
            Err(e) => self.report(&e),
        }
    }

    async fn notify(&self, kind: NotificationKind, location: Option<(u64, u32)>) {
        let url = self.network.explorer_link(&self.hash, location);
        self.notifier
            .notify(kind, &self.network.name, &self.hash, url)
            .await;
    }

    fn report(&self, err: &WatcherError) {
        warn!("Watch for {} on {}: {}", self.hash, self.network.name, err);
        let mut tags = self.network.tags();
        tags.push(("hash", self.hash.to_string()));
        self.reporter.report(err, &tags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::*;
    use crate::events::fixtures::*;
    use crate::events::EventRecordVersion;
    use crate::notify::{MockErrorReporter, MockNotifier};
    use crate::state::{MemoryRecordStore, RecordStore};
    use crate::tx::payload::fixtures::*;
    use crate::events::TypeRegistry;
    use crate::tx::hash::assemble_extrinsic;
    use std::sync::Mutex;

    struct Harness {
        fake: Arc<FakeConnector>,
        store: Arc<MemoryRecordStore>,
        coordinator: WatchCoordinator,
        notifications: Arc<Mutex<Vec<(NotificationKind, Option<String>)>>>,
        genesis: B256,
    }

    fn harness() -> Harness {
        let fake = FakeConnector::new();
        let handle = network(fake.clone());
        let genesis = handle.genesis_hash;
        let chains = ChainManager::empty();
        chains.insert(handle);

        let store = Arc::new(MemoryRecordStore::new());
        let reconciler = Arc::new(StatusReconciler::new(store.clone(), 100));

        let notifications = Arc::new(Mutex::new(Vec::new()));
        let sink = notifications.clone();
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .returning(move |kind, _, _, url| sink.lock().unwrap().push((kind, url)));

        let mut reporter = MockErrorReporter::new();
        reporter.expect_report().returning(|_, _| ());

        let coordinator = WatchCoordinator::new(
            Arc::new(chains),
            reconciler,
            Arc::new(notifier),
            Arc::new(reporter),
            Duration::from_secs(90),
        );

        Harness {
            fake,
            store,
            coordinator,
            notifications,
            genesis,
        }
    }

    /// Block `number` holding the signed remark with `nonce` at index 1
    fn include(fake: &FakeConnector, number: u64, nonce: u64, success: bool) {
        let bytes =
            assemble_extrinsic(&TypeRegistry::polkadot(), &remark_payload(nonce), &signature(0xaa))
                .unwrap();
        let (filler, _) = extrinsic(0xf0);
        fake.add_block(
            number,
            vec![filler, bytes],
            events(&[
                dispatch_record(0, true, EventRecordVersion::Current),
                dispatch_record(1, success, EventRecordVersion::Current),
            ]),
        );
    }

    async fn settle_tasks() {
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_included_then_finalized_end_to_end() {
        let h = harness();
        include(&h.fake, 100, 3, true);

        let hash = h
            .coordinator
            .watch(&h.genesis, &remark_payload(3), &signature(0xaa), WatchOptions::default())
            .await
            .unwrap();

        let record = h.store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Pending);
        assert_eq!(record.account, ALICE_HEX.to_lowercase());
        assert_eq!(record.nonce, 3);

        h.fake.wait_for_subscriber(NEW_HEADS).await;
        h.fake.push_header(NEW_HEADS, 100);
        settle_tasks().await;

        assert_eq!(h.store.get(&hash).await.unwrap().unwrap().status, TxStatus::Pending);
        assert_eq!(
            h.notifications.lock().unwrap().clone(),
            vec![(
                NotificationKind::Submitted,
                Some("https://polkadot.subscan.io/extrinsic/100-1".to_string())
            )]
        );

        h.fake.push_header(FINALIZED, 100);
        settle_tasks().await;

        let record = h.store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Success);
        assert!(record.confirmed);
        assert_eq!(record.block_number, Some(100));
        assert_eq!(h.fake.subscriber_count(FINALIZED), 0);
        assert_eq!(h.fake.subscriber_count(NEW_HEADS), 0);
        assert_eq!(h.coordinator.active_watches(), 0);
        assert_eq!(h.notifications.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalized_error_overrides_included() {
        let h = harness();
        // new heads sees a success in a block that is later reorganized away
        include(&h.fake, 100, 3, true);
        include(&h.fake, 101, 3, false);

        let hash = h
            .coordinator
            .watch(&h.genesis, &remark_payload(3), &signature(0xaa), WatchOptions::default())
            .await
            .unwrap();

        h.fake.wait_for_subscriber(NEW_HEADS).await;
        h.fake.push_header(NEW_HEADS, 100);
        settle_tasks().await;
        h.fake.push_header(FINALIZED, 101);
        settle_tasks().await;

        let record = h.store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Error);
        assert!(record.confirmed);
        assert_eq!(record.block_number, Some(101));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_heads_failure_settles_immediately() {
        let h = harness();
        include(&h.fake, 40, 1, false);

        let hash = h
            .coordinator
            .watch(&h.genesis, &remark_payload(1), &signature(0xaa), WatchOptions::default())
            .await
            .unwrap();

        h.fake.wait_for_subscriber(NEW_HEADS).await;
        h.fake.push_header(NEW_HEADS, 40);
        settle_tasks().await;

        let record = h.store.get(&hash).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Error);
        assert!(!record.confirmed);
        assert_eq!(h.fake.unsubscribed().len(), 2);
        assert_eq!(h.notifications.lock().unwrap()[0].0, NotificationKind::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_marks_unknown() {
        let h = harness();
        let hash = h
            .coordinator
            .watch(&h.genesis, &remark_payload(2), &signature(0xaa), WatchOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(91)).await;
        settle_tasks().await;

        assert_eq!(h.store.get(&hash).await.unwrap().unwrap().status, TxStatus::Unknown);
        assert_eq!(h.coordinator.active_watches(), 0);
        assert!(h.notifications.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_mismatch_is_not_recorded() {
        let h = harness();
        let mut payload = remark_payload(1);
        payload.genesis_hash = format!("0x{}", "11".repeat(32));

        let result = h
            .coordinator
            .watch(&h.genesis, &payload, &signature(0xaa), WatchOptions::default())
            .await;

        assert!(matches!(result, Err(WatcherError::NetworkMismatch { .. })));
        assert!(h.store.recent(10).await.unwrap().is_empty());
        assert_eq!(h.fake.subscriber_count(FINALIZED), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_call_is_not_recorded() {
        let h = harness();
        let mut payload = remark_payload(1);
        payload.method = "0xfa0100".to_string();

        let result = h
            .coordinator
            .watch(&h.genesis, &payload, &signature(0xaa), WatchOptions::default())
            .await;

        assert!(matches!(result, Err(WatcherError::UnknownCall { .. })));
        assert!(h.store.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmission_is_flagged_and_replaced() {
        let h = harness();
        let original = h
            .coordinator
            .watch(&h.genesis, &remark_payload(4), &signature(0x01), WatchOptions::default())
            .await
            .unwrap();
        let speed_up = h
            .coordinator
            .watch(&h.genesis, &remark_payload(4), &signature(0xaa), WatchOptions::default())
            .await
            .unwrap();

        assert!(!h.store.get(&original).await.unwrap().unwrap().is_replacement);
        assert!(h.store.get(&speed_up).await.unwrap().unwrap().is_replacement);
        assert_eq!(h.coordinator.protected_hashes().len(), 2);

        include(&h.fake, 77, 4, true);
        h.fake.wait_for_subscriber(FINALIZED).await;
        h.fake.push_header(FINALIZED, 77);
        settle_tasks().await;

        assert_eq!(h.store.get(&speed_up).await.unwrap().unwrap().status, TxStatus::Success);
        assert_eq!(h.store.get(&original).await.unwrap().unwrap().status, TxStatus::Replaced);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_and_stop() {
        let h = harness();
        let hash = h
            .coordinator
            .watch(&h.genesis, &remark_payload(9), &signature(0xaa), WatchOptions::default())
            .await
            .unwrap();

        assert!(h.coordinator.dismiss(&hash).await.unwrap());
        assert!(!h.coordinator.dismiss(&hash).await.unwrap());
        assert_eq!(h.coordinator.active_watches(), 1);

        h.coordinator.stop();
        assert_eq!(h.coordinator.active_watches(), 0);
    }
}

//! Confirmation watching for a submitted extrinsic
//!
//! Each watch owns two subscriptions and one timer:
//! - finalized heads: the only source whose result is final
//! - new heads: reports a failed dispatch immediately (it cannot turn into a
//!   success on finalization) and a successful one as a transient `Included`
//! - the timer: bounds the wait, re-checking the remembered included block
//!   once before giving up
//!
//! The three sources are merged into one select loop per watch.

use super::matcher::{block_hash_at, BlockLookup};
use super::{NetworkHandle, Subscription};
use crate::error::{WatcherError, WatcherResult};
use crate::events::DispatchOutcome;
use crate::notify::ErrorReporter;
use crate::tx::parse_quantity;

use alloy_primitives::B256;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const FINALIZED_HEADS_METHODS: (&str, &str) = (
    "chain_subscribeFinalizedHeads",
    "chain_unsubscribeFinalizedHeads",
);
const NEW_HEADS_METHODS: (&str, &str) = ("chain_subscribeNewHeads", "chain_unsubscribeNewHeads");

/// Head subscription a notification arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadChannel {
    Finalized,
    NewHeads,
}

impl HeadChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeadChannel::Finalized => "finalized",
            HeadChannel::NewHeads => "new_heads",
        }
    }
}

/// Signals emitted by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// Successfully dispatched in a not yet finalized block
    Included {
        block_hash: B256,
        block_number: u64,
        tx_index: u32,
    },
    /// Terminal dispatch result
    Final {
        outcome: DispatchOutcome,
        block_number: u64,
        tx_index: u32,
        /// Observed in a finalized block
        confirmed: bool,
    },
    /// Nothing conclusive before the deadline
    TimedOut,
}

/// A subscription plus its is-active flag
struct HeadSubscription {
    channel: HeadChannel,
    id: String,
    unsubscribe_method: String,
    notifications: mpsc::UnboundedReceiver<WatcherResult<Value>>,
    active: bool,
    /// The notification stream ended without an unsubscribe
    exhausted: bool,
}

impl HeadSubscription {
    fn new(channel: HeadChannel, subscription: Subscription) -> Self {
        Self {
            channel,
            id: subscription.id,
            unsubscribe_method: subscription.unsubscribe_method,
            notifications: subscription.notifications,
            active: true,
            exhausted: false,
        }
    }

    fn receiving(&self) -> bool {
        self.active && !self.exhausted
    }
}

/// State of one watch
struct WatchState {
    target: B256,
    finalized: HeadSubscription,
    new_heads: HeadSubscription,
    /// Block a successful new-heads match was seen in
    included: Option<B256>,
}

impl WatchState {
    fn subscription(&mut self, channel: HeadChannel) -> &mut HeadSubscription {
        match channel {
            HeadChannel::Finalized => &mut self.finalized,
            HeadChannel::NewHeads => &mut self.new_heads,
        }
    }

    fn done(&self) -> bool {
        !self.finalized.active && !self.new_heads.active
    }
}

/// Watches one network for the inclusion and finalization of extrinsics
pub struct ConfirmationWatcher {
    network: Arc<NetworkHandle>,
    timeout: Duration,
    reporter: Arc<dyn ErrorReporter>,
}

impl ConfirmationWatcher {
    pub fn new(
        network: Arc<NetworkHandle>,
        timeout: Duration,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            network,
            timeout,
            reporter,
        }
    }

    /// Watch `target` until a final result, or the timeout.
    ///
    /// Returns an error only if the subscriptions could not be opened.
    pub async fn watch(
        &self,
        target: B256,
        events: mpsc::UnboundedSender<WatchEvent>,
    ) -> WatcherResult<()> {
        let connector = &self.network.connector;

        let finalized = connector
            .subscribe(FINALIZED_HEADS_METHODS.0, FINALIZED_HEADS_METHODS.1, Value::Array(vec![]))
            .await?;
        let new_heads = match connector
            .subscribe(NEW_HEADS_METHODS.0, NEW_HEADS_METHODS.1, Value::Array(vec![]))
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                let _ = connector.unsubscribe(&finalized.unsubscribe_method, &finalized.id).await;
                return Err(e);
            }
        };

        let mut state = WatchState {
            target,
            finalized: HeadSubscription::new(HeadChannel::Finalized, finalized),
            new_heads: HeadSubscription::new(HeadChannel::NewHeads, new_heads),
            included: None,
        };

        crate::metrics::WATCHES_ACTIVE.inc();
        debug!("Watching {} on {}", target, self.network.name);

        let deadline = tokio::time::sleep_until(Instant::now() + self.timeout);
        tokio::pin!(deadline);

        while !state.done() {
            tokio::select! {
                item = state.finalized.notifications.recv(), if state.finalized.receiving() => {
                    self.on_notification(&mut state, HeadChannel::Finalized, item, &events).await;
                }
                item = state.new_heads.notifications.recv(), if state.new_heads.receiving() => {
                    self.on_notification(&mut state, HeadChannel::NewHeads, item, &events).await;
                }
                _ = &mut deadline => {
                    self.on_timeout(&mut state, &events).await;
                    break;
                }
            }
        }

        crate::metrics::WATCHES_ACTIVE.dec();
        Ok(())
    }

    async fn on_notification(
        &self,
        state: &mut WatchState,
        channel: HeadChannel,
        item: Option<WatcherResult<Value>>,
        events: &mpsc::UnboundedSender<WatchEvent>,
    ) {
        let header = match item {
            Some(Ok(header)) => header,
            Some(Err(e)) => {
                // the connector keeps the subscription alive
                crate::metrics::record_subscription_error(&self.network.name, channel.as_str());
                self.report(&e, channel);
                return;
            }
            None => {
                warn!(
                    "{} subscription for {} ended on {}",
                    channel.as_str(),
                    state.target,
                    self.network.name
                );
                state.subscription(channel).exhausted = true;
                return;
            }
        };

        let Some(block_hash) = self.resolve_header(&header, channel).await else {
            return;
        };

        crate::metrics::record_block_scanned(&self.network.name, channel.as_str());
        let lookup = self.network.find_in_block(&block_hash, &state.target).await;

        let (outcome, block_number, tx_index) = match lookup {
            BlockLookup::Outcome {
                outcome,
                block_number,
                tx_index,
            } => (outcome, block_number, tx_index),
            BlockLookup::NotFound => return,
            BlockLookup::TransportError(message) => {
                self.report(&WatcherError::Decode(message), channel);
                return;
            }
        };

        match (channel, outcome) {
            (HeadChannel::Finalized, _) => {
                info!(
                    "{} finalized at #{}-{} ({:?})",
                    state.target, block_number, tx_index, outcome
                );
                let _ = events.send(WatchEvent::Final {
                    outcome,
                    block_number,
                    tx_index,
                    confirmed: true,
                });
                self.close(&mut state.new_heads).await;
                self.close(&mut state.finalized).await;
            }
            (HeadChannel::NewHeads, DispatchOutcome::Failed) => {
                info!(
                    "{} failed at #{}-{}, not waiting for finality",
                    state.target, block_number, tx_index
                );
                let _ = events.send(WatchEvent::Final {
                    outcome,
                    block_number,
                    tx_index,
                    confirmed: false,
                });
                self.close(&mut state.new_heads).await;
                self.close(&mut state.finalized).await;
            }
            (HeadChannel::NewHeads, DispatchOutcome::Success) => {
                info!("{} included at #{}-{}", state.target, block_number, tx_index);
                state.included = Some(block_hash);
                let _ = events.send(WatchEvent::Included {
                    block_hash,
                    block_number,
                    tx_index,
                });
                self.close(&mut state.new_heads).await;
            }
        }
    }

    async fn on_timeout(&self, state: &mut WatchState, events: &mpsc::UnboundedSender<WatchEvent>) {
        warn!(
            "Watch for {} on {} timed out after {:?}",
            state.target, self.network.name, self.timeout
        );
        self.close(&mut state.new_heads).await;

        let mut resolved = false;
        if state.finalized.active {
            if let Some(block_hash) = state.included {
                // finalized notifications are sometimes never delivered
                let lookup = self.network.find_in_block(&block_hash, &state.target).await;
                if let BlockLookup::Outcome {
                    outcome,
                    block_number,
                    tx_index,
                } = lookup
                {
                    info!(
                        "{} resolved from included block #{} after timeout",
                        state.target, block_number
                    );
                    crate::metrics::TIMEOUT_FALLBACKS
                        .with_label_values(&[&self.network.name, "recovered"])
                        .inc();
                    let _ = events.send(WatchEvent::Final {
                        outcome,
                        block_number,
                        tx_index,
                        confirmed: true,
                    });
                    resolved = true;
                }
            }
            self.close(&mut state.finalized).await;
        }

        if !resolved {
            crate::metrics::TIMEOUT_FALLBACKS
                .with_label_values(&[&self.network.name, "unknown"])
                .inc();
            let _ = events.send(WatchEvent::TimedOut);
        }
    }

    /// Block hash for a header notification
    async fn resolve_header(&self, header: &Value, channel: HeadChannel) -> Option<B256> {
        let number = header
            .get("number")
            .and_then(Value::as_str)
            .ok_or_else(|| WatcherError::Decode("header without number".to_string()))
            .and_then(parse_quantity);

        let number = match number {
            Ok(number) => number as u64,
            Err(e) => {
                self.report(&e, channel);
                return None;
            }
        };

        match block_hash_at(self.network.connector.as_ref(), number).await {
            Ok(Some(hash)) => Some(hash),
            Ok(None) => {
                debug!("No block hash for #{} on {}", number, self.network.name);
                None
            }
            Err(e) => {
                self.report(&e, channel);
                None
            }
        }
    }

    /// Unsubscribe once; later calls are no-ops
    async fn close(&self, subscription: &mut HeadSubscription) {
        if !subscription.active {
            return;
        }
        subscription.active = false;

        if let Err(e) = self
            .network
            .connector
            .unsubscribe(&subscription.unsubscribe_method, &subscription.id)
            .await
        {
            warn!(
                "Failed to unsubscribe {} ({}) on {}: {}",
                subscription.channel.as_str(),
                subscription.id,
                self.network.name,
                e
            );
        }
    }

    fn report(&self, err: &WatcherError, channel: HeadChannel) {
        warn!(
            "{} error on {}: {}",
            channel.as_str(),
            self.network.name,
            err
        );
        let mut tags = self.network.tags();
        tags.push(("channel", channel.as_str().to_string()));
        self.reporter.report(err, &tags);
    }
}

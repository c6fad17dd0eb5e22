//! WebSocket JSON-RPC chain connector
//!
//! A single supervisor task owns the socket. When the connection drops it
//! fails in-flight requests, reports the loss on every live subscription,
//! reconnects with exponential backoff and re-issues those subscriptions.
//! Subscribers keep their channel across reconnects: the id they hold is
//! local to the connector and routed to whatever id the node issued last.

use super::{ChainConnector, Subscription};
use crate::error::{WatcherError, WatcherResult};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Notifications kept per subscription id not registered yet
const MAX_ORPHANS: usize = 16;
/// Unregistered subscription ids buffered at once
const MAX_ORPHAN_IDS: usize = 64;
/// Unsubscribed node ids whose late notifications are dropped
const CLOSED_ID_MEMORY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingRequests = DashMap<u64, oneshot::Sender<WatcherResult<Value>>>;
type Notifications = mpsc::UnboundedSender<WatcherResult<Value>>;

/// Delay between reconnection attempts, doubling up to `max_backoff`
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

struct LiveSubscription {
    method: String,
    unsubscribe_method: String,
    params: Value,
    /// Id issued by the node on the current connection
    node_id: Option<String>,
    sender: Notifications,
}

#[derive(Default)]
struct SubscriptionTable {
    live: HashMap<u64, LiveSubscription>,
    /// Node id -> local id
    routes: HashMap<String, u64>,
    /// Notifications that raced ahead of the subscribe response
    orphans: HashMap<String, Vec<Value>>,
    orphan_order: VecDeque<String>,
    closed: HashSet<String>,
    closed_order: VecDeque<String>,
}

impl SubscriptionTable {
    /// Route `node_id` to a live subscription and replay what arrived early.
    /// Returns false when the subscription was closed in the meantime.
    fn register(&mut self, local: u64, node_id: String) -> bool {
        let Some(sub) = self.live.get_mut(&local) else {
            return false;
        };
        if let Some(early) = self.orphans.remove(&node_id) {
            self.orphan_order.retain(|id| id != &node_id);
            for value in early {
                let _ = sub.sender.send(Ok(value));
            }
        }
        sub.node_id = Some(node_id.clone());
        self.routes.insert(node_id, local);
        true
    }

    fn route(&mut self, node_id: String, result: Value) {
        if let Some(sub) = self.routes.get(&node_id).and_then(|local| self.live.get(local)) {
            let _ = sub.sender.send(Ok(result));
            return;
        }
        if self.closed.contains(&node_id) {
            return;
        }
        self.buffer_orphan(node_id, result);
    }

    fn buffer_orphan(&mut self, node_id: String, result: Value) {
        if !self.orphans.contains_key(&node_id) {
            if self.orphan_order.len() >= MAX_ORPHAN_IDS {
                if let Some(oldest) = self.orphan_order.pop_front() {
                    self.orphans.remove(&oldest);
                }
            }
            self.orphan_order.push_back(node_id.clone());
        }
        let queued = self.orphans.entry(node_id).or_default();
        if queued.len() < MAX_ORPHANS {
            queued.push(result);
        }
    }

    fn close(&mut self, local: u64) -> Option<LiveSubscription> {
        let sub = self.live.remove(&local)?;
        if let Some(node_id) = &sub.node_id {
            self.routes.remove(node_id);
            self.remember_closed(node_id.clone());
        }
        Some(sub)
    }

    fn remember_closed(&mut self, node_id: String) {
        if self.orphans.remove(&node_id).is_some() {
            self.orphan_order.retain(|id| id != &node_id);
        }
        if self.closed.insert(node_id.clone()) {
            self.closed_order.push_back(node_id);
            if self.closed_order.len() > CLOSED_ID_MEMORY {
                if let Some(oldest) = self.closed_order.pop_front() {
                    self.closed.remove(&oldest);
                }
            }
        }
    }

    /// Node ids die with the socket; subscribers stay and hear about the loss
    fn connection_lost(&mut self, network: &str) {
        self.routes.clear();
        self.orphans.clear();
        self.orphan_order.clear();
        self.closed.clear();
        self.closed_order.clear();
        self.live.retain(|_, sub| {
            sub.node_id = None;
            sub.sender
                .send(Err(WatcherError::ChainConnection {
                    network: network.to_string(),
                    message: "connection lost, resubscribing".to_string(),
                }))
                .is_ok()
        });
    }
}

/// State shared between the connector handle and its supervisor
struct Inner {
    network: String,
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingRequests,
    subscriptions: Mutex<SubscriptionTable>,
}

impl Inner {
    fn table(&self) -> WatcherResult<MutexGuard<'_, SubscriptionTable>> {
        self.subscriptions
            .lock()
            .map_err(|_| WatcherError::Internal("subscription table poisoned".to_string()))
    }

    fn connection_error(&self, message: impl Into<String>) -> WatcherError {
        WatcherError::ChainConnection {
            network: self.network.clone(),
            message: message.into(),
        }
    }

    async fn request(&self, method: &str, params: Value) -> WatcherResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if self
            .outgoing
            .send(Message::Text(request.to_string()))
            .is_err()
        {
            self.pending.remove(&id);
            return Err(self.connection_error("connection closed"));
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.connection_error("connection closed")),
            Err(_) => {
                self.pending.remove(&id);
                Err(WatcherError::Timeout {
                    operation: method.to_string(),
                })
            }
        }
    }

    async fn subscribe_on_node(&self, method: &str, params: Value) -> WatcherResult<String> {
        let result = self.request(method, params).await?;
        subscription_key(&result).ok_or_else(|| {
            WatcherError::Subscription(format!("{} returned no subscription id", method))
        })
    }

    fn connection_lost(&self) {
        fail_pending(&self.network, &self.pending);
        if let Ok(mut table) = self.table() {
            table.connection_lost(&self.network);
        }
    }

    /// Re-issue every live subscription on a fresh connection
    async fn resubscribe_all(&self) {
        let wanted: Vec<(u64, String, String, Value)> = match self.table() {
            Ok(table) => table
                .live
                .iter()
                .map(|(local, sub)| {
                    (
                        *local,
                        sub.method.clone(),
                        sub.unsubscribe_method.clone(),
                        sub.params.clone(),
                    )
                })
                .collect(),
            Err(_) => return,
        };

        for (local, method, unsubscribe_method, params) in wanted {
            match self.subscribe_on_node(&method, params).await {
                Ok(node_id) => {
                    let registered = match self.table() {
                        Ok(mut table) => table.register(local, node_id.clone()),
                        Err(_) => false,
                    };
                    if registered {
                        debug!("Resubscribed {} as {} on {}", method, node_id, self.network);
                    } else {
                        // closed while the request was in flight
                        let _ = self.request(&unsubscribe_method, json!([node_id])).await;
                    }
                }
                Err(e) => {
                    warn!("Resubscribing {} on {} failed: {}", method, self.network, e);
                    if let Ok(table) = self.table() {
                        if let Some(sub) = table.live.get(&local) {
                            let _ = sub.sender.send(Err(WatcherError::Subscription(format!(
                                "resubscribe {} failed: {}",
                                method, e
                            ))));
                        }
                    }
                }
            }
        }
    }
}

/// Connector speaking JSON-RPC 2.0 over one WebSocket, reconnecting on loss
pub struct WsConnector {
    inner: Arc<Inner>,
    supervisor: JoinHandle<()>,
}

impl WsConnector {
    pub async fn connect(network: &str, url: &str) -> WatcherResult<Self> {
        Self::connect_with(network, url, ReconnectPolicy::default()).await
    }

    /// Open the WebSocket and start the supervisor task
    pub async fn connect_with(
        network: &str,
        url: &str,
        policy: ReconnectPolicy,
    ) -> WatcherResult<Self> {
        let (ws_stream, _) =
            connect_async(url)
                .await
                .map_err(|e| WatcherError::ChainConnection {
                    network: network.to_string(),
                    message: format!("WebSocket connection to {} failed: {}", url, e),
                })?;
        info!("WebSocket connected for network {}", network);

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let inner = Arc::new(Inner {
            network: network.to_string(),
            next_id: AtomicU64::new(1),
            outgoing,
            pending: DashMap::new(),
            subscriptions: Mutex::new(SubscriptionTable::default()),
        });

        let supervisor = tokio::spawn(supervise(
            inner.clone(),
            url.to_string(),
            policy,
            ws_stream,
            outgoing_rx,
        ));

        Ok(Self { inner, supervisor })
    }
}

impl Drop for WsConnector {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[async_trait]
impl ChainConnector for WsConnector {
    async fn send(&self, method: &str, params: Value) -> WatcherResult<Value> {
        self.inner.request(method, params).await
    }

    async fn subscribe(
        &self,
        method: &str,
        unsubscribe_method: &str,
        params: Value,
    ) -> WatcherResult<Subscription> {
        let node_id = self.inner.subscribe_on_node(method, params.clone()).await?;
        let local = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut table = self.inner.table()?;
            table.live.insert(
                local,
                LiveSubscription {
                    method: method.to_string(),
                    unsubscribe_method: unsubscribe_method.to_string(),
                    params,
                    node_id: None,
                    sender: tx,
                },
            );
            table.register(local, node_id.clone());
        }

        debug!(
            "Subscribed {} as {} (node id {}) on {}",
            method, local, node_id, self.inner.network
        );
        Ok(Subscription {
            id: local.to_string(),
            unsubscribe_method: unsubscribe_method.to_string(),
            notifications: rx,
        })
    }

    async fn unsubscribe(&self, unsubscribe_method: &str, id: &str) -> WatcherResult<()> {
        let local: u64 = id
            .parse()
            .map_err(|_| WatcherError::Subscription(format!("unknown subscription id {}", id)))?;

        let closed = self.inner.table()?.close(local);
        // a subscription lost with the connection has nothing to cancel on the node
        let Some(node_id) = closed.and_then(|sub| sub.node_id) else {
            return Ok(());
        };

        let accepted = self
            .inner
            .request(unsubscribe_method, json!([node_id]))
            .await?;
        if accepted == Value::Bool(false) {
            debug!("{} was already gone on {}", node_id, self.inner.network);
        }
        Ok(())
    }
}

/// Own the socket: pump frames, and reconnect with backoff whenever it drops
async fn supervise(
    inner: Arc<Inner>,
    url: String,
    policy: ReconnectPolicy,
    first: WsStream,
    mut outgoing_rx: mpsc::UnboundedReceiver<Message>,
) {
    let mut stream = first;
    loop {
        if !pump(&inner, stream, &mut outgoing_rx).await {
            debug!("Connector for {} shut down", inner.network);
            return;
        }

        // requests written to the dead socket get no answer
        while outgoing_rx.try_recv().is_ok() {}
        inner.connection_lost();
        crate::metrics::record_chain_health(&inner.network, false);

        let mut attempt = 0u32;
        stream = loop {
            tokio::time::sleep(policy.backoff(attempt)).await;
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => break stream,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "Reconnect to {} for {} failed (attempt {}): {}",
                        url, inner.network, attempt, e
                    );
                }
            }
        };

        info!("WebSocket reconnected for network {}", inner.network);
        crate::metrics::record_reconnect(&inner.network);
        crate::metrics::record_chain_health(&inner.network, true);

        let resubscriber = inner.clone();
        tokio::spawn(async move { resubscriber.resubscribe_all().await });
    }
}

/// Run one connection until it drops. False once the connector is gone.
async fn pump(
    inner: &Inner,
    stream: WsStream,
    outgoing_rx: &mut mpsc::UnboundedReceiver<Message>,
) -> bool {
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            message = outgoing_rx.recv() => {
                let Some(message) = message else {
                    return false;
                };
                if let Err(e) = write.send(message).await {
                    error!("WebSocket write failed for {}: {}", inner.network, e);
                    return true;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&text, &inner.pending, &inner.subscriptions);
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => dispatch(&text, &inner.pending, &inner.subscriptions),
                    Err(_) => warn!("Non UTF-8 binary frame from {}", inner.network),
                },
                Some(Ok(Message::Close(frame))) => {
                    warn!("WebSocket closed by {}: {:?}", inner.network, frame);
                    return true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error for {}: {}", inner.network, e);
                    return true;
                }
                None => {
                    warn!("WebSocket stream ended for {}", inner.network);
                    return true;
                }
            }
        }
    }
}

fn subscription_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Route one incoming frame to a pending request or a subscription
fn dispatch(text: &str, pending: &PendingRequests, subscriptions: &Mutex<SubscriptionTable>) {
    let message: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unparseable JSON-RPC frame: {}", e);
            return;
        }
    };

    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let Some((_, responder)) = pending.remove(&id) else {
            debug!("Response for unknown request {}", id);
            return;
        };
        let result = match message.get("error") {
            Some(err) => Err(WatcherError::Rpc {
                code: err.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = responder.send(result);
        return;
    }

    let Some(params) = message.get("params") else {
        return;
    };
    let Some(node_id) = params.get("subscription").and_then(subscription_key) else {
        return;
    };
    let result = params.get("result").cloned().unwrap_or(Value::Null);

    if let Ok(mut table) = subscriptions.lock() {
        table.route(node_id, result);
    }
}

/// Fail every request waiting on a dead connection
fn fail_pending(network: &str, pending: &PendingRequests) {
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, responder)) = pending.remove(&id) {
            let _ = responder.send(Err(WatcherError::ChainConnection {
                network: network.to_string(),
                message: "connection lost".to_string(),
            }));
        }
    }
}

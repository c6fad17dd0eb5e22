//! Outbound collaborators: user notifications and error reporting

use crate::error::WatcherError;

use alloy_primitives::B256;
use async_trait::async_trait;
use std::fmt;
use tracing::{error, info, warn};

/// Kind of user facing notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Seen in a block, not final yet
    Submitted,
    Success,
    Error,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Submitted => "submitted",
            NotificationKind::Success => "success",
            NotificationKind::Error => "error",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivers transaction outcome notifications to the user
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        kind: NotificationKind,
        network: &str,
        hash: &B256,
        explorer_url: Option<String>,
    );
}

/// Captures errors with contextual tags
#[cfg_attr(test, mockall::automock)]
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &WatcherError, tags: &[(&'static str, String)]);
}

/// Notifier that writes notifications to the log
pub struct LogNotifier {
    enabled: bool,
}

impl LogNotifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        kind: NotificationKind,
        network: &str,
        hash: &B256,
        explorer_url: Option<String>,
    ) {
        if !self.enabled {
            return;
        }
        info!(
            kind = kind.as_str(),
            network,
            url = explorer_url.as_deref().unwrap_or(""),
            "Transaction {} {}",
            hash,
            kind
        );
    }
}

/// Error reporter backed by tracing and the error counter
#[derive(Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, err: &WatcherError, tags: &[(&'static str, String)]) {
        if !err.should_report() {
            return;
        }

        let tags = tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");

        crate::metrics::record_error(error_kind(err));
        if err.is_retryable() {
            warn!("{} [{}]", err, tags);
        } else {
            error!("{} [{}]", err, tags);
        }
    }
}

fn error_kind(err: &WatcherError) -> &'static str {
    match err {
        WatcherError::Config(_) => "config",
        WatcherError::Database(_) => "database",
        WatcherError::ChainConnection { .. } => "chain_connection",
        WatcherError::Rpc { .. } => "rpc",
        WatcherError::Decode(_) => "decode",
        WatcherError::InvalidPayload(_) | WatcherError::UnknownCall { .. } => "payload",
        WatcherError::NetworkMismatch { .. } | WatcherError::NetworkNotFound { .. } => "network",
        WatcherError::TransactionNotFound { .. } | WatcherError::DuplicateTransaction { .. } => {
            "record"
        }
        WatcherError::Subscription(_) => "subscription",
        WatcherError::Timeout { .. } => "timeout",
        WatcherError::Internal(_) => "internal",
    }
}

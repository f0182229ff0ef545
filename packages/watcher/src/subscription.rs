//! Subscription Manager
//!
//! Owns one feed subscription: connects, runs every entry through the
//! classifier in arrival order, hands recognized changes to the dispatcher and
//! reconnects with backoff when the feed drops. Entries missed while
//! disconnected are not replayed.

use std::sync::Arc;

use alloy::primitives::{Address, B256};
use alloy::rpc::types::Filter;
use futures::StreamExt;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::classifier::{ChangeEvent, EventClassifier};
use crate::dispatcher::{NotificationDispatcher, NotificationRequest};
use crate::feed::{LogFeed, RawLogEntry, RawLogStream};
use crate::selector::{SelectorKind, SelectorTable};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Gave up after {attempts} reconnect attempts: {last_error}")]
    MaxReconnectAttemptsExceeded { attempts: u32, last_error: String },
}

/// What a subscription listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    /// `SafeMultiSigTransaction` logs; owner changes are found in the inner call data
    Transactions,
    /// `AddedOwner` / `RemovedOwner` logs
    OwnerEvents,
}

impl SubscriptionKind {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionKind::Transactions => "transactions",
            SubscriptionKind::OwnerEvents => "owner-events",
        }
    }

    /// Topic0 values registered for this kind
    pub fn topics(&self, table: &SelectorTable) -> Vec<B256> {
        match self {
            SubscriptionKind::Transactions => table.event_topics(&[SelectorKind::AggregateEvent]),
            SubscriptionKind::OwnerEvents => table.event_topics(&[SelectorKind::Event]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Wait between reconnects
    pub backoff: Backoff,
    /// Consecutive failed reconnects tolerated; `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    /// Restrict the feed to these Safe contracts; empty watches every emitter
    pub wallet_addresses: Vec<Address>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            max_reconnect_attempts: None,
            wallet_addresses: Vec::new(),
        }
    }
}

/// Counters reported when a subscription stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub received: u64,
    pub recognized: u64,
    pub unrecognized: u64,
    pub malformed: u64,
    pub dispatched: u64,
    pub connections: u64,
}

enum StreamEnd {
    Disconnected,
    Shutdown,
}

pub struct SubscriptionManager<F: LogFeed> {
    name: String,
    kind: SubscriptionKind,
    feed: F,
    classifier: Arc<EventClassifier>,
    dispatcher: NotificationDispatcher,
    config: SubscriptionConfig,
    shutdown: CancellationToken,
    stats: SubscriptionStats,
}

impl<F: LogFeed> SubscriptionManager<F> {
    pub fn new(
        name: impl Into<String>,
        kind: SubscriptionKind,
        feed: F,
        classifier: Arc<EventClassifier>,
        dispatcher: NotificationDispatcher,
        config: SubscriptionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            feed,
            classifier,
            dispatcher,
            config,
            shutdown,
            stats: SubscriptionStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.stats
    }

    /// Log filter sent with every (re)connect
    pub fn filter(&self) -> Filter {
        let topics = self.kind.topics(self.classifier.table());
        let filter = Filter::new().event_signature(topics);
        if self.config.wallet_addresses.is_empty() {
            filter
        } else {
            filter.address(self.config.wallet_addresses.clone())
        }
    }

    /// Run until cancelled or the reconnect ceiling is hit
    pub async fn run(mut self) -> Result<SubscriptionStats, SubscriptionError> {
        let filter = self.filter();
        let mut attempt: u32 = 0;

        info!(subscription = %self.name, kind = self.kind.name(), "Subscription started");

        loop {
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.feed.connect(&filter) => result,
            };

            let last_error = match connected {
                Ok(stream) => {
                    attempt = 0;
                    self.stats.connections += 1;
                    info!(subscription = %self.name, connections = self.stats.connections, "Feed connected");

                    match self.consume(stream).await {
                        StreamEnd::Shutdown => break,
                        StreamEnd::Disconnected => {
                            warn!(subscription = %self.name, "FeedDisconnected: log stream ended");
                            "feed disconnected".to_string()
                        }
                    }
                }
                Err(e) => {
                    warn!(subscription = %self.name, attempt, error = %e, "Feed connection failed");
                    e.to_string()
                }
            };

            if let Some(max) = self.config.max_reconnect_attempts {
                if attempt >= max {
                    warn!(subscription = %self.name, attempts = attempt, "Reconnect attempts exhausted");
                    return Err(SubscriptionError::MaxReconnectAttemptsExceeded {
                        attempts: attempt,
                        last_error,
                    });
                }
            }

            let delay = self.config.backoff.delay(attempt);
            attempt += 1;
            info!(subscription = %self.name, attempt, "Reconnecting in {:?}", delay);

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        info!(subscription = %self.name, stats = ?self.stats, "Subscription stopped");
        Ok(self.stats)
    }

    async fn consume(&mut self, mut stream: RawLogStream) -> StreamEnd {
        loop {
            let entry = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return StreamEnd::Shutdown,
                next = stream.next() => match next {
                    Some(entry) => entry,
                    None => return StreamEnd::Disconnected,
                },
            };
            self.handle(entry).await;
        }
    }

    async fn handle(&mut self, entry: RawLogEntry) {
        self.stats.received += 1;

        let event = match self.classifier.try_classify(&entry) {
            Ok(event) => event,
            Err(e) => {
                self.stats.malformed += 1;
                warn!(
                    subscription = %self.name,
                    tx = ?entry.transaction_hash,
                    block = ?entry.block_number,
                    error = %e,
                    "Skipping malformed log entry"
                );
                return;
            }
        };

        if let ChangeEvent::Unrecognized { selector_hex } = &event {
            self.stats.unrecognized += 1;
            debug!(subscription = %self.name, selector = %selector_hex, tx = ?entry.transaction_hash, "Unrecognized selector");
            return;
        }

        self.stats.recognized += 1;
        info!(
            subscription = %self.name,
            change = %event,
            tx = ?entry.transaction_hash,
            block = ?entry.block_number,
            "Owner change detected"
        );

        let Some(request) = NotificationRequest::from_change(&event) else {
            return;
        };

        let accepted = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            accepted = self.dispatcher.enqueue(request) => accepted,
        };
        if accepted {
            self.stats.dispatched += 1;
        }
    }
}

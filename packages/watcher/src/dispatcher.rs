//! Notification Dispatcher
//!
//! Delivers owner changes to the notification service over HTTP. Each request is
//! retried with backoff on non-2xx responses, transport errors and timeouts;
//! a bounded number of deliveries run at once so a slow sink pushes back on the
//! pipeline instead of growing memory.
//!
//! Requests for the same wallet form a lane: each one starts only after the
//! previous request for that wallet reached its outcome, so the sink sees a
//! wallet's changes in arrival order. Unrelated wallets deliver concurrently.
//!
//! Delivery is at-least-once: the sink is expected to de-duplicate on
//! (wallet, action).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::backoff::Backoff;
use crate::classifier::ChangeEvent;
use crate::decoder::checksum;

/// Default notification service base URL
pub const DEFAULT_NOTIFY_URL: &str = "http://bore.pub:6644";

/// Single endpoint taking every change
pub const UNIFIED_PATH: &str = "/api/safe";
pub const ADD_PATH: &str = "/api/safe-add";
pub const REMOVE_PATH: &str = "/api/safe-remove";

/// Errors that can occur while delivering a notification
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Sink returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Delivery attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid notification URL: {0}")]
    InvalidUrl(String),
}

impl DispatchError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Status { .. } | DispatchError::Transport(_) | DispatchError::Timeout(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    Add,
    Remove,
}

/// One notification, built from one recognized change
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationRequest {
    pub wallet_address: Address,
    pub action: NotificationAction,
}

impl NotificationRequest {
    pub fn add(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            action: NotificationAction::Add,
        }
    }

    pub fn remove(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            action: NotificationAction::Remove,
        }
    }

    /// Map a change to its notification; a swap announces the incoming owner
    ///
    /// # Returns
    /// `None` for `Unrecognized`
    pub fn from_change(event: &ChangeEvent) -> Option<Self> {
        match event {
            ChangeEvent::OwnerAdded { owner } => Some(Self::add(*owner)),
            ChangeEvent::OwnerRemoved { owner } => Some(Self::remove(*owner)),
            ChangeEvent::OwnerSwapped { new_owner, .. } => Some(Self::add(*new_owner)),
            ChangeEvent::Unrecognized { .. } => None,
        }
    }

    /// Checksummed wallet address
    pub fn wallet_addr(&self) -> String {
        checksum(&self.wallet_address)
    }

    /// Wire body for the sink
    pub fn payload(&self) -> SafeRequest {
        SafeRequest {
            wallet_addr: self.wallet_addr(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.payload())
    }
}

/// JSON body accepted by the notification service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafeRequest {
    pub wallet_addr: String,
}

/// Which paths the sink exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum EndpointMode {
    /// Everything goes to `/api/safe`
    #[default]
    Unified,
    /// `/api/safe-add` and `/api/safe-remove`
    PerAction,
}

impl EndpointMode {
    pub fn path(&self, action: NotificationAction) -> &'static str {
        match (self, action) {
            (EndpointMode::Unified, _) => UNIFIED_PATH,
            (EndpointMode::PerAction, NotificationAction::Add) => ADD_PATH,
            (EndpointMode::PerAction, NotificationAction::Remove) => REMOVE_PATH,
        }
    }
}

/// Raw sink reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResponse {
    pub status: u16,
    pub body: String,
}

impl SinkResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Destination for notifications; one call per delivery attempt
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Issue one attempt. Non-2xx replies come back as `Ok` with their status.
    async fn deliver(&self, request: &NotificationRequest) -> Result<SinkResponse, DispatchError>;
}

/// HTTP sink posting JSON to the notification service
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    base_url: String,
    mode: EndpointMode,
}

impl HttpSink {
    pub fn new(base_url: impl Into<String>, mode: EndpointMode) -> Result<Self, DispatchError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        reqwest::Url::parse(&base_url).map_err(|e| DispatchError::InvalidUrl(format!("{base_url}: {e}")))?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            mode,
        })
    }

    pub fn url_for(&self, action: NotificationAction) -> String {
        format!("{}{}", self.base_url, self.mode.path(action))
    }
}

#[async_trait]
impl NotificationSink for HttpSink {
    async fn deliver(&self, request: &NotificationRequest) -> Result<SinkResponse, DispatchError> {
        let body = request.to_json()?;
        let response = self
            .client
            .post(self.url_for(request.action))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        Ok(SinkResponse { status, body })
    }
}

/// Retry and concurrency settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Total attempts per request, the first one included
    pub max_attempts: u32,
    /// Upper bound on a single attempt
    pub attempt_timeout: Duration,
    /// Wait between attempts
    pub retry_backoff: Backoff,
    /// Deliveries allowed in flight at once, counting ones queued behind
    /// an earlier request for the same wallet
    pub max_in_flight: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(10),
            retry_backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(5)).with_jitter(0.1),
            max_in_flight: 4,
        }
    }
}

/// Terminal result of one request
#[derive(Debug)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32, status: u16, body: String },
    Failed { attempts: u32, error: DispatchError },
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            DeliveryOutcome::Delivered { attempts, .. } | DeliveryOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

/// What happened to deliveries by shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Deliveries that ran to an outcome over the dispatcher's lifetime
    pub completed: usize,
    pub aborted: usize,
}

/// Latest request queued for one wallet
struct Lane {
    seq: u64,
    /// Resolves (or errors) once that request is done
    done: oneshot::Receiver<()>,
}

struct InFlight {
    tasks: JoinSet<DeliveryOutcome>,
    /// Finished tasks collected by `enqueue`
    reaped: usize,
    closed: bool,
}

struct Inner {
    sink: Arc<dyn NotificationSink>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
    in_flight: Mutex<InFlight>,
    lanes: Mutex<HashMap<Address, Lane>>,
    next_seq: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Cloneable handle; all clones share one in-flight set
#[derive(Clone)]
pub struct NotificationDispatcher {
    inner: Arc<Inner>,
}

impl NotificationDispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>, config: DispatcherConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self {
            inner: Arc::new(Inner {
                sink,
                config,
                permits,
                in_flight: Mutex::new(InFlight {
                    tasks: JoinSet::new(),
                    reaped: 0,
                    closed: false,
                }),
                lanes: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Requests that reached a 2xx response
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Requests that exhausted their attempts
    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Free in-flight slots
    pub fn available_slots(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Deliver one request, retrying until success or the attempt ceiling
    ///
    /// Never panics and never propagates: a failure is logged and returned as
    /// `DeliveryOutcome::Failed`.
    pub async fn submit(&self, request: &NotificationRequest) -> DeliveryOutcome {
        let config = &self.inner.config;
        let max_attempts = config.max_attempts.max(1);
        let wallet = request.wallet_addr();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match timeout(config.attempt_timeout, self.inner.sink.deliver(request)).await {
                Ok(Ok(response)) if response.is_success() => {
                    info!(
                        wallet = %wallet,
                        action = ?request.action,
                        attempts = attempt,
                        status = response.status,
                        body = %response.body,
                        "Notification delivered"
                    );
                    self.inner.delivered.fetch_add(1, Ordering::Relaxed);
                    return DeliveryOutcome::Delivered {
                        attempts: attempt,
                        status: response.status,
                        body: response.body,
                    };
                }
                Ok(Ok(response)) => DispatchError::Status {
                    status: response.status,
                    body: response.body,
                },
                Ok(Err(e)) => e,
                Err(_) => DispatchError::Timeout(config.attempt_timeout),
            };

            if !error.is_retryable() || attempt >= max_attempts {
                error!(
                    wallet = %wallet,
                    action = ?request.action,
                    attempts = attempt,
                    error = %error,
                    "Notification delivery failed"
                );
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                return DeliveryOutcome::Failed {
                    attempts: attempt,
                    error,
                };
            }

            let delay = config.retry_backoff.delay(attempt - 1);
            warn!(
                wallet = %wallet,
                attempt,
                max_attempts,
                error = %error,
                "Notification attempt failed, retrying in {:?}",
                delay
            );
            sleep(delay).await;
        }
    }

    /// Hand a request off for background delivery
    ///
    /// Waits for a free in-flight slot first, which is what applies backpressure
    /// to the caller. The delivery itself waits for any earlier request for the
    /// same wallet.
    ///
    /// # Returns
    /// `false` if the dispatcher is draining and the request was dropped
    pub async fn enqueue(&self, request: NotificationRequest) -> bool {
        let Ok(permit) = self.inner.permits.clone().acquire_owned().await else {
            warn!(wallet = %request.wallet_addr(), "Dispatcher is draining; notification dropped");
            return false;
        };

        let mut in_flight = self.inner.in_flight.lock().await;
        // drain() may have started while this call held a permit
        if in_flight.closed {
            warn!(wallet = %request.wallet_addr(), "Dispatcher is draining; notification dropped");
            return false;
        }
        while let Some(finished) = in_flight.tasks.try_join_next() {
            in_flight.reaped += 1;
            log_join_result(finished);
        }

        let wallet = request.wallet_address;
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        let previous = self
            .inner
            .lanes
            .lock()
            .await
            .insert(wallet, Lane { seq, done: done_rx });

        let dispatcher = self.clone();
        in_flight.tasks.spawn(async move {
            if let Some(previous) = previous {
                // An error means the earlier task was aborted; go ahead
                let _ = previous.done.await;
            }
            let outcome = dispatcher.submit(&request).await;
            dispatcher.release_lane(wallet, seq).await;
            let _ = done_tx.send(());
            drop(permit);
            outcome
        });
        true
    }

    /// Forget the lane if `seq` is still its last request
    async fn release_lane(&self, wallet: Address, seq: u64) {
        let mut lanes = self.inner.lanes.lock().await;
        if lanes.get(&wallet).is_some_and(|lane| lane.seq == seq) {
            lanes.remove(&wallet);
        }
    }

    /// Wallets with a delivery queued or running
    pub async fn active_lanes(&self) -> usize {
        self.inner.lanes.lock().await.len()
    }

    /// Stop accepting work, wait up to `grace` for in-flight deliveries, abort the rest
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        let deadline = Instant::now() + grace;
        self.inner.permits.close();

        let mut in_flight = self.inner.in_flight.lock().await;
        in_flight.closed = true;
        let mut report = DrainReport {
            completed: in_flight.reaped,
            aborted: 0,
        };

        loop {
            match tokio::time::timeout_at(deadline, in_flight.tasks.join_next()).await {
                Ok(Some(finished)) => {
                    report.completed += 1;
                    log_join_result(finished);
                }
                Ok(None) => break,
                Err(_) => {
                    report.aborted = in_flight.tasks.len();
                    in_flight.tasks.abort_all();
                    while in_flight.tasks.join_next().await.is_some() {}
                    warn!(aborted = report.aborted, "Shutdown grace period elapsed; deliveries aborted");
                    break;
                }
            }
        }

        info!(completed = report.completed, aborted = report.aborted, "Dispatcher drained");
        report
    }
}

fn log_join_result(result: Result<DeliveryOutcome, JoinError>) {
    if let Err(e) = result {
        if !e.is_cancelled() {
            error!(error = %e, "Delivery task panicked");
        }
    }
}

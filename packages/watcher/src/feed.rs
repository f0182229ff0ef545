//! Log Feed
//!
//! Connects to a blockchain node over WebSocket or Unix IPC and streams the raw
//! logs matching a topic filter. A stream that ends means the feed dropped;
//! reconnection is the subscription manager's job.

use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::pubsub::PubSubFrontend;
use alloy::rpc::types::{Filter, Log};
use alloy::transports::ipc::IpcConnect;
use alloy::transports::ws::WsConnect;
use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Connection timeout in milliseconds
pub const CONNECTION_TIMEOUT_MS: u64 = 10000;

/// Errors that can occur while connecting to the feed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("IPC socket not found at path: {0}")]
    SocketNotFound(String),

    #[error("Invalid IPC path: {0}")]
    InvalidPath(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Connection timeout after {0}ms")]
    Timeout(u64),
}

/// Where the node lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEndpoint {
    /// `ws://` or `wss://` URL
    Ws { url: String },
    /// Unix socket path; a leading `~/` is expanded
    Ipc { path: String },
}

impl fmt::Display for FeedEndpoint {
    /// Never prints API keys embedded in the URL path
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedEndpoint::Ws { url } => write!(f, "{}", redact_url(url)),
            FeedEndpoint::Ipc { path } => write!(f, "ipc://{}", path),
        }
    }
}

/// Replace the key segment of a `/v2/<key>` style URL
pub fn redact_url(url: &str) -> String {
    match url.find("/v2/") {
        Some(index) if url.len() > index + 4 => format!("{}/v2/***", &url[..index]),
        _ => url.to_string(),
    }
}

/// Expand ~ to home directory in path
pub fn expand_path(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen("~", &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

/// Check if an IPC socket exists at the given path
pub fn socket_exists(path: &str) -> bool {
    Path::new(&expand_path(path)).exists()
}

/// Validate that a path looks like a valid IPC socket path
pub fn validate_ipc_path(path: &str) -> Result<(), FeedError> {
    if path.is_empty() {
        return Err(FeedError::InvalidPath("Path cannot be empty".to_string()));
    }

    let expanded = expand_path(path);
    if !expanded.ends_with(".ipc") && !expanded.contains("geth") && !expanded.contains("anvil") {
        warn!("IPC path '{}' may not be a valid socket path", path);
    }

    Ok(())
}

/// One log as delivered by the feed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawLogEntry {
    /// Emitting contract
    pub address: Address,
    /// Indexed topics; `topics[0]` is the event signature hash
    pub topics: Vec<B256>,
    /// Non-indexed, ABI-encoded body
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<u64>,
}

impl RawLogEntry {
    pub fn new(topics: Vec<B256>, data: impl Into<Bytes>) -> Self {
        Self {
            topics,
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    pub fn with_block_number(mut self, block_number: u64) -> Self {
        self.block_number = Some(block_number);
        self
    }
}

impl From<&Log> for RawLogEntry {
    fn from(log: &Log) -> Self {
        Self {
            address: log.address(),
            topics: log.topics().to_vec(),
            data: log.data().data.clone(),
            block_number: log.block_number,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
        }
    }
}

/// Stream of log entries for one connection
pub type RawLogStream = Pin<Box<dyn Stream<Item = RawLogEntry> + Send>>;

/// A push-based log source
#[async_trait]
pub trait LogFeed: Send + Sync {
    /// Open a subscription for `filter`; the stream ends when the connection drops
    async fn connect(&self, filter: &Filter) -> Result<RawLogStream, FeedError>;
}

/// Feed backed by an alloy pub-sub provider
#[derive(Debug, Clone)]
pub struct ProviderFeed {
    endpoint: FeedEndpoint,
    timeout_ms: u64,
}

impl ProviderFeed {
    pub fn new(endpoint: FeedEndpoint) -> Self {
        Self {
            endpoint,
            timeout_ms: CONNECTION_TIMEOUT_MS,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn endpoint(&self) -> &FeedEndpoint {
        &self.endpoint
    }

    async fn provider(&self) -> Result<RootProvider<PubSubFrontend>, FeedError> {
        match &self.endpoint {
            FeedEndpoint::Ws { url } => {
                info!(endpoint = %self.endpoint, "Connecting to websocket feed");
                ProviderBuilder::new()
                    .on_ws(WsConnect::new(url.clone()))
                    .await
                    .map_err(|e| FeedError::ConnectionFailed(e.to_string()))
            }
            FeedEndpoint::Ipc { path } => {
                let expanded = expand_path(path);
                if !Path::new(&expanded).exists() {
                    return Err(FeedError::SocketNotFound(expanded));
                }

                info!("Connecting to IPC socket at {}", expanded);
                let ipc: IpcConnect<String> = IpcConnect::new(expanded);
                ProviderBuilder::new()
                    .on_ipc(ipc)
                    .await
                    .map_err(|e| FeedError::ConnectionFailed(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl LogFeed for ProviderFeed {
    async fn connect(&self, filter: &Filter) -> Result<RawLogStream, FeedError> {
        let provider = tokio::time::timeout(Duration::from_millis(self.timeout_ms), self.provider())
            .await
            .map_err(|_| FeedError::Timeout(self.timeout_ms))??;

        let subscription = provider
            .subscribe_logs(filter)
            .await
            .map_err(|e| FeedError::SubscriptionFailed(e.to_string()))?;
        info!(endpoint = %self.endpoint, "Subscribed to logs");

        // The provider rides along with the subscription so the connection
        // stays open for as long as the stream is polled.
        let stream = futures::stream::unfold(
            (provider, subscription),
            |(provider, mut subscription)| async move {
                loop {
                    match subscription.recv().await {
                        Ok(log) => {
                            let entry = RawLogEntry::from(&log);
                            return Some((entry, (provider, subscription)));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Log subscription lagged; entries dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}

//! Watcher configuration
//!
//! Read once at startup from flags with environment fallbacks.

use std::time::Duration;

use alloy::primitives::Address;
use clap::{Parser, ValueEnum};
use thiserror::Error;

use crate::backoff::Backoff;
use crate::dispatcher::{DispatcherConfig, EndpointMode, DEFAULT_NOTIFY_URL};
use crate::feed::{validate_ipc_path, FeedEndpoint, FeedError};
use crate::subscription::{SubscriptionConfig, SubscriptionKind};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No feed endpoint configured: set ALCHEMY_API_KEY, --ws-url or --ipc-path")]
    MissingEndpoint,

    #[error("Invalid websocket URL '{0}': expected ws:// or wss://")]
    InvalidWsUrl(String),

    #[error(transparent)]
    Ipc(#[from] FeedError),

    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
}

/// Alchemy-hosted networks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Network {
    #[default]
    BaseSepolia,
    BaseMainnet,
    EthMainnet,
    EthSepolia,
}

impl Network {
    pub fn alchemy_slug(&self) -> &'static str {
        match self {
            Network::BaseSepolia => "base-sepolia",
            Network::BaseMainnet => "base-mainnet",
            Network::EthMainnet => "eth-mainnet",
            Network::EthSepolia => "eth-sepolia",
        }
    }

    pub fn alchemy_ws_url(&self, api_key: &str) -> String {
        format!("wss://{}.g.alchemy.com/v2/{}", self.alchemy_slug(), api_key)
    }
}

/// Which subscriptions to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SubscriptionSet {
    Transactions,
    OwnerEvents,
    #[default]
    Both,
}

impl SubscriptionSet {
    pub fn kinds(&self) -> Vec<SubscriptionKind> {
        match self {
            SubscriptionSet::Transactions => vec![SubscriptionKind::Transactions],
            SubscriptionSet::OwnerEvents => vec![SubscriptionKind::OwnerEvents],
            SubscriptionSet::Both => vec![SubscriptionKind::Transactions, SubscriptionKind::OwnerEvents],
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "safewatch", author, version, about = "Watch Safe wallets for owner changes", long_about = None)]
pub struct WatcherConfig {
    /// Alchemy API key
    #[arg(long, env = "ALCHEMY_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Alchemy network
    #[arg(long, env = "WATCHER_NETWORK", value_enum, default_value_t = Network::BaseSepolia)]
    pub network: Network,

    /// Explicit websocket URL; overrides the Alchemy URL
    #[arg(long, env = "WATCHER_WS_URL")]
    pub ws_url: Option<String>,

    /// Local node IPC socket; takes precedence over any websocket
    #[arg(long, env = "WATCHER_IPC_PATH")]
    pub ipc_path: Option<String>,

    /// Notification service base URL
    #[arg(long, env = "NOTIFY_BASE_URL", default_value = DEFAULT_NOTIFY_URL)]
    pub notify_url: String,

    /// Notification endpoint layout
    #[arg(long, env = "NOTIFY_ENDPOINT_MODE", value_enum, default_value_t = EndpointMode::Unified)]
    pub endpoint_mode: EndpointMode,

    /// Subscriptions to run
    #[arg(long, env = "WATCHER_SUBSCRIPTIONS", value_enum, default_value_t = SubscriptionSet::Both)]
    pub subscriptions: SubscriptionSet,

    /// Only watch these Safe contracts (repeatable, or comma separated in the env var)
    #[arg(long = "safe-address", env = "WATCHER_SAFE_ADDRESSES", value_delimiter = ',')]
    pub safe_addresses: Vec<Address>,

    /// Delivery attempts per notification, the first one included
    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 10_000)]
    pub attempt_timeout_ms: u64,

    /// Initial wait between delivery attempts
    #[arg(long, default_value_t = 250)]
    pub retry_backoff_ms: u64,

    /// Deliveries allowed in flight at once
    #[arg(long, default_value_t = 4)]
    pub max_in_flight: usize,

    #[arg(long, default_value_t = 100)]
    pub reconnect_initial_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub reconnect_max_ms: u64,

    /// Consecutive failed reconnects before giving up (default: never)
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    /// How long in-flight deliveries may finish after shutdown is requested
    #[arg(long, default_value_t = 5_000)]
    pub shutdown_grace_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,
}

impl WatcherConfig {
    /// Pick the feed endpoint: IPC path, then explicit websocket URL, then Alchemy
    pub fn feed_endpoint(&self) -> Result<FeedEndpoint, ConfigError> {
        if let Some(path) = self.ipc_path.as_deref().filter(|p| !p.is_empty()) {
            validate_ipc_path(path)?;
            return Ok(FeedEndpoint::Ipc { path: path.to_string() });
        }

        if let Some(url) = self.ws_url.as_deref().filter(|u| !u.is_empty()) {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return Err(ConfigError::InvalidWsUrl(url.to_string()));
            }
            return Ok(FeedEndpoint::Ws { url: url.to_string() });
        }

        match self.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Ok(FeedEndpoint::Ws {
                url: self.network.alchemy_ws_url(key),
            }),
            None => Err(ConfigError::MissingEndpoint),
        }
    }

    /// Check everything that can be checked before connecting
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.feed_endpoint()?;
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero { name: "max-attempts" });
        }
        if self.max_in_flight == 0 {
            return Err(ConfigError::Zero { name: "max-in-flight" });
        }
        if self.attempt_timeout_ms == 0 {
            return Err(ConfigError::Zero {
                name: "attempt-timeout-ms",
            });
        }
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let initial = Duration::from_millis(self.retry_backoff_ms);
        DispatcherConfig {
            max_attempts: self.max_attempts,
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            retry_backoff: Backoff::new(initial, initial.saturating_mul(20)).with_jitter(0.1),
            max_in_flight: self.max_in_flight,
        }
    }

    pub fn subscription_config(&self) -> SubscriptionConfig {
        SubscriptionConfig {
            backoff: Backoff::new(
                Duration::from_millis(self.reconnect_initial_ms),
                Duration::from_millis(self.reconnect_max_ms),
            )
            .with_jitter(0.1),
            max_reconnect_attempts: self.max_reconnect_attempts,
            wallet_addresses: self.safe_addresses.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

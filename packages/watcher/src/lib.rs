//! Safewatch Watcher Library
//!
//! This crate provides components for watching Safe multi-signature wallets for
//! owner changes, decoding the ABI payloads that carry them, and forwarding the
//! affected owner to a notification service.

pub mod backoff;
pub mod classifier;
pub mod config;
pub mod decoder;
pub mod dispatcher;
pub mod feed;
pub mod selector;
pub mod subscription;

// Re-export commonly used types
pub use backoff::Backoff;
pub use classifier::{ChangeEvent, EventClassifier};
pub use config::{ConfigError, WatcherConfig};
pub use decoder::{decode, DecodeError, DecodedRecord, FieldSchema, FieldType};
pub use dispatcher::{
    DeliveryOutcome, DispatchError, DispatcherConfig, HttpSink, NotificationDispatcher, NotificationRequest,
    NotificationSink,
};
pub use feed::{FeedEndpoint, FeedError, LogFeed, ProviderFeed, RawLogEntry, RawLogStream};
pub use selector::{default_table, Selector, SelectorTable};
pub use subscription::{SubscriptionConfig, SubscriptionError, SubscriptionKind, SubscriptionManager, SubscriptionStats};

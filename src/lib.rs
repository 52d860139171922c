//! Chain notification client over a compact-filter chain service.
//!
//! Applications register addresses and outpoints with a [`ChainClient`]; the client
//! keeps at most one rescan worker alive, grows its watch-list as registrations come
//! in, and replaces it when a rescan over a new range is requested.

pub mod chain;
pub mod client;
pub mod config;
pub mod error;
pub mod notifications;
pub mod rescan;

pub use chain::{BlockStamp, ChainService, FilterType, MockChainService, QueryOptions};
pub use client::{ChainClient, WatchRequest};
pub use config::ClientConfig;
pub use error::ClientError;
pub use notifications::{Notification, NotificationSink};
pub use rescan::{MockRescanFactory, RescanFactory, RescanOptions, RescanUpdate, Rescanner};

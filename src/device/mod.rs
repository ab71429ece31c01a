//! # Device Module - MeshCore Companion Radio Connection
//!
//! Everything between the radio and the rest of the gateway.
//!
//! ## Features
//!
//! - **Single owner**: one driver task owns the link; callers go through the bridge
//! - **Lifecycle**: connect, linear backoff retry, health checks, reconnect on loss
//! - **Ordered ingest**: events dispatched in arrival order on one ingest line
//! - **Epochs**: events from a dead connection never reach the next one's handlers
//! - **Companion protocol**: frame codec over serial or TCP
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshgate::config::DeviceConfig;
//! use meshgate::device::{CompanionConnector, DeviceManager};
//! use meshgate::live::NullSink;
//! use meshgate::storage::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DeviceConfig::default();
//!     let connector = Arc::new(CompanionConnector::new(config.connect_timeout()));
//!     let store = Arc::new(SqliteStore::in_memory()?);
//!     let manager = DeviceManager::new(config, connector, store, Arc::new(NullSink));
//!     manager.start();
//!     let outcome = manager.send_channel_message(0, "hello mesh").await;
//!     println!("{}", serde_json::to_string(&outcome)?);
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod bridge;
pub mod codec;
pub mod commands;
pub mod companion;
pub mod events;
pub mod framer;
pub mod ingest;
pub mod lifecycle;
pub mod link;
pub mod types;

pub use actions::CommandOutcome;
pub use bridge::CommandBridge;
pub use commands::{CommandTimeouts, DeviceRequest, DeviceResponse, RequestId};
pub use companion::{CompanionConnector, CompanionLink};
pub use events::{DeviceEvent, EventBus, EventHandler, EventKind, Subscription};
pub use lifecycle::{ConnectionStatus, DeviceManager, LifecycleState, RetryPolicy};
pub use link::{Connector, DeviceLink, Inbound, TransportTarget};
pub use types::{BatteryInfo, ChannelInfo, DeviceContact, DeviceInfo, SelfInfo, SentInfo};

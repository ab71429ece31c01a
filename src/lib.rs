//! # Meshgate - Gateway for MeshCore Companion Radios
//!
//! Meshgate owns the long-lived connection to one MeshCore companion radio and
//! turns its asynchronous event stream into durable storage and live updates,
//! while letting any number of callers issue commands over the same link.
//!
//! ## Features
//!
//! - **Connection lifecycle**: connect, linear backoff retry, health checks and reconnect
//! - **Command bridge**: many callers, one command in flight, exactly one outcome each
//! - **Ordered ingest**: events persisted in arrival order, never across connections
//! - **SQLite storage**: WAL mode, idempotent contact upserts, FTS5 message search
//! - **Live updates**: broadcast fan-out of every ingested event to UI sessions
//! - **Transports**: USB serial (auto-detected or configured) and TCP
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//! use meshgate::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("config.toml").await?;
//!     config.apply_env_overrides();
//!
//!     let gateway = Gateway::new(config)?;
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`device`] - device connection manager, command bridge, event bus, wire codec
//! - [`storage`] - persistence layer
//! - [`live`] - live-update sink
//! - [`gateway`] - the context that wires the pieces together
//! - [`config`] - configuration loading and environment overrides
//! - [`validation`] - input checks for keys, channels and message text
//!
//! ## Architecture
//!
//! ```text
//!  callers ──► CommandBridge ──► driver task ──► DeviceLink (serial / TCP)
//!                                    │
//!                                    ▼
//!                              ingest line ──► handlers ──► Store + LiveSink
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod live;
pub mod logutil;
pub mod metrics;
pub mod storage;
pub mod validation;

//! # sigrelay-bridge
//!
//! Producer-side relay agent. Runs next to the data source (behind the
//! network boundary), makes one outbound WebSocket connection to the relay,
//! and answers forwarded `request` frames by querying a local read-only
//! SQLite database.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sigrelay_bridge::{BridgeClient, BridgeConfig, SqliteResolver};
//!
//! let resolver = Arc::new(SqliteResolver::open("live_signals.db")?);
//! let client = BridgeClient::new(BridgeConfig::default(), resolver);
//! client.run().await; // reconnects forever
//! ```
//!
//! Custom data sources implement [`ResourceResolver`]; the SQLite resolver is
//! just the default backend.

pub mod client;
pub mod resolver;
pub mod sqlite;

pub use client::{BridgeClient, BridgeConfig, BridgeError};
pub use resolver::{BoxFuture, ResolveError, ResourceResolver};
pub use sqlite::SqliteResolver;

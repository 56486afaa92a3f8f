//! # sigrelay-server
//!
//! Request/response WebSocket relay between one producer and many consumers.
//!
//! A data-producing agent behind a network boundary makes a single outbound
//! connection to the relay; any number of consumers connect and issue `get`
//! requests. The relay forwards each request to the producer with a
//! correlation id, routes the asynchronous answer back to the consumer that
//! asked, and synthesizes a bounded-time error when no answer arrives.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use sigrelay_server::{RelayConfig, RelayServer};
//!
//! let config = RelayConfig::new()
//!     .bind("0.0.0.0:8080".parse()?)
//!     .with_tokens(producer_token, consumer_token);
//!
//! let server = RelayServer::bind(config).await?;
//! server.serve().await?;
//! ```
//!
//! # Guarantees
//!
//! - Every correlation id is resolved at most once: by the producer's
//!   response, by the timeout supervisor, or abandoned when its consumer
//!   disconnects — whichever happens first.
//! - At most one producer is live at a time; a reconnecting producer
//!   atomically supersedes the previous one (tracked by a generation
//!   counter), and frames from the superseded session are discarded.
//! - A single session's failure never affects other sessions or the process.
//!
//! # Wire Protocol
//!
//! See [`sigrelay_protocol`] for the message shapes and close codes.

pub mod auth;
pub mod config;
pub mod error;
pub mod relay;
pub(crate) mod server;
pub(crate) mod session;

pub use auth::{AuthError, Authenticator, SessionId};
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use relay::RelayCore;
pub use server::RelayServer;

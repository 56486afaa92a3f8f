//! Pluggable resource resolution.
//!
//! The bridge hands every forwarded request to a [`ResourceResolver`]: an
//! opaque resource name plus the request's parameter mapping in, a JSON array
//! of records (or a typed failure) out. The relay never sees this trait —
//! it only ships frames.

use core::future::Future;
use core::pin::Pin;

use serde_json::{Map, Value};
use thiserror::Error;

/// Type alias matching the manual-future pattern used across the codebase
/// (no `async_trait`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors a resolver can produce.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The resolver does not serve this resource name.
    ///
    /// Reported to the requesting consumer as an `unknown_resource` response.
    #[error("unknown resource")]
    UnknownResource,

    /// The underlying storage failed.
    ///
    /// Not reported to the consumer — the bridge logs it and lets the relay's
    /// request timeout fire instead, since the error set on the wire is fixed.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Answers data requests forwarded by the relay.
pub trait ResourceResolver: Send + Sync {
    /// Resolve `resource` with the request's parameter mapping into a JSON
    /// array of records.
    ///
    /// Implementations must clamp any `limit` parameter into the safe range
    /// (see [`sigrelay_protocol::clamp_limit`]) before touching storage.
    fn resolve<'a>(
        &'a self,
        resource: &'a str,
        params: &'a Map<String, Value>,
    ) -> BoxFuture<'a, Result<Value, ResolveError>>;
}

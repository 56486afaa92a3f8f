//! Session identity and first-message authentication.
//!
//! Every connection must present an `auth` frame as its very first message,
//! within the configured deadline. The decision itself ([`Authenticator::decide`])
//! is a pure function from frame text to role-or-error; the session layer owns
//! the deadline and the close handshake.
//!
//! One attempt per connection — a failed auth closes the socket with a
//! reason-specific close code and the client is responsible for reconnecting.

use sigrelay_protocol::{close_code, ClientMessage, Role};
use thiserror::Error;

use crate::config::RelayConfig;

// ════════════════════════════════════════════════════════════════════
// Session identity
// ════════════════════════════════════════════════════════════════════

/// Opaque identifier for a connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// ════════════════════════════════════════════════════════════════════
// Auth failures
// ════════════════════════════════════════════════════════════════════

/// Why a connection was refused during authentication.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No frame arrived within the auth deadline.
    #[error("timed out waiting for auth message")]
    Timeout,

    /// The first frame was not valid JSON.
    #[error("malformed auth payload")]
    Malformed,

    /// The first frame parsed but was not an `auth` message.
    #[error("auth message expected")]
    NotAuth,

    /// The claimed role is not `producer` or `consumer`.
    #[error("unknown role '{0}'")]
    UnknownRole(String),

    /// The token does not match the secret for the claimed role.
    #[error("invalid token for role {0}")]
    InvalidToken(Role),
}

impl AuthError {
    /// The WebSocket close code sent for this failure.
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::Timeout | AuthError::Malformed => close_code::AUTH_FAILED,
            AuthError::NotAuth => close_code::AUTH_EXPECTED,
            AuthError::UnknownRole(_) | AuthError::InvalidToken(_) => close_code::INVALID_TOKEN,
        }
    }

    /// Short close-frame reason (no secrets, no claimed-token echo).
    pub fn close_reason(&self) -> &'static str {
        match self {
            AuthError::Timeout | AuthError::Malformed => "auth failed",
            AuthError::NotAuth => "auth message expected",
            AuthError::UnknownRole(_) | AuthError::InvalidToken(_) => "invalid token",
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Authenticator
// ════════════════════════════════════════════════════════════════════

/// Validates auth frames against the role-specific shared secrets.
pub struct Authenticator {
    producer_token: String,
    consumer_token: String,
}

impl Authenticator {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            producer_token: config.producer_token.clone(),
            consumer_token: config.consumer_token.clone(),
        }
    }

    /// Decide the role for a connection from its first frame.
    pub fn decide(&self, first_frame: &str) -> Result<Role, AuthError> {
        let msg: ClientMessage =
            serde_json::from_str(first_frame).map_err(|_| AuthError::Malformed)?;

        let (role, token) = match msg {
            ClientMessage::Auth { role, token } => (role, token),
            _ => return Err(AuthError::NotAuth),
        };

        let role = Role::parse(&role).ok_or(AuthError::UnknownRole(role))?;

        let expected = match role {
            Role::Producer => &self.producer_token,
            Role::Consumer => &self.consumer_token,
        };

        if token == *expected {
            Ok(role)
        } else {
            Err(AuthError::InvalidToken(role))
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════

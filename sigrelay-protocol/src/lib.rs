//! # sigrelay-protocol
//!
//! Shared wire protocol types for the sigrelay ecosystem.
//!
//! This crate is `no_std + alloc` compatible so it can be used from:
//!
//! - **`sigrelay-server`** — the relay (Axum/Tokio)
//! - **`sigrelay-bridge`** — the producer-side agent (`tokio-tungstenite`)
//! - **`sigrelay-cli`** — the consumer test client
//!
//! # Wire Protocol
//!
//! All messages are JSON text frames with a `"type"` discriminant tag:
//!
//! ## Session → Relay ([`ClientMessage`])
//!
//! - `auth` — first frame on every connection; claims a role with a token
//! - `get` — consumer request for a named resource
//! - `response` — producer answer, correlated by `request_id`
//!
//! ## Relay → Session ([`ServerMessage`])
//!
//! - `auth_ok` — acknowledgement naming the granted role
//! - `request` — forwarded consumer request, delivered to the producer
//! - `response` — answer (or synthesized error) delivered to a consumer
//!
//! A `response` travels producer → relay → consumer; the relay re-sends the
//! producer's frame verbatim, so producers may attach fields beyond the ones
//! modeled here.
//!
//! # Close codes
//!
//! Authentication failures close the WebSocket with a reason-specific code
//! ([`close_code`]). The numeric values are relay-internal; clients should
//! only rely on distinct codes meaning distinct reasons.

#![no_std]

extern crate alloc;

use alloc::string::String;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ════════════════════════════════════════════════════════════════════
// Roles
// ════════════════════════════════════════════════════════════════════

/// The two session roles a connection can authenticate as.
///
/// A session has exactly one role for its lifetime once authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The single session authorized to answer data requests.
    Producer,
    /// A session that issues `get` requests.
    Consumer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Producer => "producer",
            Role::Consumer => "consumer",
        }
    }

    /// Parse a role claim from an auth message.
    ///
    /// Returns `None` for unrecognized roles — the claim is free-form text on
    /// the wire so that a bad role can be rejected with the invalid-credential
    /// close code instead of failing JSON parsing.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "producer" => Some(Role::Producer),
            "consumer" => Some(Role::Consumer),
            _ => None,
        }
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ════════════════════════════════════════════════════════════════════
// Session → Relay
// ════════════════════════════════════════════════════════════════════

/// A message received by the relay from a connected session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Role claim; must be the first frame on every connection.
    ///
    /// `role` stays a plain string here so an unknown role is an
    /// authentication failure, not a parse error.
    Auth { role: String, token: String },

    /// Consumer request for a named resource.
    Get {
        resource: String,
        #[serde(default)]
        params: Map<String, Value>,
        /// Caller-supplied correlation id; generated by the relay if absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Producer answer. Only `request_id` is needed for routing; everything
    /// else rides along and is forwarded verbatim.
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        #[serde(flatten)]
        rest: Map<String, Value>,
    },
}

// ════════════════════════════════════════════════════════════════════
// Relay → Session
// ════════════════════════════════════════════════════════════════════

/// A message sent by the relay to a connected session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication acknowledgement naming the granted role.
    AuthOk { role: Role },

    /// A consumer request forwarded to the producer.
    Request {
        request_id: String,
        resource: String,
        params: Map<String, Value>,
    },

    /// Answer delivered to a consumer — either the producer's result or an
    /// error synthesized by the relay.
    Response(ResponsePayload),
}

/// Body of a `response` frame.
///
/// `status: ok` carries `data`; `status: error` carries `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub request_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
}

impl ResponsePayload {
    /// A successful response carrying `data`.
    pub fn ok(request_id: String, data: Value) -> Self {
        Self {
            request_id,
            status: Status::Ok,
            data: Some(data),
            error: None,
        }
    }

    /// An error response carrying a machine-readable [`ErrorKind`].
    pub fn error(request_id: String, error: ErrorKind) -> Self {
        Self {
            request_id,
            status: Status::Error,
            data: None,
            error: Some(error),
        }
    }

    /// Render as a session→relay `response` frame (what a producer sends).
    pub fn into_client_frame(self) -> ClientMessage {
        let mut rest = Map::new();
        if let Ok(status) = serde_json::to_value(&self.status) {
            rest.insert("status".into(), status);
        }
        if let Some(data) = self.data {
            rest.insert("data".into(), data);
        }
        if let Some(error) = self.error {
            if let Ok(error) = serde_json::to_value(&error) {
                rest.insert("error".into(), error);
            }
        }
        ClientMessage::Response {
            request_id: Some(self.request_id),
            rest,
        }
    }
}

/// Outcome discriminant of a `response` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    Error,
}

/// Machine-readable error codes carried in `response` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The producer's resolver does not serve this resource.
    UnknownResource,
    /// No producer session is connected to the relay.
    ProducerOffline,
    /// Forwarding the request to the producer failed.
    SendFailed,
    /// The producer did not answer within the request deadline.
    Timeout,
}

// ════════════════════════════════════════════════════════════════════
// Close codes
// ════════════════════════════════════════════════════════════════════

/// WebSocket close codes for authentication failures.
///
/// Distinct codes for distinct reasons; the numeric values themselves are not
/// part of the external contract.
pub mod close_code {
    /// Auth wait timed out or the first frame was not valid JSON.
    pub const AUTH_FAILED: u16 = 4000;
    /// The first frame parsed but was not an `auth` message.
    pub const AUTH_EXPECTED: u16 = 4001;
    /// The token did not match the claimed role, or the role is unknown.
    pub const INVALID_TOKEN: u16 = 4002;
}

// ════════════════════════════════════════════════════════════════════
// Limit clamping
// ════════════════════════════════════════════════════════════════════

/// Smallest accepted `limit` parameter.
pub const MIN_LIMIT: u32 = 1;
/// Largest accepted `limit` parameter.
pub const MAX_LIMIT: u32 = 500;
/// `limit` used when the request does not carry one.
pub const DEFAULT_LIMIT: u32 = 100;

/// Clamp a requested row limit into the safe range.
///
/// Resolvers must apply this before using a caller-supplied `limit`;
/// `None` (absent or non-numeric) yields [`DEFAULT_LIMIT`].
pub fn clamp_limit(requested: Option<i64>) -> u32 {
    match requested {
        None => DEFAULT_LIMIT,
        Some(n) if n < MIN_LIMIT as i64 => MIN_LIMIT,
        Some(n) if n > MAX_LIMIT as i64 => MAX_LIMIT,
        Some(n) => n as u32,
    }
}

// ════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;
    use alloc::vec;

    #[test]
    fn auth_frame_roundtrip() {
        let json = r#"{"type":"auth","role":"producer","token":"s3cret"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Auth { role, token } => {
                assert_eq!(Role::parse(&role), Some(Role::Producer));
                assert_eq!(token, "s3cret");
            }
            _ => panic!("expected Auth variant"),
        }
    }

    #[test]
    fn unknown_role_is_not_a_parse_error() {
        let json = r#"{"type":"auth","role":"superuser","token":"x"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Auth { role, .. } => assert_eq!(Role::parse(&role), None),
            _ => panic!("expected Auth variant"),
        }
    }

    #[test]
    fn get_frame_defaults() {
        let json = r#"{"type":"get","resource":"trades"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Get {
                resource,
                params,
                request_id,
            } => {
                assert_eq!(resource, "trades");
                assert!(params.is_empty());
                assert!(request_id.is_none());
            }
            _ => panic!("expected Get variant"),
        }
    }

    #[test]
    fn producer_response_keeps_extra_fields() {
        let json = r#"{"type":"response","request_id":"r1","status":"ok","data":[1,2],"elapsed_ms":7}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Response { request_id, rest } => {
                assert_eq!(request_id.as_deref(), Some("r1"));
                assert_eq!(rest["elapsed_ms"], 7);
            }
            _ => panic!("expected Response variant"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let json = r#"{"type":"subscribe","topics":["a"]}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn request_frame_roundtrip() {
        let msg = ServerMessage::Request {
            request_id: "r9".to_string(),
            resource: "probabilities".to_string(),
            params: {
                let mut m = Map::new();
                m.insert("limit".to_string(), Value::from(5));
                m
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "request");
        assert_eq!(v["request_id"], "r9");
        assert_eq!(v["params"]["limit"], 5);
    }

    #[test]
    fn error_response_shape() {
        let msg =
            ServerMessage::Response(ResponsePayload::error("r1".to_string(), ErrorKind::Timeout));
        let json = serde_json::to_string(&msg).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "response");
        assert_eq!(v["status"], "error");
        assert_eq!(v["error"], "timeout");
        assert!(v.get("data").is_none());
    }

    #[test]
    fn ok_response_shape() {
        let msg = ServerMessage::Response(ResponsePayload::ok(
            "r2".to_string(),
            Value::Array(vec![Value::from(1)]),
        ));
        let json = serde_json::to_string(&msg).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["status"], "ok");
        assert_eq!(v["data"][0], 1);
        assert!(v.get("error").is_none());
    }

    #[test]
    fn producer_response_frame_construction() {
        let frame =
            ResponsePayload::ok("r7".to_string(), Value::Array(vec![])).into_client_frame();
        let json = serde_json::to_string(&frame).unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "response");
        assert_eq!(v["request_id"], "r7");
        assert_eq!(v["status"], "ok");
        assert!(v["data"].is_array());
    }

    #[test]
    fn close_codes_are_distinct() {
        assert_ne!(close_code::AUTH_FAILED, close_code::AUTH_EXPECTED);
        assert_ne!(close_code::AUTH_EXPECTED, close_code::INVALID_TOKEN);
        assert_ne!(close_code::AUTH_FAILED, close_code::INVALID_TOKEN);
    }

    #[test]
    fn limit_clamping() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), MIN_LIMIT);
        assert_eq!(clamp_limit(Some(-3)), MIN_LIMIT);
        assert_eq!(clamp_limit(Some(5)), 5);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
    }
}

//! Sync protocol message definitions.
//!
//! Every message travels in an [`Envelope`] carrying the protocol name,
//! version, a unique id and a timestamp. The body is one variant of
//! [`Message`], tagged by `type`. Field names are camelCase.

use crate::{
    error::Result, ChangeRecord, Checkpoint, CollectionName, DocumentId, Error, NodeId, Timestamp,
};
use serde::{Deserialize, Serialize};

/// Protocol identifier carried by every envelope.
pub const PROTOCOL_NAME: &str = "usp";

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Error codes shared by both peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    SessionExpired,
    CollectionNotFound,
    Conflict,
    QuotaExceeded,
    RateLimited,
    InvalidMessage,
    InternalError,
    VersionMismatch,
}

impl ErrorCode {
    /// Whether an automatic resend can succeed.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::SessionExpired | ErrorCode::RateLimited | ErrorCode::InternalError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::CollectionNotFound => "COLLECTION_NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::VersionMismatch => "VERSION_MISMATCH",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Features a peer advertises during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    /// Largest push batch the peer accepts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_size: Option<usize>,
    /// Peer understands selective sync filters
    #[serde(default)]
    pub selective_sync: bool,
    /// Peer answers pings
    #[serde(default)]
    pub keepalive: bool,
}

/// Client → server: open a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakePayload {
    pub node_id: NodeId,
    pub collections: Vec<CollectionName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Server → client: session accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeAckPayload {
    pub session_id: String,
    pub server_node_id: NodeId,
    /// Subset of the requested collections the server will serve
    pub accepted_collections: Vec<CollectionName>,
    #[serde(default)]
    pub server_capabilities: Capabilities,
    pub checkpoint: Checkpoint,
}

/// Client → server: an ordered batch of local changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    pub session_id: String,
    pub changes: Vec<ChangeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
}

/// Reference to one accepted change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedChange {
    pub collection: CollectionName,
    pub document_id: DocumentId,
    pub seq: u64,
}

/// A change the server refused, with its own version when it has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedChange {
    pub collection: CollectionName,
    pub document_id: DocumentId,
    pub seq: u64,
    pub code: ErrorCode,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<ChangeRecord>,
}

/// Server → client: per-record verdicts for a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAckPayload {
    pub accepted: Vec<AcceptedChange>,
    pub rejected: Vec<RejectedChange>,
    pub checkpoint: Checkpoint,
}

/// Client → server: request remote changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullPayload {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<Checkpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collections: Option<Vec<CollectionName>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Server → client: one page of changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponsePayload {
    pub changes: Vec<ChangeRecord>,
    pub checkpoint: Checkpoint,
    pub has_more: bool,
}

/// Either side: a typed failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.retryable(),
        }
    }
}

/// Message body, one variant per `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum Message {
    Handshake(HandshakePayload),
    HandshakeAck(HandshakeAckPayload),
    Push(PushPayload),
    PushAck(PushAckPayload),
    Pull(PullPayload),
    PullResponse(PullResponsePayload),
    Error(ErrorPayload),
    Ping,
    Pong,
}

impl Message {
    /// The wire `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeAck(_) => "handshake-ack",
            Message::Push(_) => "push",
            Message::PushAck(_) => "push-ack",
            Message::Pull(_) => "pull",
            Message::PullResponse(_) => "pull-response",
            Message::Error(_) => "error",
            Message::Ping => "ping",
            Message::Pong => "pong",
        }
    }
}

/// Wire envelope around every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub protocol: String,
    pub version: String,
    pub id: String,
    pub timestamp: Timestamp,
    /// Id of the request this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    pub fn new(id: impl Into<String>, timestamp: Timestamp, message: Message) -> Self {
        Self {
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            id: id.into(),
            timestamp,
            reply_to: None,
            message,
        }
    }

    /// Build a response correlated with `request`.
    pub fn reply(
        request: &Envelope,
        id: impl Into<String>,
        timestamp: Timestamp,
        message: Message,
    ) -> Self {
        let mut envelope = Self::new(id, timestamp, message);
        envelope.reply_to = Some(request.id.clone());
        envelope
    }

    /// Check protocol name and major version.
    pub fn validate(&self) -> Result<()> {
        if self.protocol != PROTOCOL_NAME {
            return Err(Error::UnsupportedProtocol(self.protocol.clone()));
        }
        if major(&self.version) != major(PROTOCOL_VERSION) {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                actual: self.version.clone(),
            });
        }
        if self.id.is_empty() {
            return Err(Error::InvalidMessage("empty message id".into()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidMessage(e.to_string()))
    }

    /// Decode and validate a wire message.
    pub fn from_json(json: &str) -> Result<Self> {
        let envelope: Envelope =
            serde_json::from_str(json).map_err(|e| Error::InvalidMessage(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// Map an engine error to the wire code a peer should see.
pub fn error_code_for(error: &Error) -> ErrorCode {
    match error {
        Error::VersionMismatch { .. } => ErrorCode::VersionMismatch,
        Error::UnsupportedProtocol(_) | Error::InvalidMessage(_) | Error::InvalidChange(_) => {
            ErrorCode::InvalidMessage
        }
        Error::DocumentAlreadyExists { .. } => ErrorCode::Conflict,
        _ => ErrorCode::InternalError,
    }
}

//! Core type definitions for the edge data center

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a processing unit inside its rack
pub type PuIndex = usize;

/// Identifier of a keep-alive (ongoing session) check
pub type RequestId = u64;

/// Unique identifier for a rack in the data center
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RackId(String);

impl RackId {
    /// Create a new RackId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the string representation of the RackId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RackId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for RackId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Composite identity of a session: a session id is only unique within its service
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub service_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(service_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_id, self.session_id)
    }
}

/// Requests issued by the session layer towards a rack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionRequest {
    /// Open a session that consumes `cost` units of a PU's capacity
    CreateSession { key: SessionKey, cost: f64 },
    /// Close a session wherever it lives
    RemoveSession { key: SessionKey },
    /// Keep-alive check for an open session
    OngoingSession { key: SessionKey, request_id: RequestId },
}

impl SessionRequest {
    pub fn create(service_id: &str, session_id: &str, cost: f64) -> Self {
        Self::CreateSession {
            key: SessionKey::new(service_id, session_id),
            cost,
        }
    }

    pub fn remove(service_id: &str, session_id: &str) -> Self {
        Self::RemoveSession {
            key: SessionKey::new(service_id, session_id),
        }
    }

    pub fn ongoing(service_id: &str, session_id: &str, request_id: RequestId) -> Self {
        Self::OngoingSession {
            key: SessionKey::new(service_id, session_id),
            request_id,
        }
    }

    /// Session targeted by this request
    pub fn key(&self) -> &SessionKey {
        match self {
            SessionRequest::CreateSession { key, .. }
            | SessionRequest::RemoveSession { key }
            | SessionRequest::OngoingSession { key, .. } => key,
        }
    }
}

/// Responses returned to the session layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionResponse {
    CreateSession { key: SessionKey, accepted: bool },
    RemoveSession { key: SessionKey, accepted: bool },
    OngoingSession { key: SessionKey, request_id: RequestId, accepted: bool },
}

impl SessionResponse {
    /// Session this response refers to
    pub fn key(&self) -> &SessionKey {
        match self {
            SessionResponse::CreateSession { key, .. }
            | SessionResponse::RemoveSession { key, .. }
            | SessionResponse::OngoingSession { key, .. } => key,
        }
    }

    /// Whether the request was served affirmatively
    pub fn accepted(&self) -> bool {
        match self {
            SessionResponse::CreateSession { accepted, .. }
            | SessionResponse::RemoveSession { accepted, .. }
            | SessionResponse::OngoingSession { accepted, .. } => *accepted,
        }
    }
}

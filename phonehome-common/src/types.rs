//! Common types shared by the listener, the registry and test code.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Which callback topic a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackKind {
    /// Plain "the VM booted and reached the network" callback.
    Connectivity,
    /// "The VM's metadata service worked" callback.
    Metadata,
}

impl CallbackKind {
    /// All kinds, in a stable order.
    pub const ALL: [CallbackKind; 2] = [CallbackKind::Connectivity, CallbackKind::Metadata];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::Metadata => "metadata",
        }
    }
}

impl std::fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown callback kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown callback kind '{0}' (expected 'connectivity' or 'metadata')")]
pub struct UnknownKind(pub String);

impl FromStr for CallbackKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "connectivity" => Ok(Self::Connectivity),
            "metadata" => Ok(Self::Metadata),
            other => Err(UnknownKind(other.to_string())),
        }
    }
}

/// Key used to match an inbound callback to the test waiting for it.
///
/// Compared by exact equality. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationToken(String);

impl CorrelationToken {
    /// Build a token, rejecting empty or whitespace-only values.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-request tracing identifier.
///
/// Taken from the `TransactionId` request header when present, otherwise
/// generated server-side. Not used for correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random transaction id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Use the given header value if it is non-blank, otherwise generate one.
    pub fn from_header_or_generate(header: Option<&str>) -> Self {
        match header.map(str::trim) {
            Some(value) if !value.is_empty() => Self::new(value),
            _ => Self::generate(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inbound phone-home request that passed structural validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Callback {
    /// Which topic this callback addresses.
    pub kind: CallbackKind,
    /// Correlation key; `None` when the payload carried no hostname.
    pub token: Option<CorrelationToken>,
    /// Tracing identifier for this request.
    pub transaction_id: TransactionId,
    /// Raw request body (lossy UTF-8). Never empty.
    pub payload: String,
    /// When the listener accepted the request. Informational only.
    pub received_at: DateTime<Utc>,
}

impl Callback {
    pub fn new(
        kind: CallbackKind,
        token: Option<CorrelationToken>,
        transaction_id: TransactionId,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            token,
            transaction_id,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

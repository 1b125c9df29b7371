use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::Error;

/// Opaque token matching a response to the request that caused it.
///
/// Generated ids are the first 16 bytes of a BLAKE3 digest over the request
/// kind, a seed, a per-correlator counter and a random salt, rendered as hex.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn derive(kind: &str, seed: &[u8], counter: u64) -> Self {
        let salt: [u8; 16] = rand::random();
        let mut hasher = blake3::Hasher::new();
        hasher.update(kind.as_bytes());
        hasher.update(&(seed.len() as u64).to_le_bytes());
        hasher.update(seed);
        hasher.update(&counter.to_le_bytes());
        hasher.update(&salt);
        let hex = hasher.finalize().to_hex();
        Self(hex.as_str()[..32].to_string())
    }

    /// Wraps an id chosen by someone else, such as a remote peer.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An outbound request as it crosses a trust boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub correlation_id: CorrelationId,
    /// The action the remote domain should perform, e.g. `SortRequest`.
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
}

impl RequestEnvelope {
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, Error> {
        serde_json::from_str(frame)
            .map_err(|e| Error::MalformedEnvelope(e.to_string()))
    }
}

/// Diagnostic attached to a failed response. `stack` is whatever the remote
/// side captured, e.g. the trace of a rhythm that threw.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// An inbound response.
///
/// - `success && !update` => a complete result replacing anything earlier
/// - `success && update` => a delta to merge into an existing result
/// - `!success` => `error` describes what went wrong remotely
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub correlation_id: CorrelationId,
    pub success: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

impl ResponseEnvelope {
    pub fn success(correlation_id: CorrelationId, data: Value) -> Self {
        Self {
            correlation_id,
            success: true,
            update: false,
            data,
            error: None,
        }
    }

    pub fn update(correlation_id: CorrelationId, data: Value) -> Self {
        Self {
            update: true,
            ..Self::success(correlation_id, data)
        }
    }

    pub fn failure(correlation_id: CorrelationId, error: RemoteError) -> Self {
        Self {
            correlation_id,
            success: false,
            update: false,
            data: Value::Null,
            error: Some(error),
        }
    }

    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, Error> {
        serde_json::from_str(frame)
            .map_err(|e| Error::MalformedEnvelope(e.to_string()))
    }

    /// Turns a reported failure into `Error::Protocol`.
    pub fn into_success(self) -> Result<Self, Error> {
        if self.success {
            return Ok(self);
        }
        Err(match self.error {
            Some(RemoteError { message, stack }) => {
                Error::Protocol { message, stack }
            }
            None => Error::Protocol {
                message: "remote domain reported failure without a diagnostic"
                    .into(),
                stack: None,
            },
        })
    }
}

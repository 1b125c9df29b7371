use std::time::Duration;

use thiserror::Error;

use super::wire::CorrelationId;

#[derive(Error, Debug)]
pub enum Error {
    /// A frame targeted or originated from a domain outside the allow-list.
    #[error("domain rejected: {0}")]
    DomainRejected(String),
    #[error("request {id} timed out after {after:?}")]
    Timeout { id: CorrelationId, after: Duration },
    /// The remote domain answered with an explicit error.
    #[error("remote error: {message}")]
    Protocol {
        message: String,
        stack: Option<String>,
    },
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("correlation id {0} is already pending")]
    DuplicateCorrelationId(CorrelationId),
    #[error("a message dispatcher is already registered")]
    DispatcherTaken,
    #[error("transport closed")]
    TransportClosed,
    #[error("correlator is no longer running")]
    CorrelatorStopped,
    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Error {
    /// True for failures the user may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Timeout { .. } | Error::Protocol { .. })
    }
}

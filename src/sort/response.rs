use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::request::SortType;
use crate::net::{Error, ResponseEnvelope};

/// Page number a batch carries when there is nothing after it.
pub const NO_MORE_PAGES: i64 = -1;

/// A ranked post. The core treats posts as cargo: it reads the id, status and
/// timestamp it needs for merging and "new" marking, and passes the rest
/// through untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Post(Value);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Visibility {
    Public,
    Private,
}

impl Post {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    /// The post's id, whether sent as a string or a number.
    pub fn id(&self) -> Option<String> {
        match self.0.get("post_id")? {
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }
    }

    /// Unix timestamp. Remote domains send this as either a number or a
    /// numeric string.
    pub fn timestamp(&self) -> Option<i64> {
        match self.0.get("timestamp")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Anything not explicitly private is treated as public.
    pub fn visibility(&self) -> Visibility {
        match self.0.get("status").and_then(Value::as_str) {
            Some("private") => Visibility::Private,
            _ => Visibility::Public,
        }
    }
}

#[derive(Deserialize)]
struct SortData {
    #[serde(default)]
    posts: Vec<Post>,
    #[serde(default)]
    page: Option<i64>,
}

/// Ranked posts for one page of one sort type, in display order.
#[derive(Clone, Debug, PartialEq)]
pub struct SortBatch {
    pub sort_type: SortType,
    pub page: i64,
    pub posts: Vec<Post>,
    /// The remote side said there are no further pages.
    pub exhausted: bool,
}

impl SortBatch {
    pub(crate) fn from_data(
        sort_type: SortType,
        page: i64,
        data: Value,
    ) -> Result<Self, Error> {
        let data: SortData = if data.is_null() {
            SortData {
                posts: Vec::new(),
                page: None,
            }
        } else {
            serde_json::from_value(data)
                .map_err(|e| Error::MalformedEnvelope(e.to_string()))?
        };
        Ok(Self {
            sort_type,
            page,
            posts: data.posts,
            exhausted: data.page == Some(NO_MORE_PAGES),
        })
    }
}

/// Why a fetch produced nothing to show.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchFailure {
    Timeout,
    /// The remote side raised an error, e.g. the rhythm threw.
    Protocol {
        message: String,
        stack: Option<String>,
    },
    /// The data store answered with something that isn't a sort result.
    Malformed(String),
    /// The request never left; the target was refused.
    Rejected,
    /// The correlator or transport has shut down.
    Unavailable,
}

impl From<Error> for FetchFailure {
    fn from(error: Error) -> Self {
        match error {
            Error::Timeout { .. } => FetchFailure::Timeout,
            Error::Protocol { message, stack } => {
                FetchFailure::Protocol { message, stack }
            }
            Error::MalformedEnvelope(detail) => FetchFailure::Malformed(detail),
            Error::Encode(e) => FetchFailure::Malformed(e.to_string()),
            Error::DomainRejected(_) => FetchFailure::Rejected,
            Error::DuplicateCorrelationId(_)
            | Error::DispatcherTaken
            | Error::TransportClosed
            | Error::CorrelatorStopped => FetchFailure::Unavailable,
        }
    }
}

/// What a fetch amounted to, once every failure has been dealt with.
#[derive(Clone, Debug, PartialEq)]
pub enum SortOutcome {
    /// A complete list to render.
    Fresh(SortBatch),
    /// A delta to merge into what is already shown.
    Update(SortBatch),
    /// The view moved on while the request was in flight.
    Stale,
    /// Nothing was sent: the page is past the end or never valid.
    Skipped,
    Failed(FetchFailure),
}

impl SortOutcome {
    pub(crate) fn from_envelope(
        sort_type: SortType,
        page: i64,
        envelope: ResponseEnvelope,
    ) -> Self {
        let update = envelope.update;
        match SortBatch::from_data(sort_type, page, envelope.data) {
            Ok(batch) if update => SortOutcome::Update(batch),
            Ok(batch) => SortOutcome::Fresh(batch),
            Err(e) => SortOutcome::Failed(e.into()),
        }
    }
}

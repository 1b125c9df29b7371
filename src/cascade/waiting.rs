use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::{
    net::{Correlator, Domain},
    sort::{Locality, Post, Visibility},
};

/// The action name the domus answers with the user's waiting data.
pub const GET_WAITING_DATA: &str = "GetWaitingData";

/// When the user last viewed one category of posts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingCell {
    #[serde(deserialize_with = "lenient_timestamp")]
    pub timestamp: i64,
}

impl WaitingCell {
    pub fn at(timestamp: i64) -> Self {
        Self { timestamp }
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| D::Error::custom("timestamp out of range")),
        Value::String(s) => s.trim().parse().map_err(D::Error::custom),
        Value::Null => Ok(0),
        other => Err(D::Error::custom(format!("bad timestamp {other}"))),
    }
}

/// Last-viewed timestamps per category, taken before the first page of an
/// inbox session is fetched. Serving that page moves the remote copy
/// forward, so classification must compare against this earlier baseline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingDataSnapshot {
    #[serde(default)]
    pub public_client: WaitingCell,
    #[serde(default)]
    pub private_client: WaitingCell,
    #[serde(default)]
    pub public_global: WaitingCell,
    #[serde(default)]
    pub private_global: WaitingCell,
}

impl WaitingDataSnapshot {
    /// Used when the baseline couldn't be fetched. Nothing counts as new.
    pub fn unavailable() -> Self {
        let never = WaitingCell::at(i64::MAX);
        Self {
            public_client: never,
            private_client: never,
            public_global: never,
            private_global: never,
        }
    }

    pub fn cell(&self, visibility: Visibility, locality: Locality) -> WaitingCell {
        match (visibility, locality) {
            (Visibility::Public, Locality::Local) => self.public_client,
            (Visibility::Private, Locality::Local) => self.private_client,
            (Visibility::Public, Locality::Global) => self.public_global,
            (Visibility::Private, Locality::Global) => self.private_global,
        }
    }

    /// True if the post arrived after the user last viewed its category.
    /// Posts without a readable timestamp are never new.
    pub fn is_new(&self, post: &Post, locality: Locality) -> bool {
        match post.timestamp() {
            Some(ts) => ts > self.cell(post.visibility(), locality).timestamp,
            None => false,
        }
    }
}

/// Holds the session's baseline behind a one-shot latch: the first snapshot
/// resolves it and every later one is ignored. Readers wait until then.
pub struct WaitingData {
    armed: AtomicBool,
    latch: watch::Sender<Option<WaitingDataSnapshot>>,
}

impl Default for WaitingData {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitingData {
    pub fn new() -> Self {
        let (latch, _) = watch::channel(None);
        Self {
            armed: AtomicBool::new(false),
            latch,
        }
    }

    /// Resolves the latch. Returns false if it was already resolved.
    pub fn resolve(&self, snapshot: WaitingDataSnapshot) -> bool {
        self.latch.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(snapshot);
            true
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.latch.borrow().is_some()
    }

    /// Waits for the baseline.
    pub async fn baseline(&self) -> WaitingDataSnapshot {
        let mut rx = self.latch.subscribe();
        let result = rx.wait_for(Option::is_some).await.map(|slot| *slot);
        match result {
            Ok(Some(snapshot)) => snapshot,
            _ => WaitingDataSnapshot::unavailable(),
        }
    }

    /// Asks the data store for the current waiting data, once per session.
    /// The request is queued before anything else the caller sends next, so
    /// the domus reads it before a following page-1 sort updates it. Later
    /// calls do nothing.
    pub async fn capture(&self, correlator: &Correlator, data_store: &Domain) {
        if self.armed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pending = match correlator
            .submit(data_store, GET_WAITING_DATA, json!({}))
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "could not request waiting data, nothing will be marked new");
                self.resolve(WaitingDataSnapshot::unavailable());
                return;
            }
        };
        debug!(id = %pending.id(), "waiting data requested");

        let latch = self.latch.clone();
        tokio::spawn(async move {
            let snapshot = match pending.await {
                Ok(envelope) => serde_json::from_value(envelope.data)
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "waiting data was malformed, nothing will be marked new");
                        WaitingDataSnapshot::unavailable()
                    }),
                Err(e) => {
                    warn!(error = %e, "waiting data unavailable, nothing will be marked new");
                    WaitingDataSnapshot::unavailable()
                }
            };
            latch.send_if_modified(|slot| {
                if slot.is_some() {
                    return false;
                }
                *slot = Some(snapshot);
                true
            });
        });
    }
}

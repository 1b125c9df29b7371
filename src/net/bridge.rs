use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::{
    domain::{Domain, DomainAllowList},
    error::Error,
    wire::{RequestEnvelope, ResponseEnvelope},
};

/// The raw channel between trust domains, e.g. a `postMessage` pipe into a
/// sandboxed frame. Transports move opaque text and nothing else; envelope
/// shape and domain checks belong to the [`Bridge`].
pub trait Transport: Send + Sync + 'static {
    /// Hands a frame to the channel for `target`. Must not block.
    fn post(&self, target: &Domain, body: String) -> Result<(), Error>;
}

/// A frame as it arrives from the transport. The origin is whatever the
/// channel claims and hasn't been validated yet.
#[derive(Clone, Debug)]
pub struct InboundFrame {
    pub origin: String,
    pub body: String,
}

/// A validated inbound response.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub origin: Domain,
    pub envelope: ResponseEnvelope,
}

/// Sends and receives envelopes across trust boundaries.
///
/// The bridge has no retry logic; retries are the caller's concern.
pub struct Bridge {
    allow: DomainAllowList,
    transport: Arc<dyn Transport>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<InboundFrame>>>,
}

impl Bridge {
    pub fn new(
        allow: DomainAllowList,
        transport: impl Transport,
        inbound: mpsc::UnboundedReceiver<InboundFrame>,
    ) -> Self {
        Self {
            allow,
            transport: Arc::new(transport),
            inbound: Mutex::new(Some(inbound)),
        }
    }

    pub fn allow_list(&self) -> &DomainAllowList {
        &self.allow
    }

    /// Sends an envelope to `target`, refusing domains outside the
    /// allow-list.
    pub fn send(
        &self,
        target: &Domain,
        envelope: &RequestEnvelope,
    ) -> Result<(), Error> {
        if !self.allow.allows(target) {
            warn!(domain = %target, "refusing to send to a domain outside the allow-list");
            return Err(Error::DomainRejected(target.to_string()));
        }
        let body = envelope.encode()?;
        trace!(
            domain = %target,
            id = %envelope.correlation_id,
            kind = %envelope.kind,
            "posting frame"
        );
        self.transport.post(target, body)
    }

    /// Registers the process-wide dispatcher. Only one may exist; a second
    /// call fails with [`Error::DispatcherTaken`].
    pub fn on_message(&self) -> Result<Inbox, Error> {
        let rx = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::DispatcherTaken)?;
        Ok(Inbox {
            allow: self.allow.clone(),
            rx,
        })
    }
}

/// The receiving half handed to the single dispatcher.
pub struct Inbox {
    allow: DomainAllowList,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

impl Inbox {
    /// Waits for the next well-formed response from an allowed domain.
    /// Frames from foreign origins or with an unrecognised shape are logged
    /// and dropped. Returns `None` once the transport has closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let frame = self.rx.recv().await?;
            if let Some(delivery) = self.validate(frame) {
                return Some(delivery);
            }
        }
    }

    fn validate(&self, frame: InboundFrame) -> Option<Delivery> {
        let origin = match self.allow.resolve(&frame.origin) {
            Ok(origin) => origin,
            Err(_) => {
                warn!(
                    origin = %frame.origin,
                    "dropping frame from a domain outside the allow-list"
                );
                return None;
            }
        };
        match ResponseEnvelope::decode(&frame.body) {
            Ok(envelope) => Some(Delivery { origin, envelope }),
            Err(e) => {
                warn!(%origin, error = %e, "dropping frame with an unrecognised envelope");
                None
            }
        }
    }
}

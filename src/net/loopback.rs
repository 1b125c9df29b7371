//! An in-process transport. The [`RemoteEnd`] plays every remote trust
//! domain: it sees what the client posts and can answer, or inject arbitrary
//! frames to exercise the bridge's defences.

use tokio::sync::mpsc;
use tracing::warn;

use super::{
    bridge::{Bridge, InboundFrame, Transport},
    domain::{Domain, DomainAllowList},
    error::Error,
    wire::{RequestEnvelope, ResponseEnvelope},
};

/// A frame posted by the client, addressed to `target`.
#[derive(Clone, Debug)]
pub struct OutboundFrame {
    pub target: Domain,
    pub body: String,
}

pub struct LoopbackTransport {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
}

impl Transport for LoopbackTransport {
    fn post(&self, target: &Domain, body: String) -> Result<(), Error> {
        self.outbound
            .send(OutboundFrame {
                target: target.clone(),
                body,
            })
            .map_err(|_| Error::TransportClosed)
    }
}

pub struct RemoteEnd {
    allow: DomainAllowList,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
}

impl RemoteEnd {
    /// The next request the client posted, decoded. Frames that don't decode
    /// are skipped.
    pub async fn next_request(&mut self) -> Option<(Domain, RequestEnvelope)> {
        loop {
            let frame = self.outbound.recv().await?;
            match RequestEnvelope::decode(&frame.body) {
                Ok(env) => return Some((frame.target, env)),
                Err(e) => {
                    warn!(
                        domain = %frame.target,
                        error = %e,
                        "remote end skipped an undecodable request"
                    );
                }
            }
        }
    }

    /// Answers as `origin`, presenting the origin string the client's
    /// allow-list expects.
    pub fn reply(
        &self,
        origin: &Domain,
        envelope: &ResponseEnvelope,
    ) -> Result<(), Error> {
        self.inbound
            .send(InboundFrame {
                origin: self.allow.origin_of(origin),
                body: envelope.encode()?,
            })
            .map_err(|_| Error::TransportClosed)
    }

    /// Injects a frame verbatim, with any claimed origin.
    pub fn post_raw(&self, origin: &str, body: &str) {
        let frame = InboundFrame {
            origin: origin.to_string(),
            body: body.to_string(),
        };
        if self.inbound.send(frame).is_err() {
            warn!("client side of the loopback has gone away");
        }
    }
}

/// Builds a bridge wired to an in-process remote end.
pub fn loopback(allow: DomainAllowList) -> (Bridge, RemoteEnd) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let bridge = Bridge::new(allow, LoopbackTransport { outbound: out_tx }, in_rx);
    let remote = RemoteEnd {
        allow: bridge.allow_list().clone(),
        outbound: out_rx,
        inbound: in_tx,
    };
    (bridge, remote)
}

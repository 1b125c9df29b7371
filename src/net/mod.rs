// Every piece of a Babbling Brook page that touches user data or third-party
// code runs in its own trust domain. The client can't call into the domus or
// a rhythm directly; it can only post a message across the boundary and wait
// for one to come back. This module is that boundary.

// The bridge owns the raw channel and decides what may cross it: only the
// protocol's own subdomains, and only well-formed envelopes. The correlator
// sits on top and turns the fire-and-forget channel into request/response
// pairs. It exclusively controls the table of in-flight requests from a
// single task, so a response and a timeout for the same request can never
// both be delivered, and nothing needs a lock.

// Nothing here knows what a post or a rhythm is. Payloads are opaque JSON;
// the sort protocol gives them meaning.

pub mod bridge;
pub mod correlator;
pub mod domain;
pub mod error;
pub mod loopback;
pub mod wire;

pub use bridge::{Bridge, Delivery, Inbox, InboundFrame, Transport};
pub use correlator::{Correlator, PendingReply, TimeoutBudget};
pub use domain::{Domain, DomainAllowList, DomainKind};
pub use error::Error;
pub use wire::{CorrelationId, RemoteError, RequestEnvelope, ResponseEnvelope};

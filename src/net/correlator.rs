use std::{
    cmp::Reverse,
    collections::BinaryHeap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use serde_json::Value;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use super::{
    bridge::{Bridge, Delivery, Inbox},
    domain::Domain,
    error::Error,
    wire::{CorrelationId, RequestEnvelope, ResponseEnvelope},
};

/// How long settled ids are remembered so late responses can be told apart
/// from unknown ones.
const SETTLED_TTL: Duration = Duration::from_secs(300);

/// How long a request may wait for its response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeoutBudget {
    /// The base timeout for any cross-domain action.
    pub action_timeout: Duration,
    /// Added when the request's final leg lands in the data store, which
    /// costs one more domain hop.
    pub data_store_grace: Duration,
}

impl TimeoutBudget {
    pub fn for_target(&self, target: &Domain) -> Duration {
        if target.is_data_store() {
            self.action_timeout + self.data_store_grace
        } else {
            self.action_timeout
        }
    }
}

impl Default for TimeoutBudget {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_millis(30_000),
            data_store_grace: Duration::from_millis(5_000),
        }
    }
}

type Outcome = Result<ResponseEnvelope, Error>;

enum Command {
    Submit {
        target: Domain,
        envelope: RequestEnvelope,
        timeout: Duration,
        reply: oneshot::Sender<Outcome>,
        accepted: oneshot::Sender<Result<(), Error>>,
    },
    Resolve(ResponseEnvelope),
    PendingCount(oneshot::Sender<usize>),
}

/// Handle to the correlator task. Cheap to clone.
///
/// All bookkeeping lives inside a single task that handles submissions,
/// inbound responses and deadlines one at a time, so for any correlation id
/// exactly one of "matched" or "timed out" ever happens.
#[derive(Clone)]
pub struct Correlator {
    commands: mpsc::UnboundedSender<Command>,
    counter: Arc<AtomicU64>,
    budget: TimeoutBudget,
}

impl Correlator {
    /// Takes the bridge's dispatcher and starts the correlator task.
    pub fn spawn(
        bridge: Arc<Bridge>,
        budget: TimeoutBudget,
    ) -> Result<(Self, JoinHandle<()>), Error> {
        let inbox = bridge.on_message()?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            bridge,
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            settled: ExpiringSet::new(),
            seq: 0,
        };
        let task = tokio::spawn(
            dispatcher
                .run(commands_rx, inbox)
                .instrument(debug_span!("correlator")),
        );
        let correlator = Self {
            commands,
            counter: Arc::new(AtomicU64::new(0)),
            budget,
        };
        Ok((correlator, task))
    }

    pub fn budget(&self) -> TimeoutBudget {
        self.budget
    }

    /// A fresh correlation id. `seed` disambiguates ids across request
    /// shapes; uniqueness comes from the counter and salt.
    pub fn next_id(&self, kind: &str, seed: &[u8]) -> CorrelationId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        CorrelationId::derive(kind, seed, counter)
    }

    /// Submits with the target's default timeout budget.
    pub async fn submit(
        &self,
        target: &Domain,
        kind: &str,
        payload: Value,
    ) -> Result<PendingReply, Error> {
        let timeout = self.budget.for_target(target);
        self.submit_with_timeout(target, kind, payload, timeout).await
    }

    pub async fn submit_with_timeout(
        &self,
        target: &Domain,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingReply, Error> {
        let seed = serde_json::to_vec(&payload)?;
        let id = self.next_id(kind, &seed);
        self.submit_as(id, target, kind, payload, timeout).await
    }

    /// Submits under a caller-chosen id. Fails with
    /// [`Error::DuplicateCorrelationId`] if that id is still pending, and
    /// with the bridge's error if the frame couldn't be posted; in both cases
    /// nothing is recorded.
    pub async fn submit_as(
        &self,
        id: CorrelationId,
        target: &Domain,
        kind: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<PendingReply, Error> {
        let (reply, reply_rx) = oneshot::channel();
        let (accepted, accepted_rx) = oneshot::channel();
        let envelope = RequestEnvelope {
            correlation_id: id.clone(),
            kind: kind.to_string(),
            payload,
        };
        self.commands
            .send(Command::Submit {
                target: target.clone(),
                envelope,
                timeout,
                reply,
                accepted,
            })
            .map_err(|_| Error::CorrelatorStopped)?;
        accepted_rx.await.map_err(|_| Error::CorrelatorStopped)??;
        Ok(PendingReply { id, rx: reply_rx })
    }

    /// Matches a response that arrived through some other path than the
    /// bridge. Unknown or already settled ids are ignored.
    pub fn resolve(&self, response: ResponseEnvelope) {
        if self.commands.send(Command::Resolve(response)).is_err() {
            debug!("correlator stopped, dropping response");
        }
    }

    /// Number of requests still waiting for a response.
    pub async fn pending(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Resolves to the response for one submitted request, or to the reason it
/// never came. Resolves exactly once.
///
/// Remote failures (`success == false`) surface as [`Error::Protocol`].
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingReply {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                Poll::Ready(outcome.and_then(ResponseEnvelope::into_success))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::CorrelatorStopped)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct PendingRequest {
    target: Domain,
    created_at: DateTime<Utc>,
    timeout: Duration,
    /// Distinguishes this entry's deadline from stale heap entries left by
    /// an earlier request that reused the id.
    seq: u64,
    reply: oneshot::Sender<Outcome>,
}

struct Dispatcher {
    bridge: Arc<Bridge>,
    pending: HashMap<CorrelationId, PendingRequest>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, CorrelationId)>>,
    settled: ExpiringSet,
    seq: u64,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inbox: Inbox,
    ) {
        debug!("correlator started");
        let mut inbox_open = true;
        loop {
            self.settled.remove_expired();
            let next_deadline = self.deadlines.peek().map(|Reverse((at, ..))| *at);
            // the far-future fallback is never polled, the branch is disabled
            let wake = next_deadline
                .unwrap_or_else(|| Instant::now() + SETTLED_TTL);

            select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                delivery = inbox.recv(), if inbox_open => match delivery {
                    Some(Delivery { origin, envelope }) => self.resolve(envelope, Some(origin)),
                    None => {
                        debug!("transport closed, no further responses will arrive");
                        inbox_open = false;
                    }
                },
                _ = sleep_until(wake), if next_deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
        }
        debug!(abandoned = self.pending.len(), "correlator stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Submit {
                target,
                envelope,
                timeout,
                reply,
                accepted,
            } => {
                let _ = accepted.send(self.submit(target, envelope, timeout, reply));
            }
            Command::Resolve(envelope) => self.resolve(envelope, None),
            Command::PendingCount(tx) => {
                let _ = tx.send(self.pending.len());
            }
        }
    }

    fn submit(
        &mut self,
        target: Domain,
        envelope: RequestEnvelope,
        timeout: Duration,
        reply: oneshot::Sender<Outcome>,
    ) -> Result<(), Error> {
        let id = envelope.correlation_id.clone();
        if self.pending.contains_key(&id) {
            warn!(%id, "rejecting a correlation id that is already pending");
            return Err(Error::DuplicateCorrelationId(id));
        }
        self.bridge.send(&target, &envelope)?;

        self.seq += 1;
        let deadline = Instant::now() + timeout;
        self.deadlines.push(Reverse((deadline, self.seq, id.clone())));
        debug!(%id, domain = %target, kind = %envelope.kind, ?timeout, "request submitted");
        self.pending.insert(
            id,
            PendingRequest {
                target,
                created_at: Utc::now(),
                timeout,
                seq: self.seq,
                reply,
            },
        );
        Ok(())
    }

    fn resolve(&mut self, envelope: ResponseEnvelope, origin: Option<Domain>) {
        let id = envelope.correlation_id.clone();
        let Some(request) = self.pending.get(&id) else {
            if self.settled.contains(&id) {
                debug!(%id, "dropping a late response for a settled request");
            } else {
                warn!(%id, "dropping a response for an unknown request");
            }
            return;
        };
        if let Some(origin) = origin {
            if origin != request.target {
                warn!(%id, %origin, expected = %request.target,
                    "dropping a response from a domain the request wasn't sent to");
                return;
            }
        }

        let Some(request) = self.pending.remove(&id) else {
            return;
        };
        let waited = Utc::now() - request.created_at;
        trace!(
            %id,
            waited_ms = waited.num_milliseconds(),
            update = envelope.update,
            "response matched"
        );
        self.settled.insert(id.clone(), SETTLED_TTL);
        if request.reply.send(Ok(envelope)).is_err() {
            debug!(%id, "requester went away before its response arrived");
        }
    }

    fn expire(&mut self, now: Instant) {
        while let Some(Reverse((at, seq, _))) = self.deadlines.peek() {
            if *at > now {
                break;
            }
            let seq = *seq;
            let Some(Reverse((_, _, id))) = self.deadlines.pop() else {
                break;
            };
            // resolved requests leave their deadline behind
            if self.pending.get(&id).map_or(true, |r| r.seq != seq) {
                continue;
            }
            let Some(request) = self.pending.remove(&id) else {
                continue;
            };
            warn!(%id, domain = %request.target, timeout = ?request.timeout, "request timed out");
            self.settled.insert(id.clone(), SETTLED_TTL);
            let _ = request.reply.send(Err(Error::Timeout {
                id,
                after: request.timeout,
            }));
        }
    }
}

/// Correlation ids remembered until their latest expiry.
struct ExpiringSet {
    expiries: HashMap<CorrelationId, Instant>,
    queue: BinaryHeap<Reverse<(Instant, CorrelationId)>>,
}

impl ExpiringSet {
    fn new() -> Self {
        Self {
            expiries: HashMap::new(),
            queue: BinaryHeap::new(),
        }
    }

    /// Inserting an id again pushes its expiry out.
    fn insert(&mut self, value: CorrelationId, ttl: Duration) {
        let expiry = Instant::now() + ttl;
        self.expiries.insert(value.clone(), expiry);
        self.queue.push(Reverse((expiry, value)));
    }

    fn contains(&self, value: &CorrelationId) -> bool {
        self.expiries.contains_key(value)
    }

    fn remove_expired(&mut self) {
        let now = Instant::now();
        while self
            .queue
            .peek()
            .map_or(false, |Reverse((expiry, _))| *expiry <= now)
        {
            let Some(Reverse((expiry, value))) = self.queue.pop() else {
                break;
            };
            // older queue entries for a re-inserted id are skipped
            if self.expiries.get(&value) == Some(&expiry) {
                self.expiries.remove(&value);
            }
        }
    }
}

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    request::{SortRequest, SortType},
    response::{FetchFailure, SortOutcome},
};
use crate::{
    messages::{Messages, UserMessage},
    net::{Correlator, Domain, Error, ResponseEnvelope},
};

/// Shown whenever a page of posts can't be fetched.
pub const RETRIEVAL_FAILED: &str = "Unable to retrieve some of your posts.";

/// What a cascade is currently showing. The generation moves on every time
/// the view is reset, even to the same sort type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewKey {
    pub sort_type: SortType,
    pub generation: u64,
}

/// Asks the user's data store to run a rhythm over a set of posts and
/// interprets what comes back.
///
/// This is where failures stop: a fetch never returns an error. Timeouts and
/// remote errors become a message for the user plus [`SortOutcome::Failed`];
/// responses for a view that has moved on become [`SortOutcome::Stale`].
pub struct SortProtocol {
    correlator: Correlator,
    data_store: Domain,
    messages: Arc<dyn Messages>,
}

impl SortProtocol {
    pub fn new(
        correlator: Correlator,
        data_store: Domain,
        messages: Arc<dyn Messages>,
    ) -> Self {
        Self {
            correlator,
            data_store,
            messages,
        }
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn data_store(&self) -> &Domain {
        &self.data_store
    }

    /// Fetches one page for the view generation `generation`. If `view` has
    /// moved to another sort type or generation by the time the response
    /// arrives, the response is discarded without telling the user.
    pub async fn fetch(
        &self,
        request: SortRequest,
        generation: u64,
        view: &watch::Receiver<ViewKey>,
    ) -> SortOutcome {
        if request.page < 1 {
            debug!(
                sort_type = %request.sort_type,
                page = request.page,
                "page is exhausted, not fetching"
            );
            return SortOutcome::Skipped;
        }

        let key = ViewKey {
            sort_type: request.sort_type,
            generation,
        };
        let span = debug_span!(
            "sort",
            sort_type = %request.sort_type,
            page = request.page,
            generation
        );
        async move {
            let result = self.exchange(&request).await;

            if *view.borrow() != key {
                debug!("view changed while the sort was in flight, discarding");
                return SortOutcome::Stale;
            }

            match result {
                Ok(envelope) => {
                    let outcome = SortOutcome::from_envelope(
                        request.sort_type,
                        request.page,
                        envelope,
                    );
                    if let SortOutcome::Failed(failure) = outcome {
                        return self.report(failure);
                    }
                    outcome
                }
                Err(e) => {
                    debug!(error = %e, retryable = e.is_retryable(), "exchange failed");
                    self.report(e.into())
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn exchange(
        &self,
        request: &SortRequest,
    ) -> Result<ResponseEnvelope, Error> {
        let id = self.correlator.next_id(
            SortRequest::KIND,
            request.sort_type.as_str().as_bytes(),
        );
        let payload = request.payload(&id)?;
        let timeout = self.correlator.budget().for_target(&self.data_store);
        let pending = self
            .correlator
            .submit_as(id, &self.data_store, SortRequest::KIND, payload, timeout)
            .await?;
        debug!(id = %pending.id(), "sort request sent");
        pending.await
    }

    fn report(&self, failure: FetchFailure) -> SortOutcome {
        match &failure {
            // a refused domain is a configuration problem, not the user's
            FetchFailure::Rejected => {
                warn!("sort request refused by the bridge");
            }
            FetchFailure::Protocol { message, stack } => {
                warn!(%message, "sort failed remotely");
                self.messages.add_message(UserMessage::error(RETRIEVAL_FAILED));
                if let Some(stack) = stack {
                    self.messages
                        .add_message(UserMessage::debug(format!("{message}\n{stack}")));
                }
            }
            other => {
                warn!(failure = ?other, "sort failed");
                self.messages.add_message(UserMessage::error(RETRIEVAL_FAILED));
            }
        }
        SortOutcome::Failed(failure)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        messages::{MessageKind, MessageLog},
        net::{
            loopback::{loopback, RemoteEnd},
            DomainAllowList, DomainKind, RemoteError, TimeoutBudget,
        },
        sort::request::{FilterDescriptor, UserIdentity},
    };

    const HOST: &str = "example.com";

    fn domus() -> Domain {
        Domain::new(DomainKind::Domus, HOST)
    }

    fn setup(budget: TimeoutBudget) -> (SortProtocol, RemoteEnd, Arc<MessageLog>) {
        let (bridge, remote) = loopback(DomainAllowList::for_host(HOST));
        let (correlator, _task) = Correlator::spawn(Arc::new(bridge), budget).unwrap();
        let log = Arc::new(MessageLog::default());
        let protocol = SortProtocol::new(correlator, domus(), log.clone());
        (protocol, remote, log)
    }

    fn view(sort_type: SortType) -> (watch::Sender<ViewKey>, watch::Receiver<ViewKey>) {
        watch::channel(ViewKey {
            sort_type,
            generation: 1,
        })
    }

    fn request(sort_type: SortType, page: i64) -> SortRequest {
        SortRequest::builder()
            .sort_type(sort_type)
            .filter(FilterDescriptor {
                url: "https://filter.example.com/rhythm/newest".into(),
                name: "newest".into(),
                priority: 10,
            })
            .page(page)
            .user(UserIdentity {
                username: "ada".into(),
                domain: HOST.into(),
            })
            .build()
    }

    #[tokio::test]
    async fn fresh_and_update_responses() {
        let (protocol, mut remote, _log) = setup(TimeoutBudget::default());
        let (_tx, view) = view(SortType::GlobalAll);

        let serve = async {
            let (target, req) = remote.next_request().await.unwrap();
            assert_eq!(target, domus());
            assert_eq!(req.kind, SortRequest::KIND);
            assert_eq!(req.payload["client_uid"], json!(req.correlation_id.as_str()));
            assert_eq!(req.payload["private_page"], json!(1));
            remote
                .reply(&domus(), &ResponseEnvelope::update(
                    req.correlation_id,
                    json!({"posts": [{"post_id": 1}, {"post_id": 2}]}),
                ))
                .unwrap();
        };
        let fetch = protocol.fetch(request(SortType::GlobalAll, 1), 1, &view);
        let (outcome, ()) = tokio::join!(fetch, serve);
        match outcome {
            SortOutcome::Update(batch) => {
                assert_eq!(batch.posts.len(), 2);
                assert_eq!(batch.page, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn page_below_one_is_never_sent() {
        let (protocol, _remote, _log) = setup(TimeoutBudget::default());
        let (_tx, view) = view(SortType::GlobalAll);
        assert_eq!(
            protocol.fetch(request(SortType::GlobalAll, 0), 1, &view).await,
            SortOutcome::Skipped
        );
        assert_eq!(
            protocol.fetch(request(SortType::GlobalAll, -1), 1, &view).await,
            SortOutcome::Skipped
        );
        assert_eq!(protocol.correlator().pending().await, 0);
    }

    #[tokio::test]
    async fn switching_views_discards_the_response_silently() {
        let (protocol, mut remote, log) = setup(TimeoutBudget::default());
        let (tx, view) = view(SortType::LocalPrivate);

        let serve = async {
            let (_, req) = remote.next_request().await.unwrap();
            tx.send_replace(ViewKey {
                sort_type: SortType::GlobalPublic,
                generation: 2,
            });
            remote
                .reply(
                    &domus(),
                    &ResponseEnvelope::failure(req.correlation_id, RemoteError {
                        message: "boom".into(),
                        stack: None,
                    }),
                )
                .unwrap();
        };
        let fetch = protocol.fetch(request(SortType::LocalPrivate, 1), 1, &view);
        let (outcome, ()) = tokio::join!(fetch, serve);
        assert_eq!(outcome, SortOutcome::Stale);
        assert!(log.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_becomes_a_user_message() {
        let budget = TimeoutBudget {
            action_timeout: Duration::from_millis(1000),
            data_store_grace: Duration::from_millis(5000),
        };
        let (protocol, mut remote, log) = setup(budget);
        let (_tx, view) = view(SortType::GlobalAll);

        let started = tokio::time::Instant::now();
        let (outcome, _) = tokio::join!(
            protocol.fetch(request(SortType::GlobalAll, 1), 1, &view),
            remote.next_request()
        );
        assert_eq!(outcome, SortOutcome::Failed(FetchFailure::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(6000));
        assert_eq!(log.messages(), vec![UserMessage::error(RETRIEVAL_FAILED)]);
    }

    #[tokio::test]
    async fn remote_stack_is_kept_for_debugging() {
        let (protocol, mut remote, log) = setup(TimeoutBudget::default());
        let (_tx, view) = view(SortType::Stream);

        let serve = async {
            let (_, req) = remote.next_request().await.unwrap();
            remote
                .reply(
                    &domus(),
                    &ResponseEnvelope::failure(req.correlation_id, RemoteError {
                        message: "rhythm threw".into(),
                        stack: Some("at rank (rhythm.js:12)".into()),
                    }),
                )
                .unwrap();
        };
        let fetch = protocol.fetch(request(SortType::Stream, 1), 1, &view);
        let (outcome, ()) = tokio::join!(fetch, serve);
        assert!(matches!(outcome, SortOutcome::Failed(FetchFailure::Protocol { .. })));

        let messages = log.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], UserMessage::error(RETRIEVAL_FAILED));
        assert_eq!(messages[1].kind, MessageKind::Debug);
        assert!(messages[1].message.contains("rhythm.js:12"));
    }

    #[tokio::test]
    async fn a_reset_to_the_same_type_discards_the_old_failure() {
        let (protocol, mut remote, log) = setup(TimeoutBudget::default());
        let (tx, view) = view(SortType::GlobalAll);

        let serve = async {
            let (_, req) = remote.next_request().await.unwrap();
            tx.send_replace(ViewKey {
                sort_type: SortType::GlobalAll,
                generation: 2,
            });
            remote
                .reply(
                    &domus(),
                    &ResponseEnvelope::failure(req.correlation_id, RemoteError {
                        message: "boom".into(),
                        stack: None,
                    }),
                )
                .unwrap();
        };
        let fetch = protocol.fetch(request(SortType::GlobalAll, 1), 1, &view);
        let (outcome, ()) = tokio::join!(fetch, serve);
        assert_eq!(outcome, SortOutcome::Stale);
        assert!(log.messages().is_empty());
    }

    #[tokio::test]
    async fn refused_data_store_is_not_the_users_problem() {
        let (bridge, _remote) = loopback(DomainAllowList::for_host(HOST));
        let (correlator, _task) =
            Correlator::spawn(Arc::new(bridge), TimeoutBudget::default()).unwrap();
        let log = Arc::new(MessageLog::default());
        let foreign = Domain::new(DomainKind::Domus, "misconfigured.org");
        let protocol = SortProtocol::new(correlator, foreign, log.clone());
        let (_tx, view) = view(SortType::GlobalAll);

        let outcome = protocol.fetch(request(SortType::GlobalAll, 1), 1, &view).await;
        assert_eq!(outcome, SortOutcome::Failed(FetchFailure::Rejected));
        assert!(log.messages().is_empty());
    }
}

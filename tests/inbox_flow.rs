use std::{sync::Arc, time::Duration};

use cobalt_cascade::{
    cascade::{
        Cascade, CascadeHandle, CascadeOptions, Phase, PostRenderer,
        RenderedPost, ViewSnapshot, GET_WAITING_DATA,
    },
    config::Config,
    messages::{MessageKind, MessageLog},
    net::{
        loopback::{loopback, RemoteEnd},
        Correlator, Domain, DomainKind, RemoteError, RequestEnvelope, ResponseEnvelope,
    },
    sort::{SortProtocol, SortRequest, SortType, UserIdentity, RETRIEVAL_FAILED},
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

#[derive(Debug, PartialEq)]
enum Event {
    Clear,
    Insert { at: usize, ids: Vec<String>, new: Vec<bool> },
    Retry,
    Exhausted,
}

struct ChannelRenderer(mpsc::UnboundedSender<Event>);

impl PostRenderer for ChannelRenderer {
    fn clear(&mut self) {
        self.0.send(Event::Clear).unwrap();
    }

    fn insert(&mut self, at: usize, posts: &[RenderedPost]) {
        self.0
            .send(Event::Insert {
                at,
                ids: posts.iter().filter_map(|p| p.post.id()).collect(),
                new: posts.iter().map(|p| p.is_new).collect(),
            })
            .unwrap();
    }

    fn show_retry(&mut self) {
        self.0.send(Event::Retry).unwrap();
    }

    fn exhausted(&mut self) {
        self.0.send(Event::Exhausted).unwrap();
    }
}

struct Harness {
    config: Config,
    handle: CascadeHandle,
    remote: RemoteEnd,
    events: mpsc::UnboundedReceiver<Event>,
    log: Arc<MessageLog>,
}

impl Harness {
    fn start(sort_type: SortType, config: Config) -> Self {
        let data_store = config.data_store();
        Self::start_with(sort_type, config, data_store)
    }

    /// Like `start`, but sorts on `data_store` whether or not the config
    /// allows it.
    fn start_with(sort_type: SortType, config: Config, data_store: Domain) -> Self {
        let (bridge, remote) = loopback(config.allow_list());
        let (correlator, _) =
            Correlator::spawn(Arc::new(bridge), config.timeout_budget()).unwrap();
        let log = Arc::new(MessageLog::default());
        let protocol = SortProtocol::new(correlator, data_store, log.clone());
        let options = CascadeOptions::builder()
            .filter(config.default_filter.clone())
            .user(config.user.clone().unwrap())
            .sort_type(sort_type)
            .build();
        let (tx, events) = mpsc::unbounded_channel();
        let (handle, _) = Cascade::spawn(Arc::new(protocol), options, ChannelRenderer(tx));
        Self {
            config,
            handle,
            remote,
            events,
            log,
        }
    }

    async fn request(&mut self) -> RequestEnvelope {
        let (target, request) = self.remote.next_request().await.unwrap();
        assert_eq!(target, self.config.data_store());
        request
    }

    async fn sort_request(&mut self, sort_type: SortType, page: i64) -> RequestEnvelope {
        let request = self.request().await;
        assert_eq!(request.kind, SortRequest::KIND);
        assert_eq!(request.payload["type"], json!(sort_type.as_str()));
        assert_eq!(request.payload["private_page"], json!(page));
        request
    }

    fn answer(&self, request: &RequestEnvelope, data: Value) {
        self.remote
            .reply(
                &self.config.data_store(),
                &ResponseEnvelope::success(request.correlation_id.clone(), data),
            )
            .unwrap();
    }

    fn push_update(&self, request: &RequestEnvelope, data: Value) {
        self.remote
            .reply(
                &self.config.data_store(),
                &ResponseEnvelope::update(request.correlation_id.clone(), data),
            )
            .unwrap();
    }

    /// Answers the session's waiting-data capture.
    async fn capture(&mut self, public_client: i64) {
        let request = self.request().await;
        assert_eq!(request.kind, GET_WAITING_DATA);
        self.answer(
            &request,
            json!({
                "public_client": {"timestamp": public_client.to_string()},
                "private_client": {"timestamp": "0"},
                "public_global": {"timestamp": "0"},
                "private_global": {"timestamp": "0"}
            }),
        );
    }

    async fn event(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(30), self.events.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Asserts nothing reaches the remote side for a while.
    async fn assert_quiet(&mut self) {
        let wait = Duration::from_millis(100);
        let next = tokio::time::timeout(wait, self.remote.next_request()).await;
        assert!(next.is_err(), "unexpected request {next:?}");
    }

    async fn wait_for_phase(&self, phase: Phase) -> ViewSnapshot {
        tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                let view = self.handle.view().await.unwrap();
                if view.phase == phase {
                    return view;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap()
    }
}

fn config() -> Config {
    Config {
        host: "example.com".into(),
        user: Some(UserIdentity {
            username: "ada".into(),
            domain: "example.com".into(),
        }),
        ..Config::default()
    }
}

fn posts(items: &[(&str, i64)]) -> Value {
    items
        .iter()
        .map(|(id, ts)| {
            json!({"post_id": id, "status": "public", "timestamp": ts.to_string()})
        })
        .collect()
}

fn insert(at: usize, ids: &[&str], new: &[bool]) -> Event {
    Event::Insert {
        at,
        ids: ids.iter().map(|s| s.to_string()).collect(),
        new: new.to_vec(),
    }
}

#[tokio::test]
async fn pages_merge_and_stop_at_the_sentinel() {
    let mut h = Harness::start(SortType::LocalPublic, config());
    h.handle.construct();
    assert_eq!(h.event().await, Event::Clear);

    h.capture(1000).await;
    let page1 = h.sort_request(SortType::LocalPublic, 1).await;
    let first = posts(&[("p1", 1500), ("p2", 1200), ("p3", 900)]);
    h.answer(&page1, json!({ "posts": first }));
    assert_eq!(
        h.event().await,
        insert(0, &["p1", "p2", "p3"], &[true, true, false])
    );

    h.handle.load_more();
    let page2 = h.sort_request(SortType::LocalPublic, 2).await;
    h.push_update(&page2, json!({"posts": posts(&[("p3", 900), ("p4", 800)])}));
    assert_eq!(h.event().await, insert(3, &["p4"], &[false]));

    h.handle.load_more();
    let page3 = h.sort_request(SortType::LocalPublic, 3).await;
    h.answer(&page3, json!({"posts": [], "page": -1}));
    assert_eq!(h.event().await, Event::Exhausted);

    h.handle.load_more();
    h.handle.load_more();
    h.assert_quiet().await;

    let view = h.handle.view().await.unwrap();
    assert_eq!(view.phase, Phase::Exhausted);
    assert_eq!(view.page, -1);
    let ids: Vec<String> = view.posts.iter().filter_map(|p| p.post.id()).collect();
    assert_eq!(ids, ["p1", "p2", "p3", "p4"]);
    assert!(h.log.messages().is_empty());
}

#[tokio::test]
async fn switching_type_mid_flight_discards_the_old_response() {
    let mut h = Harness::start(SortType::LocalPrivate, config());
    h.handle.construct();
    assert_eq!(h.event().await, Event::Clear);

    h.capture(0).await;
    let old = h.sort_request(SortType::LocalPrivate, 1).await;

    h.handle.change_type(SortType::GlobalPublic);
    let current = h.sort_request(SortType::GlobalPublic, 1).await;
    assert_eq!(h.event().await, Event::Clear);

    h.answer(&old, json!({"posts": posts(&[("stale", 5)])}));
    h.answer(&current, json!({"posts": posts(&[("g1", 5)])}));

    assert_eq!(h.event().await, insert(0, &["g1"], &[true]));
    let view = h.handle.view().await.unwrap();
    assert_eq!(view.sort_type, SortType::GlobalPublic);
    assert_eq!(view.posts.len(), 1);
    assert!(h.log.messages().is_empty());
}

#[tokio::test]
async fn failed_page_offers_a_retry_of_the_same_page() {
    let mut h = Harness::start(SortType::GlobalAll, config());
    h.handle.construct();
    assert_eq!(h.event().await, Event::Clear);

    h.capture(0).await;
    let first = h.sort_request(SortType::GlobalAll, 1).await;
    h.answer(&first, json!({"posts": posts(&[("a", 10)])}));
    assert_eq!(h.event().await, insert(0, &["a"], &[true]));

    h.handle.load_more();
    let failing = h.sort_request(SortType::GlobalAll, 2).await;
    h.remote
        .reply(
            &h.config.data_store(),
            &ResponseEnvelope::failure(failing.correlation_id.clone(), RemoteError {
                message: "rhythm threw".into(),
                stack: Some("at rank (rhythm.js:3)".into()),
            }),
        )
        .unwrap();
    assert_eq!(h.event().await, Event::Retry);

    let messages = h.log.messages();
    assert_eq!(messages[0].message, RETRIEVAL_FAILED);
    assert_eq!(messages[1].kind, MessageKind::Debug);

    h.handle.retry();
    let again = h.sort_request(SortType::GlobalAll, 2).await;
    assert_ne!(again.correlation_id, failing.correlation_id);
    h.answer(&again, json!({"posts": posts(&[("b", 5)])}));
    assert_eq!(h.event().await, insert(1, &["b"], &[true]));

    let view = h.handle.view().await.unwrap();
    assert_eq!(view.phase, Phase::Rendering);
    assert_eq!(view.page, 2);
}

#[tokio::test(start_paused = true)]
async fn timed_out_page_ignores_the_late_response() {
    let mut config = config();
    config.action_timeout_ms = 1000;
    config.data_store_grace_ms = 4000;
    let mut h = Harness::start(SortType::GlobalAll, config);

    let started = tokio::time::Instant::now();
    h.handle.construct();
    assert_eq!(h.event().await, Event::Clear);

    let capture = h.request().await;
    assert_eq!(capture.kind, GET_WAITING_DATA);
    let page1 = h.sort_request(SortType::GlobalAll, 1).await;

    assert_eq!(h.event().await, Event::Retry);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(5000), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(6000), "{elapsed:?}");
    assert_eq!(h.log.messages().len(), 1);

    tokio::time::sleep_until(started + Duration::from_millis(6000)).await;
    h.answer(&page1, json!({"posts": posts(&[("late", 1)])}));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let view = h.handle.view().await.unwrap();
    assert_eq!(view.phase, Phase::Error);
    assert!(view.posts.is_empty());
}

#[tokio::test]
async fn refused_data_store_gives_up_without_a_retry() {
    let misconfigured = Domain::new(DomainKind::Domus, "misconfigured.org");
    let mut h = Harness::start_with(SortType::GlobalAll, config(), misconfigured);
    h.handle.construct();
    assert_eq!(h.event().await, Event::Clear);

    let view = h.wait_for_phase(Phase::Unavailable).await;
    assert!(view.posts.is_empty());

    h.handle.retry();
    h.handle.load_more();
    h.assert_quiet().await;
    assert_eq!(h.handle.view().await.unwrap().phase, Phase::Unavailable);
    assert!(h.events.try_recv().is_err(), "no retry is offered");
    assert!(h.log.messages().is_empty());
}

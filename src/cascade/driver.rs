use std::sync::Arc;

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, debug_span, trace, Instrument};
use typed_builder::TypedBuilder;

use super::{
    view::{CascadeViewState, FetchPlan, RenderOp, RenderedPost, ViewSnapshot},
    waiting::{WaitingData, WaitingDataSnapshot},
};
use crate::sort::{
    FilterDescriptor, SortOutcome, SortProtocol, SortRequest, SortType,
    UserIdentity, ViewKey,
};

/// Where posts end up. Calls arrive in the order the view changed.
pub trait PostRenderer: Send + 'static {
    fn clear(&mut self);
    /// `posts` go in at index `at`, in the order given.
    fn insert(&mut self, at: usize, posts: &[RenderedPost]);
    /// The last fetch failed; offer the user a way to try again.
    fn show_retry(&mut self);
    /// There are no more pages.
    fn exhausted(&mut self);
}

/// What every sort request of one cascade has in common.
#[derive(Clone, Debug, TypedBuilder)]
pub struct CascadeOptions {
    pub filter: FilterDescriptor,
    pub user: UserIdentity,
    #[builder(default)]
    pub moderation_rings: Vec<String>,
    #[builder(default)]
    pub posts_to_timestamp: Option<i64>,
    /// Shown until the first `change_type`.
    #[builder(default = SortType::LocalAll)]
    pub sort_type: SortType,
}

enum Command {
    Construct,
    ChangeType(SortType),
    LoadMore,
    Retry,
    View(oneshot::Sender<ViewSnapshot>),
}

struct Completion {
    plan: FetchPlan,
    outcome: SortOutcome,
    baseline: WaitingDataSnapshot,
}

/// Drives a [`Cascade`] from outside. Cheap to clone; the cascade stops once
/// every handle is dropped.
#[derive(Clone)]
pub struct CascadeHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CascadeHandle {
    /// Clears the view and fetches the first page of the current type.
    pub fn construct(&self) {
        self.send(Command::Construct);
    }

    pub fn change_type(&self, sort_type: SortType) {
        self.send(Command::ChangeType(sort_type));
    }

    pub fn load_more(&self) {
        self.send(Command::LoadMore);
    }

    pub fn retry(&self) {
        self.send(Command::Retry);
    }

    /// The view as it is right now, or `None` if the cascade has stopped.
    pub async fn view(&self) -> Option<ViewSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::View(tx)).ok()?;
        rx.await.ok()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("cascade has stopped");
        }
    }
}

/// A paged, ranked list of posts for one sort type at a time.
///
/// The cascade is a task: commands come in through a [`CascadeHandle`],
/// fetches run concurrently and report back here, and every change to the
/// view is replayed on the renderer.
pub struct Cascade {
    protocol: Arc<SortProtocol>,
    options: CascadeOptions,
    state: CascadeViewState,
    current: watch::Sender<ViewKey>,
    waiting: Arc<WaitingData>,
    renderer: Box<dyn PostRenderer>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Cascade {
    pub fn spawn(
        protocol: Arc<SortProtocol>,
        options: CascadeOptions,
        renderer: impl PostRenderer,
    ) -> (CascadeHandle, JoinHandle<()>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (completions, completions_rx) = mpsc::unbounded_channel();
        let state = CascadeViewState::new(options.sort_type);
        let (current, _) = watch::channel(ViewKey {
            sort_type: state.sort_type(),
            generation: state.generation(),
        });
        let cascade = Cascade {
            protocol,
            state,
            options,
            current,
            waiting: Arc::new(WaitingData::new()),
            renderer: Box::new(renderer),
            completions,
        };
        let task = tokio::spawn(
            cascade
                .run(commands_rx, completions_rx)
                .instrument(debug_span!("cascade")),
        );
        (CascadeHandle { commands }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        debug!("cascade started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                Some(done) = completions.recv() => {
                    let ops = self.state.apply(done.plan, done.outcome, &done.baseline);
                    self.render(ops);
                }
            }
        }
        debug!("cascade stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Construct => {
                let sort_type = self.state.sort_type();
                self.reset(sort_type).await;
            }
            Command::ChangeType(sort_type) => self.reset(sort_type).await,
            Command::LoadMore => match self.state.load_more() {
                Some(plan) => self.start(plan).await,
                None => trace!(phase = ?self.state.phase(), "nothing to load"),
            },
            Command::Retry => match self.state.retry() {
                Some(plan) => self.start(plan).await,
                None => trace!(phase = ?self.state.phase(), "nothing to retry"),
            },
            Command::View(reply) => {
                let _ = reply.send(self.state.snapshot());
            }
        }
    }

    async fn reset(&mut self, sort_type: SortType) {
        let (ops, plan) = self.state.change_type(sort_type);
        self.current.send_replace(ViewKey {
            sort_type,
            generation: self.state.generation(),
        });
        self.render(ops);
        self.start(plan).await;
    }

    async fn start(&mut self, plan: FetchPlan) {
        if plan.page == 1 {
            // must be queued before the page-1 sort, which moves the
            // remote waiting data forward
            self.waiting
                .capture(self.protocol.correlator(), self.protocol.data_store())
                .await;
        }

        let request = SortRequest::builder()
            .sort_type(plan.sort_type)
            .filter(self.options.filter.clone())
            .page(plan.page)
            .user(self.options.user.clone())
            .moderation_rings(self.options.moderation_rings.clone())
            .posts_to_timestamp(self.options.posts_to_timestamp)
            .build();
        let protocol = self.protocol.clone();
        let view = self.current.subscribe();
        let waiting = self.waiting.clone();
        let done = self.completions.clone();

        debug!(
            sort_type = %plan.sort_type,
            page = plan.page,
            generation = plan.generation,
            "fetching page"
        );
        tokio::spawn(async move {
            let outcome = protocol.fetch(request, plan.generation, &view).await;
            let baseline = match outcome {
                SortOutcome::Fresh(_) | SortOutcome::Update(_) => waiting.baseline().await,
                _ => WaitingDataSnapshot::unavailable(),
            };
            let completion = Completion {
                plan,
                outcome,
                baseline,
            };
            if done.send(completion).is_err() {
                trace!("cascade stopped before the fetch finished");
            }
        });
    }

    fn render(&mut self, ops: Vec<RenderOp>) {
        for op in ops {
            match op {
                RenderOp::Clear => self.renderer.clear(),
                RenderOp::Insert { at, posts } => self.renderer.insert(at, &posts),
                RenderOp::ShowRetry => self.renderer.show_retry(),
                RenderOp::Exhausted => self.renderer.exhausted(),
            }
        }
    }
}

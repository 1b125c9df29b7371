use hashbrown::HashSet;
use tracing::{debug, trace};

use super::waiting::WaitingDataSnapshot;
use crate::sort::{FetchFailure, Post, SortBatch, SortOutcome, SortType, NO_MORE_PAGES};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Empty,
    Loading,
    Rendering,
    Exhausted,
    Error,
    /// The data store can't be reached with this configuration. Retrying
    /// won't help; only a reset leaves this phase.
    Unavailable,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderedPost {
    pub post: Post,
    /// Arrived after the user last looked at this category.
    pub is_new: bool,
}

/// A page the view wants fetched. Carries the generation it was planned in
/// so a response can be matched against the view it was meant for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchPlan {
    pub sort_type: SortType,
    pub page: i64,
    pub generation: u64,
}

/// What the renderer has to do to catch up with the state.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderOp {
    Clear,
    Insert { at: usize, posts: Vec<RenderedPost> },
    ShowRetry,
    Exhausted,
}

/// Read-only copy of a view, for observers.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub sort_type: SortType,
    pub page: i64,
    pub phase: Phase,
    pub posts: Vec<RenderedPost>,
}

/// The display state of one cascade of posts.
///
/// `page` is 0 until the first fetch, is bumped before every new page is
/// requested and is pinned to -1 once the remote side runs out. Rendered
/// posts only ever grow at the end until the view is reset.
#[derive(Debug)]
pub struct CascadeViewState {
    sort_type: SortType,
    page: i64,
    phase: Phase,
    generation: u64,
    rendered: Vec<RenderedPost>,
    seen: HashSet<String>,
}

impl CascadeViewState {
    pub fn new(sort_type: SortType) -> Self {
        Self {
            sort_type,
            page: 0,
            phase: Phase::Empty,
            generation: 0,
            rendered: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn sort_type(&self) -> SortType {
        self.sort_type
    }

    pub fn page(&self) -> i64 {
        self.page
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn rendered(&self) -> &[RenderedPost] {
        &self.rendered
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            sort_type: self.sort_type,
            page: self.page,
            phase: self.phase,
            posts: self.rendered.clone(),
        }
    }

    /// Switches to `sort_type` and starts over from page 1. Anything still in
    /// flight for the previous view is stale from here on, even when the type
    /// is unchanged.
    pub fn change_type(&mut self, sort_type: SortType) -> (Vec<RenderOp>, FetchPlan) {
        self.sort_type = sort_type;
        self.generation += 1;
        self.rendered.clear();
        self.seen.clear();
        self.page = 0;
        debug!(%sort_type, generation = self.generation, "view reset");
        (vec![RenderOp::Clear], self.advance())
    }

    /// The next page, if one should be fetched. Nothing is planned while a
    /// fetch is outstanding or after the last page. From the error phase this
    /// asks for the failed page again.
    pub fn load_more(&mut self) -> Option<FetchPlan> {
        match self.phase {
            Phase::Loading | Phase::Exhausted | Phase::Unavailable => None,
            Phase::Error => self.retry(),
            Phase::Empty | Phase::Rendering => Some(self.advance()),
        }
    }

    /// Requests the page that failed. The page counter is left where it was
    /// so no page is skipped.
    pub fn retry(&mut self) -> Option<FetchPlan> {
        if self.phase != Phase::Error {
            return None;
        }
        self.phase = Phase::Loading;
        Some(self.plan())
    }

    /// Folds a finished fetch into the view. Fetches planned for another
    /// view are ignored.
    pub fn apply(
        &mut self,
        plan: FetchPlan,
        outcome: SortOutcome,
        baseline: &WaitingDataSnapshot,
    ) -> Vec<RenderOp> {
        if plan.generation != self.generation || plan.sort_type != self.sort_type {
            trace!(?plan, generation = self.generation, "fetch belongs to an old view");
            return Vec::new();
        }

        match outcome {
            SortOutcome::Fresh(batch) | SortOutcome::Update(batch) => {
                self.merge(batch, baseline)
            }
            SortOutcome::Failed(FetchFailure::Rejected) => {
                debug!(sort_type = %self.sort_type, "data store refused, giving up");
                self.phase = Phase::Unavailable;
                Vec::new()
            }
            SortOutcome::Failed(_) => {
                self.phase = Phase::Error;
                vec![RenderOp::ShowRetry]
            }
            SortOutcome::Stale | SortOutcome::Skipped => {
                if self.phase == Phase::Loading {
                    self.phase = if self.rendered.is_empty() && self.page <= 1 {
                        Phase::Empty
                    } else {
                        Phase::Rendering
                    };
                }
                Vec::new()
            }
        }
    }

    fn merge(&mut self, batch: SortBatch, baseline: &WaitingDataSnapshot) -> Vec<RenderOp> {
        let locality = self.sort_type.locality();
        let at = self.rendered.len();
        let mut added = Vec::with_capacity(batch.posts.len());
        for post in batch.posts {
            if let Some(id) = post.id() {
                if !self.seen.insert(id) {
                    trace!("post already on display");
                    continue;
                }
            }
            let is_new = baseline.is_new(&post, locality);
            added.push(RenderedPost { post, is_new });
        }

        let mut ops = Vec::new();
        if !added.is_empty() {
            self.rendered.extend(added.iter().cloned());
            ops.push(RenderOp::Insert { at, posts: added });
        }

        if batch.exhausted {
            self.page = NO_MORE_PAGES;
            self.phase = Phase::Exhausted;
            ops.push(RenderOp::Exhausted);
        } else {
            self.phase = Phase::Rendering;
        }
        ops
    }

    fn advance(&mut self) -> FetchPlan {
        self.page += 1;
        self.phase = Phase::Loading;
        self.plan()
    }

    fn plan(&self) -> FetchPlan {
        FetchPlan {
            sort_type: self.sort_type,
            page: self.page,
            generation: self.generation,
        }
    }
}

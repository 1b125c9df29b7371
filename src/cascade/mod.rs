//! The inbox view: pages of ranked posts for one sort type, merged as they
//! arrive and marked new against what the user saw last time.

pub mod driver;
pub mod view;
pub mod waiting;

pub use driver::{Cascade, CascadeHandle, CascadeOptions, PostRenderer};
pub use view::{
    CascadeViewState, FetchPlan, Phase, RenderOp, RenderedPost, ViewSnapshot,
};
pub use waiting::{
    WaitingCell, WaitingData, WaitingDataSnapshot, GET_WAITING_DATA,
};

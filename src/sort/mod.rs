//! The stream sort protocol: ranking requests sent to the user's data store,
//! which runs the chosen rhythm in a sandbox and answers with posts in
//! display order.

pub mod protocol;
pub mod request;
pub mod response;

pub use protocol::{SortProtocol, ViewKey, RETRIEVAL_FAILED};
pub use request::{FilterDescriptor, Locality, SortRequest, SortType, UserIdentity};
pub use response::{FetchFailure, Post, SortBatch, SortOutcome, Visibility, NO_MORE_PAGES};

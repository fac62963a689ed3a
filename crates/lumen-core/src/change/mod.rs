//! Resource change feed.
//!
//! Every accepted store mutation is normalized into a [`ResourceChange`]
//! tuple and enqueued on a bounded feed *before* the write is acknowledged
//! to its caller, so the feed order mirrors the order in which the store
//! accepted mutations. A full feed blocks the producing mutation; this is
//! the engine's single intentional back-pressure point.

mod feed;
mod types;

pub use feed::{ChangeFeed, ChangeIngress, ChangePublisher, DEFAULT_INGRESS_CAPACITY};
pub use types::{ChangeKind, ResourceChange};

pub mod change;
pub mod error;
pub mod reference;
pub mod resource;
pub mod time;

pub use change::{ChangeFeed, ChangeIngress, ChangeKind, ChangePublisher, ResourceChange};
pub use error::{CoreError, Result};
pub use reference::{ResourceRef, parse_reference};
pub use resource::{StoredResource, resource_id, resource_type};
pub use time::{format_rfc3339, now_utc, parse_rfc3339};

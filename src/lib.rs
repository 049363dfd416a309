pub mod config;
pub mod dashboard;
pub mod error;
pub mod item;
pub mod leader;
pub mod lease;
pub mod node;
pub mod priority;
pub mod refresh;
pub mod shutdown;
pub mod store;
pub mod view;

pub use error::{QueueError, Result};
pub use item::{ItemStatus, Lease, Payload, ReleaseOutcome, WorkItem, WorkKind};
pub use lease::LeaseManager;
pub use view::{Availability, ClaimFilter, QueueDepth, ViewEntry};

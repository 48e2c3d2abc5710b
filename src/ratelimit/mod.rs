//! Rate limiting logic and state management.

pub mod catalog;
pub mod clock;
mod coordinator;
mod identifier;
pub mod lease;
mod limiter;
pub mod resolver;
pub mod sliding;
mod store;
mod types;

pub use catalog::LimitCatalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::Coordinator;
pub use identifier::{BucketKey, Identifier};
pub use lease::{Lease, LeaseManager};
pub use limiter::{LeaseOutcome, RateLimiter};
pub use resolver::{LimitSource, ResolvedLimit};
pub use store::{Bucket, WindowStore};
pub use types::{
    EvaluationResult, KeyContext, LimitRequest, LimitStatus, OwnerType, RateLimitConfig,
};

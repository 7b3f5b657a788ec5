//! Rate limiting engines and the admission trait they share.

mod backend;
mod clock;
mod fixed_window;
mod task;
mod token_bucket;

pub use backend::{Decision, RateLimiterBackend};
pub use clock::{Clock, MockClock, SystemClock};
pub use fixed_window::{FixedWindowCounter, WindowEntry};
pub use token_bucket::{BucketEntry, OutOfTokens, TokenBucket};

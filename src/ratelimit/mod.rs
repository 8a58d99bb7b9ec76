//! Rate limiting logic and state management.

mod clock;
mod key;
mod limiter;
mod policy;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{LimitKey, RequestContext};
pub use limiter::{Decision, DenialBody, EntrySnapshot, KeyProbe, RateLimiter, StatsReport};
pub use policy::{AuthAction, LimitLayer, LimitPolicy, PolicyConfig, PolicyRegistry};
pub use store::{AttemptOutcome, CounterEntry, CounterStore, KeyInfo};

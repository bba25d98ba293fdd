pub mod backoff;
pub mod clock;
pub mod ids;
pub mod subscribe;

pub use backoff::{BackoffConfig, MAX_BACKOFF_MILLIS};
pub use clock::{Clock, ClockArc, ManualClock, SystemClock};
pub use ids::next_id;
pub use subscribe::{EventBus, Subscription};

//! Admission control for ratelab.
//!
//! Every protected operation names one policy. For each request the
//! [`RateLimiterEngine`] derives a partition key from the caller (client
//! address, identity or webhook source), looks up that partition's
//! fixed-window counter and decides whether the request is:
//!
//! - **admitted** -- a permit of the current window was available,
//! - **queued** -- the window is full but the policy keeps a waiting queue
//!   with room left; the request is admitted by a later window reset, or
//! - **rejected** -- the window and the queue are both full. The
//!   [`Rejection`] carries the time until the window resets.
//!
//! Counters live in a [`DashMap`](dashmap::DashMap) per policy, each behind
//! its own mutex, so unrelated partitions never contend. Idle partitions are
//! evicted by a periodic sweep.

pub mod clock;
pub mod engine;
pub mod fixed_window;
pub mod partition;
pub mod policy;
pub mod registry;
pub mod rejection;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{Admission, EngineSettings, Outcome, RateLimiterEngine};
pub use fixed_window::{PartitionSnapshot, QueueTicket, WaiterOutcome, WindowState};
pub use partition::{ClientContext, Identity};
pub use policy::{Limits, PartitionStrategy, PolicyConfig, PolicyLimits, QueueOrder};
pub use registry::PolicyRegistry;
pub use rejection::{RejectReason, Rejection, RejectionBody};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const REJECTION_STATUS: u16 = 429;
pub const REJECTION_MESSAGE: &str = "Rate limit exceeded. Please try again later.";

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The window was full and the queue had no room.
    LimitExceeded,
    /// The request was queued but a window reset ran out of permits first.
    QueueOverflow,
    /// The caller stopped waiting in the queue.
    QueueTimeout,
    /// The queue entry was dropped without an outcome.
    Cancelled,
}

/// A refused admission, carrying everything needed to answer the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub policy: String,
    pub partition_key: String,
    pub client_addr: Option<String>,
    pub reason: RejectReason,
    /// Time until the partition's window resets, when known.
    pub retry_after: Option<Duration>,
    /// Window length of the policy, used when no retry-after is known.
    pub window: Duration,
}

impl Rejection {
    /// Retry-after in whole seconds, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(ceil_secs)
    }
}

/// Round a duration up to whole seconds.
pub fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// JSON body returned with a 429 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub status_code: u16,
    pub message: String,
    pub retry_after: u64,
    pub timestamp: DateTime<Utc>,
    pub client_address: Option<String>,
}

impl RejectionBody {
    pub fn new(rejection: &Rejection, timestamp: DateTime<Utc>) -> Self {
        Self {
            status_code: REJECTION_STATUS,
            message: REJECTION_MESSAGE.to_string(),
            retry_after: rejection
                .retry_after_secs()
                .unwrap_or_else(|| ceil_secs(rejection.window)),
            timestamp,
            client_address: rejection.client_addr.clone(),
        }
    }
}

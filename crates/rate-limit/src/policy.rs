use std::time::Duration;

use ratelab_common::{PolicySettings, RatelabError, RatelabResult};

pub use ratelab_common::{PartitionStrategy, QueueOrder};

/// Permit and queue sizes applied to one partition's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub permit_limit: u32,
    pub queue_limit: u32,
}

impl Limits {
    pub const fn new(permit_limit: u32, queue_limit: u32) -> Self {
        Self {
            permit_limit,
            queue_limit,
        }
    }
}

/// Limits of a policy, either fixed or selected per request from the
/// caller's authentication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyLimits {
    Fixed(Limits),
    ByAuthentication { authenticated: Limits, anonymous: Limits },
}

impl PolicyLimits {
    /// Pick the limits that apply to a caller.
    pub fn for_identity(&self, authenticated: bool) -> Limits {
        match *self {
            PolicyLimits::Fixed(limits) => limits,
            PolicyLimits::ByAuthentication {
                authenticated: auth,
                anonymous,
            } => {
                if authenticated {
                    auth
                } else {
                    anonymous
                }
            }
        }
    }

    fn all(&self) -> impl Iterator<Item = Limits> {
        let (first, second) = match *self {
            PolicyLimits::Fixed(limits) => (limits, None),
            PolicyLimits::ByAuthentication {
                authenticated,
                anonymous,
            } => (authenticated, Some(anonymous)),
        };
        std::iter::once(first).chain(second)
    }
}

/// An immutable, named fixed-window policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub name: String,
    pub window: Duration,
    pub queue_order: QueueOrder,
    pub partition: PartitionStrategy,
    pub limits: PolicyLimits,
}

impl PolicyConfig {
    /// A policy keyed by client address with oldest-first queueing.
    pub fn new(name: impl Into<String>, permit_limit: u32, window: Duration, queue_limit: u32) -> Self {
        Self {
            name: name.into(),
            window,
            queue_order: QueueOrder::OldestFirst,
            partition: PartitionStrategy::ClientAddress,
            limits: PolicyLimits::Fixed(Limits::new(permit_limit, queue_limit)),
        }
    }

    pub fn with_partition(mut self, partition: PartitionStrategy) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_queue_order(mut self, queue_order: QueueOrder) -> Self {
        self.queue_order = queue_order;
        self
    }

    /// Apply `anonymous` to unauthenticated callers; the limits given to
    /// [`PolicyConfig::new`] then only apply to authenticated ones.
    pub fn with_anonymous_limits(mut self, anonymous: Limits) -> Self {
        let authenticated = self.limits.for_identity(true);
        self.limits = PolicyLimits::ByAuthentication {
            authenticated,
            anonymous,
        };
        self
    }

    pub fn validate(&self) -> RatelabResult<()> {
        let invalid = |reason: &str| RatelabError::InvalidPolicy {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.window.is_zero() {
            return Err(invalid("window must be greater than zero"));
        }
        if self.limits.all().any(|l| l.permit_limit == 0) {
            return Err(invalid("permit limit must be at least 1"));
        }
        Ok(())
    }
}

impl From<&PolicySettings> for PolicyConfig {
    fn from(settings: &PolicySettings) -> Self {
        let config = PolicyConfig::new(
            settings.name.clone(),
            settings.permit_limit,
            Duration::from_millis(settings.window_ms),
            settings.queue_limit,
        )
        .with_partition(settings.partition.clone())
        .with_queue_order(settings.queue_order);

        match settings.anonymous {
            Some(anonymous) => config.with_anonymous_limits(Limits::new(
                anonymous.permit_limit,
                anonymous.queue_limit,
            )),
            None => config,
        }
    }
}

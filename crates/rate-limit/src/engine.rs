//! Admission decisions across all registered policies.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ratelab_common::{RateLimitConfig, RatelabResult};
use tokio::time::MissedTickBehavior;

use crate::clock::{Clock, SystemClock};
use crate::fixed_window::{lock, Decision, PartitionSnapshot, QueueTicket, SharedCounter, WaiterOutcome, WindowCounter};
use crate::partition::{self, ClientContext};
use crate::policy::PolicyConfig;
use crate::registry::{PolicyRegistry, RegisteredPolicy};
use crate::rejection::{RejectReason, Rejection};

/// Immediate result of evaluating a request.
#[derive(Debug)]
pub enum Outcome {
    Admitted,
    /// The window is full; the request holds a place in the queue.
    Queued(QueueTicket),
    Rejected(Rejection),
}

/// Final result of [`RateLimiterEngine::admit`].
#[derive(Debug)]
pub enum Admission {
    /// Admitted, after `waited` in the queue if the window was full.
    Admitted { waited: Option<Duration> },
    Rejected(Rejection),
}

/// Timing knobs of the engine's background maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Default bound on how long [`RateLimiterEngine::admit`] callers wait.
    pub queue_timeout: Duration,
    pub replenish_interval: Duration,
    pub sweep_interval: Duration,
    /// Counters untouched for this long after their window ended are evicted.
    pub idle_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

impl From<&RateLimitConfig> for EngineSettings {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            queue_timeout: Duration::from_millis(config.effective_queue_timeout_ms()),
            replenish_interval: Duration::from_millis(config.replenish_interval_ms),
            sweep_interval: Duration::from_secs(config.eviction.sweep_interval_secs),
            idle_ttl: Duration::from_secs(config.eviction.idle_ttl_secs),
        }
    }
}

/// The rate limiting engine.
///
/// Owns the policy registry and, through it, one counter table per policy.
/// Cheaply cloneable; clones share all state.
#[derive(Clone)]
pub struct RateLimiterEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    registry: PolicyRegistry,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
}

impl std::fmt::Debug for RateLimiterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterEngine")
            .field("policies", &self.inner.registry.len())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl RateLimiterEngine {
    pub fn new(registry: PolicyRegistry, clock: Arc<dyn Clock>, settings: EngineSettings) -> Self {
        tracing::info!(
            policies = registry.len(),
            queue_timeout_ms = settings.queue_timeout.as_millis() as u64,
            idle_ttl_secs = settings.idle_ttl.as_secs(),
            "creating rate limiter engine"
        );
        Self {
            inner: Arc::new(EngineInner {
                registry,
                clock,
                settings,
            }),
        }
    }

    /// Build an engine on the system clock from the `rate_limit` section of
    /// the configuration.
    pub fn from_config(config: &RateLimitConfig) -> RatelabResult<Self> {
        let registry = PolicyRegistry::from_settings(&config.policies)?;
        Ok(Self::new(
            registry,
            Arc::new(SystemClock),
            EngineSettings::from(config),
        ))
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.inner.registry
    }

    /// Registered policies in registration order.
    pub fn policies(&self) -> impl Iterator<Item = &PolicyConfig> {
        self.inner.registry.iter()
    }

    pub fn settings(&self) -> EngineSettings {
        self.inner.settings
    }

    pub fn now(&self) -> Instant {
        self.inner.clock.now()
    }

    /// Evaluate one request against `policy` at `now`.
    ///
    /// Fails only when `policy` is not registered. Mutates exactly one
    /// partition's counter and never waits.
    pub fn evaluate(&self, policy: &str, context: &ClientContext, now: Instant) -> RatelabResult<Outcome> {
        let entry = self.inner.registry.entry(policy)?;
        let config = &entry.config;
        let key = partition::resolve(&config.partition, context);
        let limits = config.limits.for_identity(context.identity.authenticated);

        let (counter, decision) = loop {
            let counter = counter_for(entry, &key, now, limits);
            let mut state = lock(&counter);
            // Lost a race with eviction; the table already holds (or will
            // create) a successor.
            if state.is_retired() {
                continue;
            }
            let decision = state.try_acquire(now, config.window, limits, config.queue_order);
            drop(state);
            break (counter, decision);
        };

        let outcome = match decision {
            Decision::Admitted => {
                tracing::debug!(policy, partition = %key, "request admitted");
                Outcome::Admitted
            }
            Decision::Queued { id, position, rx } => {
                tracing::debug!(policy, partition = %key, position, "request queued");
                Outcome::Queued(QueueTicket::new(id, position, rx, counter))
            }
            Decision::Rejected { retry_after } => {
                tracing::info!(
                    policy,
                    partition = %key,
                    client_addr = ?context.client_addr,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "request rate limited"
                );
                Outcome::Rejected(rejection(
                    config,
                    key,
                    context,
                    RejectReason::LimitExceeded,
                    Some(retry_after),
                ))
            }
        };
        Ok(outcome)
    }

    /// [`evaluate`](Self::evaluate) at the engine clock's current time.
    pub fn check(&self, policy: &str, context: &ClientContext) -> RatelabResult<Outcome> {
        self.evaluate(policy, context, self.now())
    }

    /// Evaluate and, if queued, wait up to `queue_timeout` for a permit.
    ///
    /// A caller that times out gives its queue slot back and is rejected
    /// without a retry-after.
    pub async fn admit(
        &self,
        policy: &str,
        context: &ClientContext,
        queue_timeout: Duration,
    ) -> RatelabResult<Admission> {
        let ticket = match self.check(policy, context)? {
            Outcome::Admitted => return Ok(Admission::Admitted { waited: None }),
            Outcome::Rejected(rejection) => return Ok(Admission::Rejected(rejection)),
            Outcome::Queued(ticket) => ticket,
        };

        let queued_at = Instant::now();
        let (reason, retry_after) = match tokio::time::timeout(queue_timeout, ticket.wait()).await {
            Ok(WaiterOutcome::Admitted) => {
                let waited = queued_at.elapsed();
                tracing::debug!(policy, waited_ms = waited.as_millis() as u64, "queued request admitted");
                return Ok(Admission::Admitted {
                    waited: Some(waited),
                });
            }
            Ok(WaiterOutcome::Displaced { retry_after }) => (RejectReason::QueueOverflow, Some(retry_after)),
            Ok(WaiterOutcome::Cancelled) => (RejectReason::Cancelled, None),
            Err(_) => (RejectReason::QueueTimeout, None),
        };

        let config = self.inner.registry.resolve(policy)?;
        let key = partition::resolve(&config.partition, context);
        tracing::info!(policy, partition = %key, reason = ?reason, "queued request rejected");
        Ok(Admission::Rejected(rejection(config, key, context, reason, retry_after)))
    }

    /// Current state of the caller's partition, without counting a request.
    /// `None` if the partition has never been seen (or was evicted).
    pub fn inspect(
        &self,
        policy: &str,
        context: &ClientContext,
        now: Instant,
    ) -> RatelabResult<Option<PartitionSnapshot>> {
        let entry = self.inner.registry.entry(policy)?;
        let key = partition::resolve(&entry.config.partition, context);
        let counter = entry.counters.get(&key).map(|c| Arc::clone(c.value()));
        Ok(counter.map(|c| lock(&c).snapshot(now, entry.config.window)))
    }

    /// Number of live partitions under `policy`.
    pub fn partition_count(&self, policy: &str) -> RatelabResult<usize> {
        Ok(self.inner.registry.entry(policy)?.counters.len())
    }

    /// Open a new window for every expired partition that has queued
    /// requests. Returns how many queued requests were admitted.
    pub fn replenish(&self, now: Instant) -> usize {
        let mut admitted = 0;
        for entry in self.inner.registry.entries() {
            let waiting: Vec<SharedCounter> = entry
                .counters
                .iter()
                .map(|c| Arc::clone(c.value()))
                .collect();
            for counter in waiting {
                let mut state = lock(&counter);
                if state.has_waiters() {
                    admitted += state.replenish(now, entry.config.window, entry.config.queue_order);
                }
            }
        }
        admitted
    }

    /// Drop counters that have been idle for longer than the configured TTL.
    /// Returns the number of evicted partitions.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = self.inner.settings.idle_ttl;
        let mut evicted = 0;
        for entry in self.inner.registry.entries() {
            let window = entry.config.window;
            let before = entry.counters.len();
            entry.counters.retain(|_, counter| match counter.try_lock() {
                Ok(mut state) if state.is_idle(now, window, ttl) => {
                    state.retire();
                    false
                }
                _ => true,
            });
            evicted += before.saturating_sub(entry.counters.len());
        }
        evicted
    }

    /// Spawn a Tokio task that promotes queued requests and evicts idle
    /// partitions. The task runs until the runtime shuts down or the handle
    /// is aborted.
    pub fn start_maintenance_task(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let settings = self.inner.settings;

        tokio::spawn(async move {
            let mut replenish = tokio::time::interval(settings.replenish_interval);
            let mut sweep = tokio::time::interval(settings.sweep_interval);
            replenish.set_missed_tick_behavior(MissedTickBehavior::Delay);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = replenish.tick() => {
                        let admitted = engine.replenish(engine.now());
                        if admitted > 0 {
                            tracing::debug!(admitted, "promoted queued requests");
                        }
                    }
                    _ = sweep.tick() => {
                        let evicted = engine.evict_idle(engine.now());
                        tracing::debug!(evicted, "idle partition sweep complete");
                    }
                }
            }
        })
    }
}

fn counter_for(
    entry: &RegisteredPolicy,
    key: &str,
    now: Instant,
    limits: crate::policy::Limits,
) -> SharedCounter {
    if let Some(existing) = entry.counters.get(key) {
        return Arc::clone(existing.value());
    }
    let created = entry
        .counters
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(WindowCounter::new(now, limits))));
    Arc::clone(created.value())
}

fn rejection(
    config: &PolicyConfig,
    partition_key: String,
    context: &ClientContext,
    reason: RejectReason,
    retry_after: Option<Duration>,
) -> Rejection {
    Rejection {
        policy: config.name.clone(),
        partition_key,
        client_addr: context.client_addr.clone(),
        reason,
        retry_after,
        window: config.window,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::fixed_window::WindowState;
    use crate::partition::Identity;
    use ratelab_common::RatelabError;
    use std::thread;

    const WINDOW: Duration = Duration::from_secs(60);

    fn engine_with(policies: Vec<PolicyConfig>, clock: ManualClock) -> RateLimiterEngine {
        let mut registry = PolicyRegistry::new();
        for policy in policies {
            registry.register(policy).unwrap();
        }
        RateLimiterEngine::new(registry, Arc::new(clock), EngineSettings::default())
    }

    fn ctx(addr: &str) -> ClientContext {
        ClientContext::from_addr(addr)
    }

    #[test]
    fn unknown_policy_is_an_error_not_an_admit() {
        let engine = engine_with(vec![], ManualClock::default());
        let err = engine.check("strict", &ctx("10.0.0.1")).unwrap_err();
        assert!(matches!(err, RatelabError::UnknownPolicy(_)));
    }

    #[test]
    fn rejection_carries_response_fields() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        let engine = engine_with(vec![PolicyConfig::new("strict", 1, WINDOW, 0)], clock);

        assert!(matches!(engine.evaluate("strict", &ctx("10.0.0.1"), t0).unwrap(), Outcome::Admitted));
        let later = t0 + Duration::from_millis(10_500);
        match engine.evaluate("strict", &ctx("10.0.0.1"), later).unwrap() {
            Outcome::Rejected(r) => {
                assert_eq!(r.policy, "strict");
                assert_eq!(r.partition_key, "10.0.0.1");
                assert_eq!(r.client_addr.as_deref(), Some("10.0.0.1"));
                assert_eq!(r.reason, RejectReason::LimitExceeded);
                assert_eq!(r.retry_after, Some(Duration::from_millis(49_500)));
                assert_eq!(r.retry_after_secs(), Some(50));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn partitions_are_independent() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        let engine = engine_with(vec![PolicyConfig::new("strict", 1, WINDOW, 0)], clock);

        assert!(matches!(engine.evaluate("strict", &ctx("a"), t0).unwrap(), Outcome::Admitted));
        assert!(matches!(engine.evaluate("strict", &ctx("a"), t0).unwrap(), Outcome::Rejected(_)));
        assert!(matches!(engine.evaluate("strict", &ctx("b"), t0).unwrap(), Outcome::Admitted));
        assert_eq!(engine.partition_count("strict").unwrap(), 2);
    }

    #[test]
    fn parallel_first_requests_share_one_counter() {
        const LIMIT: u32 = 10;
        const QUEUE: u32 = 4;
        const CALLERS: usize = 64;

        let clock = ManualClock::default();
        let t0 = clock.now();
        let engine = engine_with(vec![PolicyConfig::new("burst", LIMIT, WINDOW, QUEUE)], clock);

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || engine.evaluate("burst", &ctx("10.0.0.1"), t0).unwrap())
            })
            .collect();
        let outcomes: Vec<Outcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let admitted = outcomes.iter().filter(|o| matches!(o, Outcome::Admitted)).count();
        let queued = outcomes.iter().filter(|o| matches!(o, Outcome::Queued(_))).count();
        let rejected = outcomes.iter().filter(|o| matches!(o, Outcome::Rejected(_))).count();

        assert_eq!(admitted, LIMIT as usize);
        assert_eq!(queued, QUEUE as usize);
        assert_eq!(rejected, CALLERS - LIMIT as usize - QUEUE as usize);
        assert_eq!(engine.partition_count("burst").unwrap(), 1);

        let snapshot = engine.inspect("burst", &ctx("10.0.0.1"), t0).unwrap().unwrap();
        assert_eq!(snapshot.count, LIMIT);
        assert_eq!(snapshot.queued, QUEUE as usize);
    }

    #[test]
    fn per_request_limits_follow_authentication() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        let policy = PolicyConfig::new("normal", 2, WINDOW, 0)
            .with_partition(crate::policy::PartitionStrategy::Identity)
            .with_anonymous_limits(crate::policy::Limits::new(1, 0));
        let engine = engine_with(vec![policy], clock);

        let user = ctx("10.0.0.1").with_identity(Identity::authenticated("alice"));
        let anon = ctx("10.0.0.1");

        assert!(matches!(engine.evaluate("normal", &user, t0).unwrap(), Outcome::Admitted));
        assert!(matches!(engine.evaluate("normal", &user, t0).unwrap(), Outcome::Admitted));
        assert!(matches!(engine.evaluate("normal", &user, t0).unwrap(), Outcome::Rejected(_)));

        assert!(matches!(engine.evaluate("normal", &anon, t0).unwrap(), Outcome::Admitted));
        assert!(matches!(engine.evaluate("normal", &anon, t0).unwrap(), Outcome::Rejected(_)));
    }

    #[test]
    fn idle_partitions_are_evicted_and_recreated() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        let mut registry = PolicyRegistry::new();
        registry.register(PolicyConfig::new("strict", 1, WINDOW, 0)).unwrap();
        let settings = EngineSettings {
            idle_ttl: Duration::from_secs(120),
            ..EngineSettings::default()
        };
        let engine = RateLimiterEngine::new(registry, Arc::new(clock), settings);

        engine.evaluate("strict", &ctx("a"), t0).unwrap();
        engine.evaluate("strict", &ctx("b"), t0 + Duration::from_secs(100)).unwrap();

        // "a" was last seen 120s ago and its window is over; "b" is still live.
        assert_eq!(engine.evict_idle(t0 + Duration::from_secs(120)), 1);
        assert_eq!(engine.partition_count("strict").unwrap(), 1);
        assert!(engine.inspect("strict", &ctx("a"), t0).unwrap().is_none());

        let later = t0 + Duration::from_secs(121);
        assert!(matches!(engine.evaluate("strict", &ctx("a"), later).unwrap(), Outcome::Admitted));
        assert!(matches!(engine.evaluate("strict", &ctx("b"), later).unwrap(), Outcome::Rejected(_)));
    }

    #[test]
    fn partitions_with_waiters_are_never_evicted() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        let mut registry = PolicyRegistry::new();
        registry.register(PolicyConfig::new("queued", 1, WINDOW, 1)).unwrap();
        let settings = EngineSettings {
            idle_ttl: Duration::ZERO,
            ..EngineSettings::default()
        };
        let engine = RateLimiterEngine::new(registry, Arc::new(clock), settings);

        engine.evaluate("queued", &ctx("a"), t0).unwrap();
        let _ticket = engine.evaluate("queued", &ctx("a"), t0).unwrap();

        assert_eq!(engine.evict_idle(t0 + WINDOW * 10), 0);
        assert_eq!(engine.partition_count("queued").unwrap(), 1);
    }

    #[tokio::test]
    async fn queued_request_is_admitted_on_replenish() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        let engine = engine_with(vec![PolicyConfig::new("message", 1, WINDOW, 1)], clock.clone());

        engine.check("message", &ctx("a")).unwrap();

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.admit("message", &ctx("a"), Duration::from_secs(5)).await })
        };

        // Wait until the request is actually parked in the queue.
        while engine.inspect("message", &ctx("a"), t0).unwrap().unwrap().queued == 0 {
            tokio::task::yield_now().await;
        }

        clock.advance(WINDOW);
        assert_eq!(engine.replenish(engine.now()), 1);

        match waiter.await.unwrap().unwrap() {
            Admission::Admitted { waited } => assert!(waited.is_some()),
            other => panic!("expected admission, got {:?}", other),
        }

        let snapshot = engine.inspect("message", &ctx("a"), engine.now()).unwrap().unwrap();
        assert_eq!(snapshot.state, WindowState::Full);
        assert_eq!(snapshot.count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn default_queue_timeout_reaches_the_next_reset() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        let engine = engine_with(vec![PolicyConfig::new("message", 1, WINDOW, 1)], clock.clone());
        let queue_timeout = engine.settings().queue_timeout;
        assert!(queue_timeout >= WINDOW + engine.settings().replenish_interval);

        engine.check("message", &ctx("a")).unwrap();

        // Queued early in the window, so the wait spans most of it.
        clock.advance(Duration::from_secs(5));
        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.admit("message", &ctx("a"), queue_timeout).await })
        };
        while engine.inspect("message", &ctx("a"), t0).unwrap().unwrap().queued == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(WINDOW - Duration::from_secs(5)).await;
        clock.set(t0 + WINDOW);
        assert_eq!(engine.replenish(engine.now()), 1);

        match waiter.await.unwrap().unwrap() {
            Admission::Admitted { waited } => assert!(waited.is_some()),
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn queue_timeout_releases_slot() {
        let clock = ManualClock::default();
        let t0 = clock.now();
        let engine = engine_with(vec![PolicyConfig::new("message", 1, WINDOW, 1)], clock);

        engine.check("message", &ctx("a")).unwrap();

        match engine.admit("message", &ctx("a"), Duration::from_millis(20)).await.unwrap() {
            Admission::Rejected(r) => {
                assert_eq!(r.reason, RejectReason::QueueTimeout);
                assert_eq!(r.retry_after, None);
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        let snapshot = engine.inspect("message", &ctx("a"), t0).unwrap().unwrap();
        assert_eq!(snapshot.queued, 0);

        // The slot is free again.
        assert!(matches!(engine.check("message", &ctx("a")).unwrap(), Outcome::Queued(_)));
    }

    #[tokio::test]
    async fn full_queue_rejects_without_waiting() {
        let clock = ManualClock::default();
        let engine = engine_with(vec![PolicyConfig::new("strict", 1, WINDOW, 0)], clock);

        engine.check("strict", &ctx("a")).unwrap();
        match engine.admit("strict", &ctx("a"), Duration::from_secs(60)).await.unwrap() {
            Admission::Rejected(r) => {
                assert_eq!(r.reason, RejectReason::LimitExceeded);
                assert_eq!(r.retry_after, Some(WINDOW));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}

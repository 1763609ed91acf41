use std::collections::HashMap;

use dashmap::DashMap;
use ratelab_common::{PolicySettings, RatelabError, RatelabResult};

use crate::fixed_window::SharedCounter;
use crate::policy::PolicyConfig;

/// A registered policy together with the counters of its partitions.
#[derive(Debug)]
pub(crate) struct RegisteredPolicy {
    pub(crate) config: PolicyConfig,
    pub(crate) counters: DashMap<String, SharedCounter>,
}

/// Named policies, fixed at startup.
///
/// Registration takes `&mut self`, so once the registry has been handed to a
/// [`RateLimiterEngine`](crate::RateLimiterEngine) its set of policies can no
/// longer change and lookups need no locking.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    entries: Vec<RegisteredPolicy>,
    index: HashMap<String, usize>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The six policies of the reference configuration.
    pub fn reference() -> Self {
        Self::from_settings(&ratelab_common::reference_policies())
            .expect("reference policies are valid")
    }

    /// Build a registry from declarative policy settings.
    pub fn from_settings(settings: &[PolicySettings]) -> RatelabResult<Self> {
        let mut registry = Self::new();
        for policy in settings {
            registry.register(PolicyConfig::from(policy))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, config: PolicyConfig) -> RatelabResult<()> {
        if self.index.contains_key(&config.name) {
            return Err(RatelabError::DuplicatePolicy(config.name));
        }
        config.validate()?;

        tracing::info!(
            policy = %config.name,
            window_ms = config.window.as_millis() as u64,
            limits = ?config.limits,
            partition = ?config.partition,
            "registered rate limit policy"
        );

        self.index.insert(config.name.clone(), self.entries.len());
        self.entries.push(RegisteredPolicy {
            config,
            counters: DashMap::new(),
        });
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> RatelabResult<&PolicyConfig> {
        self.entry(name).map(|entry| &entry.config)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Registered policies in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &PolicyConfig> {
        self.entries.iter().map(|entry| &entry.config)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry(&self, name: &str) -> RatelabResult<&RegisteredPolicy> {
        self.index
            .get(name)
            .map(|&i| &self.entries[i])
            .ok_or_else(|| RatelabError::UnknownPolicy(name.to_string()))
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &RegisteredPolicy> {
        self.entries.iter()
    }
}

use serde::{Deserialize, Serialize};

use crate::error::{RatelabError, RatelabResult};

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub forwarded_headers: ForwardedHeadersConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Controls whether the client address is taken from a proxy-supplied header.
///
/// Enabling this assumes the service is only reachable through a trusted
/// reverse proxy; otherwise clients can pick their own partition key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedHeadersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_forwarded_header")]
    pub header: String,
}

impl Default for ForwardedHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            header: default_forwarded_header(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// How long a queued request may wait for a permit before it is rejected.
    /// When unset, long enough to reach the next reset of the longest window.
    #[serde(default)]
    pub queue_timeout_ms: Option<u64>,
    /// Tick used to promote queued requests once their window has expired.
    #[serde(default = "default_replenish_interval_ms")]
    pub replenish_interval_ms: u64,
    #[serde(default)]
    pub eviction: EvictionConfig,
    #[serde(default = "reference_policies")]
    pub policies: Vec<PolicySettings>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            queue_timeout_ms: None,
            replenish_interval_ms: default_replenish_interval_ms(),
            eviction: EvictionConfig::default(),
            policies: reference_policies(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvictionConfig {
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_idle_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RateLimitConfig {
    /// The queue timeout in effect: the configured one, or the longest policy
    /// window plus one replenish tick, so a request queued at the start of a
    /// window still sees the reset that admits it.
    pub fn effective_queue_timeout_ms(&self) -> u64 {
        self.queue_timeout_ms.unwrap_or_else(|| {
            let longest = self.policies.iter().map(|p| p.window_ms).max().unwrap_or(0);
            longest.saturating_add(self.replenish_interval_ms)
        })
    }
}

/// Declarative form of a single named rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub name: String,
    pub permit_limit: u32,
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default)]
    pub queue_limit: u32,
    #[serde(default)]
    pub queue_order: QueueOrder,
    #[serde(default)]
    pub partition: PartitionStrategy,
    /// Limits applied instead of the top-level ones when the caller is not
    /// authenticated. When absent the policy ignores authentication.
    #[serde(default)]
    pub anonymous: Option<LimitSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    pub permit_limit: u32,
    #[serde(default)]
    pub queue_limit: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// How the partition key of a request is derived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// The resolved client network address.
    #[default]
    ClientAddress,
    /// `user_<subject>` for authenticated callers, falling back to the address.
    Identity,
    /// `webhook_<source>` taken from a named header, then the forwarded-for
    /// chain, then the address.
    SourceHeader {
        #[serde(default = "default_source_header")]
        header: String,
    },
}

/// Names of the reference policies.
pub mod policy_names {
    pub const STRICT: &str = "strict";
    pub const MODERATE: &str = "moderate";
    pub const NORMAL: &str = "normal";
    pub const GENEROUS: &str = "generous";
    pub const HIGH_THROUGHPUT: &str = "high_throughput";
    pub const MESSAGE: &str = "message";
}

/// The six policies the playground ships with.
pub fn reference_policies() -> Vec<PolicySettings> {
    let fixed = |name: &str, permit_limit, queue_limit, partition| PolicySettings {
        name: name.to_string(),
        permit_limit,
        window_ms: default_window_ms(),
        queue_limit,
        queue_order: QueueOrder::OldestFirst,
        partition,
        anonymous: None,
    };

    use policy_names::*;
    vec![
        fixed(STRICT, 5, 0, PartitionStrategy::ClientAddress),
        fixed(MODERATE, 20, 0, PartitionStrategy::ClientAddress),
        PolicySettings {
            anonymous: Some(LimitSettings {
                permit_limit: 60,
                queue_limit: 2,
            }),
            ..fixed(NORMAL, 150, 5, PartitionStrategy::Identity)
        },
        fixed(GENEROUS, 300, 10, PartitionStrategy::ClientAddress),
        fixed(
            HIGH_THROUGHPUT,
            500,
            50,
            PartitionStrategy::SourceHeader {
                header: default_source_header(),
            },
        ),
        fixed(MESSAGE, 100, 10, PartitionStrategy::ClientAddress),
    ]
}

// Default value helpers
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_true() -> bool {
    true
}
fn default_forwarded_header() -> String {
    "x-forwarded-for".to_string()
}
fn default_source_header() -> String {
    "x-webhook-source".to_string()
}
fn default_replenish_interval_ms() -> u64 {
    1_000
}
fn default_idle_ttl_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_window_ms() -> u64 {
    60_000
}

impl AppConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> RatelabResult<()> {
        if self.server.listen.trim().is_empty() {
            return Err(invalid("server.listen must not be empty"));
        }

        if self.forwarded_headers.enabled && self.forwarded_headers.header.trim().is_empty() {
            return Err(invalid("forwarded_headers.header must not be empty when enabled"));
        }

        let rate_limit = &self.rate_limit;
        if rate_limit.replenish_interval_ms == 0 {
            return Err(invalid("rate_limit.replenish_interval_ms must be greater than zero"));
        }
        if rate_limit.eviction.sweep_interval_secs == 0 {
            return Err(invalid("rate_limit.eviction.sweep_interval_secs must be greater than zero"));
        }
        if rate_limit.policies.is_empty() {
            return Err(invalid("rate_limit.policies must declare at least one policy"));
        }

        let mut seen = std::collections::HashSet::new();
        for policy in &rate_limit.policies {
            if !seen.insert(policy.name.as_str()) {
                return Err(invalid(format!("policy '{}' is declared more than once", policy.name)));
            }
            policy.validate()?;
        }

        Ok(())
    }
}

impl PolicySettings {
    /// Check the per-policy invariants: a non-empty name, at least one permit
    /// per window and a non-zero window.
    pub fn validate(&self) -> RatelabResult<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("policy name must not be empty"));
        }
        if self.permit_limit == 0 {
            return Err(invalid(format!("policy '{}' must permit at least one request", self.name)));
        }
        if let Some(anonymous) = &self.anonymous {
            if anonymous.permit_limit == 0 {
                return Err(invalid(format!(
                    "policy '{}' must permit at least one anonymous request",
                    self.name
                )));
            }
        }
        if self.window_ms == 0 {
            return Err(invalid(format!("policy '{}' has a zero-length window", self.name)));
        }
        if let PartitionStrategy::SourceHeader { header } = &self.partition {
            if header.trim().is_empty() {
                return Err(invalid(format!("policy '{}' names an empty source header", self.name)));
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> RatelabError {
    RatelabError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_reference_policies() {
        let config = AppConfig::default();
        let names: Vec<_> = config
            .rate_limit
            .policies
            .iter()
            .map(|p| p.name.as_str())
            .collect();

        assert_eq!(
            names,
            ["strict", "moderate", "normal", "generous", "high_throughput", "message"]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_yaml_with_defaults() {
        let yaml = r#"
server:
  listen: "127.0.0.1:3000"
rate_limit:
  policies:
    - name: strict
      permit_limit: 5
    - name: webhooks
      permit_limit: 500
      window_ms: 1500
      queue_limit: 50
      queue_order: newest_first
      partition: { kind: source_header }
    - name: normal
      permit_limit: 150
      queue_limit: 5
      anonymous: { permit_limit: 60, queue_limit: 2 }
      partition: { kind: identity }
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:3000");
        assert!(config.forwarded_headers.enabled);
        assert_eq!(config.rate_limit.queue_timeout_ms, None);
        // Longest window is the default 60s, plus the 1s replenish tick.
        assert_eq!(config.rate_limit.effective_queue_timeout_ms(), 61_000);

        let strict = &config.rate_limit.policies[0];
        assert_eq!(strict.window_ms, 60_000);
        assert_eq!(strict.queue_limit, 0);
        assert_eq!(strict.partition, PartitionStrategy::ClientAddress);

        let webhooks = &config.rate_limit.policies[1];
        assert_eq!(webhooks.queue_order, QueueOrder::NewestFirst);
        assert_eq!(
            webhooks.partition,
            PartitionStrategy::SourceHeader {
                header: "x-webhook-source".to_string()
            }
        );

        let normal = &config.rate_limit.policies[2];
        assert_eq!(
            normal.anonymous,
            Some(LimitSettings {
                permit_limit: 60,
                queue_limit: 2
            })
        );
    }

    #[test]
    fn rejects_duplicate_policy_names() {
        let mut config = AppConfig::default();
        let duplicate = config.rate_limit.policies[0].clone();
        config.rate_limit.policies.push(duplicate);

        let err = config.validate().unwrap_err();
        assert!(matches!(&err, RatelabError::Config(msg) if msg.contains("more than once")));
    }

    #[test]
    fn rejects_zero_limits_and_windows() {
        let mut config = AppConfig::default();
        config.rate_limit.policies[0].permit_limit = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.rate_limit.policies[1].window_ms = 0;
        assert!(config.validate().is_err());
    }
}

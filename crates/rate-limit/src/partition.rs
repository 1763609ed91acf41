//! Partition key derivation.
//!
//! A partition key isolates one caller's quota from another's within a
//! policy. Resolution never fails: each strategy falls back to a literal key
//! when the attribute it prefers is missing, so unidentifiable callers share
//! a single bucket instead of escaping the limit.

use http::HeaderMap;

use crate::policy::PartitionStrategy;

/// Key used when no client address could be resolved.
pub const UNKNOWN_KEY: &str = "unknown";

/// Identity suffix used for callers with neither claims nor address.
pub const ANONYMOUS_KEY: &str = "anonymous";

const IDENTITY_PREFIX: &str = "user_";
const SOURCE_PREFIX: &str = "webhook_";

/// Who the caller is, as established by the authentication layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub authenticated: bool,
    /// Stable subject identifier (e.g. an OpenID `sub` claim).
    pub subject: Option<String>,
    /// Display or user name claim.
    pub name: Option<String>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn authenticated(subject: impl Into<String>) -> Self {
        let subject = subject.into();
        Self {
            authenticated: true,
            name: Some(subject.clone()),
            subject: Some(subject),
        }
    }
}

/// Everything the transport layer resolved about a request that the limiter
/// may partition on.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    pub client_addr: Option<String>,
    /// First hop of the forwarded-for chain. Only set by the transport layer
    /// when forwarded headers are trusted.
    pub forwarded_for: Option<String>,
    pub identity: Identity,
    pub headers: HeaderMap,
}

impl ClientContext {
    pub fn from_addr(addr: impl Into<String>) -> Self {
        Self {
            client_addr: Some(addr.into()),
            ..Self::default()
        }
    }

    pub fn with_forwarded_for(mut self, hop: impl Into<String>) -> Self {
        self.forwarded_for = Some(hop.into());
        self
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Attach a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::from_bytes(name.as_bytes()),
            http::HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn addr(&self) -> Option<&str> {
        self.client_addr.as_deref().filter(|a| !a.is_empty())
    }
}

/// Derive the partition key of `context` under `strategy`.
pub fn resolve(strategy: &PartitionStrategy, context: &ClientContext) -> String {
    match strategy {
        PartitionStrategy::ClientAddress => context.addr().unwrap_or(UNKNOWN_KEY).to_string(),
        PartitionStrategy::Identity => {
            let identity = &context.identity;
            let id = non_empty(&identity.subject)
                .or_else(|| non_empty(&identity.name))
                .or_else(|| context.addr())
                .unwrap_or(ANONYMOUS_KEY);
            format!("{IDENTITY_PREFIX}{id}")
        }
        PartitionStrategy::SourceHeader { header } => {
            let source = context
                .header(header)
                .or_else(|| non_empty(&context.forwarded_for))
                .or_else(|| context.addr())
                .unwrap_or(UNKNOWN_KEY);
            format!("{SOURCE_PREFIX}{source}")
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_header() -> PartitionStrategy {
        PartitionStrategy::SourceHeader {
            header: "x-webhook-source".to_string(),
        }
    }

    #[test]
    fn address_strategy_falls_back_to_unknown() {
        let strategy = PartitionStrategy::ClientAddress;
        assert_eq!(resolve(&strategy, &ClientContext::from_addr("10.0.0.1")), "10.0.0.1");
        assert_eq!(resolve(&strategy, &ClientContext::default()), "unknown");
    }

    #[test]
    fn identity_prefers_subject_then_name_then_address() {
        let strategy = PartitionStrategy::Identity;

        let ctx = ClientContext::from_addr("10.0.0.1").with_identity(Identity {
            authenticated: true,
            subject: Some("sub-1".into()),
            name: Some("alice".into()),
        });
        assert_eq!(resolve(&strategy, &ctx), "user_sub-1");

        let ctx = ClientContext::from_addr("10.0.0.1").with_identity(Identity {
            authenticated: true,
            subject: None,
            name: Some("alice".into()),
        });
        assert_eq!(resolve(&strategy, &ctx), "user_alice");

        let ctx = ClientContext::from_addr("10.0.0.1");
        assert_eq!(resolve(&strategy, &ctx), "user_10.0.0.1");

        assert_eq!(resolve(&strategy, &ClientContext::default()), "user_anonymous");
    }

    #[test]
    fn source_header_precedence() {
        let strategy = source_header();

        let ctx = ClientContext::from_addr("10.0.0.1")
            .with_header("x-webhook-source", "paypal")
            .with_forwarded_for("203.0.113.9");
        assert_eq!(resolve(&strategy, &ctx), "webhook_paypal");

        let ctx = ClientContext::from_addr("10.0.0.1").with_forwarded_for("203.0.113.9");
        assert_eq!(resolve(&strategy, &ctx), "webhook_203.0.113.9");

        let ctx = ClientContext::from_addr("10.0.0.1");
        assert_eq!(resolve(&strategy, &ctx), "webhook_10.0.0.1");

        assert_eq!(resolve(&strategy, &ClientContext::default()), "webhook_unknown");
    }

    #[test]
    fn raw_forwarded_header_is_not_a_source() {
        // Only the transport layer decides whether forwarded-for is trusted.
        let ctx = ClientContext::from_addr("10.0.0.1").with_header("x-forwarded-for", "203.0.113.9");
        assert_eq!(resolve(&source_header(), &ctx), "webhook_10.0.0.1");
    }

    #[test]
    fn blank_source_header_counts_as_missing() {
        let ctx = ClientContext::from_addr("10.0.0.1").with_header("x-webhook-source", "  ");
        assert_eq!(resolve(&source_header(), &ctx), "webhook_10.0.0.1");
    }
}

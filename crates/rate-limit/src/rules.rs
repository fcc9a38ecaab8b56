//! Rule registry: named admission rules, endpoint resolution and
//! role-based quota scaling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use config::{EndpointRuleConfig, KeyStrategy, RateLimitConfig, RuleConfig};
use dashmap::DashSet;
use mini_moka::sync::Cache;

pub use config::DEFAULT_RULE_NAME;

/// Quota of the built-in default rule, used when the configuration does
/// not define one under [`DEFAULT_RULE_NAME`].
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_MAX_REQUESTS: u64 = 100;

/// An admission rule. Immutable once registered; identified by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitRule {
    /// Rule name, unique within the registry.
    pub name: String,
    /// Length of the fixed counting window.
    pub window: Duration,
    /// Maximum number of requests admitted within the window.
    pub max_requests: u64,
    /// How the counting key is derived from a request.
    pub key_strategy: KeyStrategy,
    /// Message returned in the rejection body instead of the default.
    pub message: Option<String>,
    /// Emit `X-RateLimit-*` headers with an ISO-8601 reset timestamp.
    pub standard_headers: bool,
    /// Emit `X-Rate-Limit-*` headers with an epoch-seconds reset value.
    pub legacy_headers: bool,
}

impl RateLimitRule {
    fn from_config(name: &str, config: &RuleConfig) -> Self {
        Self {
            name: name.to_string(),
            window: config.window,
            max_requests: config.max_requests,
            key_strategy: config.key_strategy,
            message: config.message.clone(),
            standard_headers: config.standard_headers,
            legacy_headers: config.legacy_headers,
        }
    }

    fn built_in_default() -> Self {
        Self {
            name: DEFAULT_RULE_NAME.to_string(),
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
            key_strategy: KeyStrategy::Caller,
            message: None,
            standard_headers: true,
            legacy_headers: false,
        }
    }
}

#[derive(Debug)]
enum EndpointMatcher {
    Exact(String),
    Prefix(String),
}

/// Process-wide table of admission rules, read-only after startup.
pub struct RuleRegistry {
    rules: HashMap<String, Arc<RateLimitRule>>,
    endpoints: Vec<(EndpointMatcher, String)>,
    roles: HashMap<String, f64>,
    default_rule: Arc<RateLimitRule>,
    /// Role-adjusted rules cached per `(rule, role)` pair, so quota
    /// scaling does not allocate a fresh rule on every request.
    adjusted: Cache<(String, String), Arc<RateLimitRule>>,
    warned_unknown: DashSet<String>,
}

impl RuleRegistry {
    /// Build the registry from configuration. A missing default rule is
    /// replaced by a built-in quota so resolution can never come up
    /// empty.
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut rules: HashMap<String, Arc<RateLimitRule>> = config
            .rules
            .iter()
            .map(|(name, rule)| (name.clone(), Arc::new(RateLimitRule::from_config(name, rule))))
            .collect();

        let default_rule = match rules.get(DEFAULT_RULE_NAME) {
            Some(rule) => rule.clone(),
            None => {
                let rule = Arc::new(RateLimitRule::built_in_default());
                rules.insert(DEFAULT_RULE_NAME.to_string(), rule.clone());
                rule
            }
        };

        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| match endpoint {
                EndpointRuleConfig::Exact { path, rule } => (EndpointMatcher::Exact(path.clone()), rule.clone()),
                EndpointRuleConfig::Prefix { prefix, rule } => {
                    (EndpointMatcher::Prefix(prefix.clone()), rule.clone())
                }
            })
            .collect();

        Self {
            rules,
            endpoints,
            roles: config.roles.iter().map(|(role, factor)| (role.clone(), *factor)).collect(),
            default_rule,
            adjusted: Cache::builder().max_capacity(1_024).build(),
            warned_unknown: DashSet::new(),
        }
    }

    /// Resolve the rule name for a request path: exact match first, then
    /// the first matching prefix in declaration order, then the default.
    ///
    /// Prefix ambiguity is resolved by registration order, not by the
    /// longest prefix; overlapping prefixes must be declared from most
    /// specific to least specific.
    pub fn resolve(&self, path: &str) -> &str {
        for (matcher, rule) in &self.endpoints {
            if let EndpointMatcher::Exact(exact) = matcher
                && exact == path
            {
                return rule;
            }
        }

        for (matcher, rule) in &self.endpoints {
            if let EndpointMatcher::Prefix(prefix) = matcher
                && path.starts_with(prefix.as_str())
            {
                return rule;
            }
        }

        DEFAULT_RULE_NAME
    }

    /// Look up a rule by name.
    ///
    /// Unknown names resolve to the default rule so a registry miss
    /// never blocks traffic; each distinct unknown name is logged once.
    pub fn rule(&self, name: &str) -> Arc<RateLimitRule> {
        match self.rules.get(name) {
            Some(rule) => rule.clone(),
            None => {
                if self.warned_unknown.insert(name.to_string()) {
                    log::warn!("Unknown admission rule '{name}', falling back to '{DEFAULT_RULE_NAME}'");
                }

                self.default_rule.clone()
            }
        }
    }

    /// Quota multiplier for a role. Unknown roles scale by 1.0.
    pub fn role_multiplier(&self, role: &str) -> f64 {
        self.roles.get(role).copied().unwrap_or(1.0)
    }

    /// Rule with the caller's role scaling applied: `max_requests`
    /// scaled by the role factor, floored to an integer, minimum 1.
    pub fn rule_for_role(&self, name: &str, role: Option<&str>) -> Arc<RateLimitRule> {
        let rule = self.rule(name);

        let Some(role) = role else {
            return rule;
        };

        let factor = self.role_multiplier(role);

        if (factor - 1.0).abs() < f64::EPSILON {
            return rule;
        }

        let cache_key = (rule.name.clone(), role.to_string());

        if let Some(adjusted) = self.adjusted.get(&cache_key) {
            return adjusted;
        }

        let mut adjusted = (*rule).clone();
        adjusted.max_requests = scale_quota(rule.max_requests, factor);
        let adjusted = Arc::new(adjusted);

        self.adjusted.insert(cache_key, adjusted.clone());

        adjusted
    }
}

fn scale_quota(max_requests: u64, factor: f64) -> u64 {
    ((max_requests as f64 * factor).floor() as u64).max(1)
}

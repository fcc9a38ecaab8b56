use std::path::Path;

use anyhow::bail;

use crate::{Config, EndpointRuleConfig, RateLimitConfig, rate_limit::DEFAULT_RULE_NAME};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;

    let warnings = validate_rate_limits(&config.server.rate_limits)?;

    for warning in warnings {
        log::warn!("{warning}");
    }

    Ok(config)
}

/// Validates the admission configuration.
///
/// Invalid quota scaling is fatal; everything else the registry can
/// resolve at request time, so it only produces warnings here. A
/// registry miss must never block traffic.
pub(crate) fn validate_rate_limits(config: &RateLimitConfig) -> anyhow::Result<Vec<String>> {
    let mut warnings = Vec::new();

    for (role, factor) in &config.roles {
        if *factor <= 0.0 || !factor.is_finite() {
            bail!("Role '{role}' has multiplier {factor}, multipliers must be positive");
        }
    }

    if !config.rules.is_empty() && !config.rules.contains_key(DEFAULT_RULE_NAME) {
        warnings.push(format!(
            "No '{DEFAULT_RULE_NAME}' rule defined, unmatched endpoints will use the built-in default quota"
        ));
    }

    for endpoint in &config.endpoints {
        if !config.rules.contains_key(endpoint.rule()) {
            warnings.push(format!(
                "Endpoint entry references unknown rule '{}', requests will fall back to the default rule",
                endpoint.rule()
            ));
        }
    }

    // Prefix entries resolve in declaration order, so an earlier prefix
    // that covers a later one makes the later entry unreachable.
    for (i, earlier) in config.endpoints.iter().enumerate() {
        let EndpointRuleConfig::Prefix { prefix: earlier_prefix, .. } = earlier else {
            continue;
        };

        for later in &config.endpoints[i + 1..] {
            let EndpointRuleConfig::Prefix { prefix: later_prefix, rule } = later else {
                continue;
            };

            if later_prefix.starts_with(earlier_prefix.as_str()) {
                warnings.push(format!(
                    "Prefix '{later_prefix}' (rule '{rule}') is shadowed by earlier prefix '{earlier_prefix}', declare more specific prefixes first"
                ));
            }
        }
    }

    for (i, earlier) in config.endpoints.iter().enumerate() {
        let EndpointRuleConfig::Exact { path: earlier_path, .. } = earlier else {
            continue;
        };

        for later in &config.endpoints[i + 1..] {
            if let EndpointRuleConfig::Exact { path, rule } = later
                && path == earlier_path
            {
                warnings.push(format!(
                    "Duplicate exact path '{path}' (rule '{rule}'), the first declaration wins"
                ));
            }
        }
    }

    Ok(warnings)
}

//! Rate limit rules and request-to-rule matching.
//!
//! Rules are evaluated top to bottom in the order they were declared. A rule
//! applies when its endpoint prefixes (if any) match the request path and its
//! HTTP methods (if any) contain the request method. The first applicable
//! rule wins; otherwise the configured default rule is used.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_format;
use crate::error::{RateLimitError, Result};

/// Rule configuration as it appears in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length
    #[serde(with = "duration_format")]
    pub period: Duration,
    /// Path prefixes this rule is scoped to (empty means every path)
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// HTTP methods this rule is scoped to (empty means every method)
    #[serde(default, alias = "httpMethods")]
    pub http_methods: Vec<String>,
}

impl RuleConfig {
    pub fn new(limit: u64, period: Duration) -> Self {
        Self {
            limit,
            period,
            endpoints: Vec::new(),
            http_methods: Vec::new(),
        }
    }

    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.http_methods = methods.into_iter().map(Into::into).collect();
        self
    }

    /// Reject rules that could never admit a request.
    pub fn validate(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(RateLimitError::Config("rule name must not be empty".to_string()));
        }
        if self.limit == 0 {
            return Err(RateLimitError::Config(format!(
                "rule '{}': limit must be greater than 0",
                name
            )));
        }
        if self.period.is_zero() {
            return Err(RateLimitError::Config(format!(
                "rule '{}': period must be greater than 0",
                name
            )));
        }
        Ok(())
    }
}

/// A named, immutable rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitRule {
    pub name: String,
    pub limit: u64,
    #[serde(with = "duration_format")]
    pub period: Duration,
    pub endpoints: Vec<String>,
    pub http_methods: Vec<String>,
}

impl RateLimitRule {
    /// Build a validated rule from its configuration.
    pub fn new(name: impl Into<String>, config: RuleConfig) -> Result<Self> {
        let name = name.into();
        config.validate(&name)?;
        Ok(Self {
            name,
            limit: config.limit,
            period: config.period,
            endpoints: config.endpoints,
            http_methods: config.http_methods,
        })
    }

    /// Whether this rule governs the given request.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        let endpoint_matches = self.endpoints.is_empty()
            || self
                .endpoints
                .iter()
                .any(|prefix| starts_with_ignore_case(path, prefix));

        let method_matches = self.http_methods.is_empty()
            || self
                .http_methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method));

        endpoint_matches && method_matches
    }
}

fn starts_with_ignore_case(path: &str, prefix: &str) -> bool {
    path.as_bytes()
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix.as_bytes()))
}

/// The ordered set of active rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<RateLimitRule>,
    default_rule: String,
}

impl RuleSet {
    /// Build a rule set from configured rules, keeping declaration order.
    pub fn from_config(rules: &IndexMap<String, RuleConfig>, default_rule: &str) -> Result<Self> {
        let rules = rules
            .iter()
            .map(|(name, config)| RateLimitRule::new(name.clone(), config.clone()))
            .collect::<Result<Vec<_>>>()?;

        if rules.is_empty() {
            return Err(RateLimitError::Config(
                "at least one rate limit rule must be configured".to_string(),
            ));
        }

        if !rules.iter().any(|r| r.name == default_rule) {
            return Err(RateLimitError::Config(format!(
                "default rule '{}' is not defined",
                default_rule
            )));
        }

        Ok(Self {
            rules,
            default_rule: default_rule.to_string(),
        })
    }

    /// Name of the rule that governs the given request.
    pub fn resolve_name(&self, path: &str, method: &str) -> &str {
        self.rules
            .iter()
            .find(|rule| rule.matches(path, method))
            .map(|rule| rule.name.as_str())
            .unwrap_or(&self.default_rule)
    }

    /// The rule that governs the given request.
    pub fn resolve(&self, path: &str, method: &str) -> Result<&RateLimitRule> {
        let name = self.resolve_name(path, method);
        self.get(name)
            .ok_or_else(|| RateLimitError::UnknownRule(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&RateLimitRule> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    /// Replace the rule with the same name, or append a new one.
    ///
    /// A replaced rule keeps its position, so precedence is unchanged.
    pub fn upsert(&mut self, rule: RateLimitRule) {
        match self.rules.iter_mut().find(|r| r.name == rule.name) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }

    pub fn default_rule(&self) -> &str {
        &self.default_rule
    }

    pub fn iter(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

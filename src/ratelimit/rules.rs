//! Rate limit rules configuration and validation.
//!
//! A [`RuleSet`] is the immutable, ordered list of rules every request must
//! satisfy. Order matters: the first failing rule is the one that arms its
//! cooldown and is reported as the rejection reason.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::error::{ConfigError, Result};

/// A single sliding-window rule.
///
/// Times are abstract integer units supplied by the caller with each request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    /// Length of the sliding window
    pub window: u64,
    /// Maximum number of admitted requests retained within the window
    pub burst_capacity: u64,
    /// Lockout armed when this rule is violated
    pub cooldown: Option<u64>,
    /// Optional name/description for this rule
    pub name: Option<String>,
}

impl Rule {
    /// Create a rule without a cooldown.
    pub fn new(window: u64, burst_capacity: u64) -> Self {
        Self {
            window,
            burst_capacity,
            cooldown: None,
            name: None,
        }
    }

    /// Set the cooldown armed on violation.
    pub fn with_cooldown(mut self, cooldown: u64) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Set a human readable name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Label used in logs: the name if set, otherwise the window size.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("window={}", self.window),
        }
    }
}

/// Named window lengths. These assume timestamps are expressed in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Length of this unit in seconds.
    pub fn as_secs(&self) -> u64 {
        match self {
            TimeUnit::Second => 1,
            TimeUnit::Minute => 60,
            TimeUnit::Hour => 3600,
            TimeUnit::Day => 86400,
        }
    }
}

/// A window length as written in configuration: either a raw number of
/// time units or a named unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowSpec {
    Units(u64),
    Named(TimeUnit),
}

impl WindowSpec {
    pub fn units(&self) -> u64 {
        match self {
            WindowSpec::Units(units) => *units,
            WindowSpec::Named(unit) => unit.as_secs(),
        }
    }
}

/// Configuration form of a rule.
///
/// `max_requests` is the steady rate; `burst_capacity` defaults to it when
/// absent. The burst capacity is what the limiter enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Window length
    pub window: WindowSpec,
    /// Number of requests allowed per window
    pub max_requests: u64,
    /// Number of requests retained before rejecting (defaults to `max_requests`)
    #[serde(default)]
    pub burst_capacity: Option<u64>,
    /// Lockout armed on violation
    #[serde(default)]
    pub cooldown: Option<u64>,
    /// Optional name/description for this rule
    #[serde(default)]
    pub name: Option<String>,
}

impl From<&RuleConfig> for Rule {
    fn from(config: &RuleConfig) -> Self {
        Rule {
            window: config.window.units(),
            burst_capacity: config.burst_capacity.unwrap_or(config.max_requests),
            cooldown: config.cooldown,
            name: config.name.clone(),
        }
    }
}

/// Top-level layout of a rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// The validated, ordered list of rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// Validate and build a rule set.
    ///
    /// An empty set is valid: a limiter built from it admits every request.
    pub fn new(rules: Vec<Rule>) -> std::result::Result<Self, ConfigError> {
        let mut seen: HashMap<u64, usize> = HashMap::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            if rule.window == 0 {
                return Err(ConfigError::ZeroWindow { index });
            }
            if rule.burst_capacity == 0 {
                return Err(ConfigError::ZeroBurst { index });
            }
            if rule.cooldown == Some(0) {
                return Err(ConfigError::ZeroCooldown { index });
            }
            if let Some(&first) = seen.get(&rule.window) {
                return Err(ConfigError::DuplicateWindow {
                    index,
                    first,
                    window: rule.window,
                });
            }
            seen.insert(rule.window, index);
        }

        Ok(Self { rules })
    }

    /// Build a rule set from configuration entries.
    pub fn from_configs(configs: &[RuleConfig]) -> std::result::Result<Self, ConfigError> {
        Self::new(configs.iter().map(Rule::from).collect())
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&contents)?)
    }

    /// Load rules from a YAML string.
    ///
    /// Accepts either a bare list of rules or a mapping with a `rules` key.
    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, ConfigError> {
        if let Ok(configs) = serde_yaml::from_str::<Vec<RuleConfig>>(yaml) {
            return Self::from_configs(&configs);
        }

        let file: RulesFile = serde_yaml::from_str(yaml)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_configs(&file.rules)
    }

    /// Iterate over the rules in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, Rule> {
        self.rules.iter()
    }

    /// Get the rule at a position.
    pub fn get(&self, index: usize) -> Option<&Rule> {
        self.rules.get(index)
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<'a> IntoIterator for &'a RuleSet {
    type Item = &'a Rule;
    type IntoIter = std::slice::Iter<'a, Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.rules.iter()
    }
}

//! Network-mock rules -- request interception consumed by the test runner.
//!
//! [`MockRegistry`] is built once from the `mocks` section and handed to
//! whoever needs it; the orchestrator serializes it into the runner's
//! environment so the suite can register the same interceptions under the
//! same aliases for later assertions.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// HTTP methods a rule may name. `*` matches any method.
const VALID_METHODS: [&str; 8] = [
    "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS", "*",
];

/// A single interception rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRule {
    /// Alias the rule is registered under
    pub id: String,
    /// HTTP method
    pub method: String,
    /// URL glob (`*` matches any run of characters)
    pub url: String,
    /// Canned response
    pub response: MockResponse,
}

/// Canned response of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponse {
    pub status_code: u16,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl MockRule {
    /// True if this rule intercepts `method url`.
    pub fn matches(&self, method: &str, url: &str) -> bool {
        (self.method == "*" || self.method.eq_ignore_ascii_case(method))
            && glob_match(&self.url, url)
    }
}

/// Validated set of rules, addressable by alias.
#[derive(Debug, Clone, Default)]
pub struct MockRegistry {
    rules: Vec<MockRule>,
    by_alias: HashMap<String, usize>,
}

impl MockRegistry {
    /// Builds the registry, rejecting duplicate aliases and malformed rules.
    pub fn new(rules: Vec<MockRule>) -> Result<Self, ConfigError> {
        let mut by_alias = HashMap::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            validate_rule(rule)?;
            if by_alias.insert(rule.id.clone(), index).is_some() {
                return Err(ConfigError::InvalidValue {
                    field: "mocks.id".to_owned(),
                    reason: format!("duplicate mock alias '{}'", rule.id),
                });
            }
        }
        Ok(Self { rules, by_alias })
    }

    /// Looks a rule up by its alias.
    pub fn get(&self, alias: &str) -> Option<&MockRule> {
        self.by_alias.get(alias).map(|&i| &self.rules[i])
    }

    /// First rule (in configuration order) that intercepts the request.
    pub fn find(&self, method: &str, url: &str) -> Option<&MockRule> {
        self.rules.iter().find(|r| r.matches(method, url))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MockRule> {
        self.rules.iter()
    }

    /// JSON array of all rules, in configuration order.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.rules)
    }
}

fn validate_rule(rule: &MockRule) -> Result<(), ConfigError> {
    if rule.id.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "mocks.id".to_owned(),
            reason: "must not be empty".to_owned(),
        });
    }
    let method = rule.method.to_ascii_uppercase();
    if !VALID_METHODS.contains(&method.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: format!("mocks[{}].method", rule.id),
            reason: format!("unknown HTTP method '{}'", rule.method),
        });
    }
    if rule.url.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: format!("mocks[{}].url", rule.id),
            reason: "must not be empty".to_owned(),
        });
    }
    if !(100..=599).contains(&rule.response.status_code) {
        return Err(ConfigError::InvalidValue {
            field: format!("mocks[{}].response.statusCode", rule.id),
            reason: format!("{} is not a valid HTTP status", rule.response.status_code),
        });
    }
    Ok(())
}

/// Glob match where `*` (and `**`) match any run of characters.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    // Position after the last `*` seen, and the text index it was tried at.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            while pi < p.len() && p[pi] == b'*' {
                pi += 1;
            }
            star = Some((pi, ti));
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi;
            ti = star_ti + 1;
            star = Some((star_pi, ti));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}

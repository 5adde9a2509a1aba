#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;

use agent_audit_domain::{PolicyAction, PolicyDecision, PolicyRule, ScoreSnapshot};
use anyhow::{anyhow, Result};
use serde::Deserialize;

pub const NO_MATCHING_RULE_REASON: &str = "No matching rule";

/// Evaluate one score snapshot against an ordered rule list.
///
/// Rule order is authoritative: the first rule whose `threshold <= score`
/// wins, not the highest or lowest matching threshold. Callers that want
/// "most severe applicable rule wins" must order rules by descending
/// threshold themselves. Absence of rules, or no matching rule, degrades to
/// `allow`; evaluation never fails.
#[must_use]
pub fn evaluate(snapshot: &ScoreSnapshot, rules: &[PolicyRule]) -> PolicyDecision {
    let matching = rules
        .iter()
        .find(|rule| snapshot.score >= rule.threshold);

    match matching {
        Some(rule) => PolicyDecision {
            action: rule.action,
            reason: format!("Score {} met threshold {}", snapshot.score, rule.threshold),
        },
        None => PolicyDecision {
            action: PolicyAction::Allow,
            reason: NO_MATCHING_RULE_REASON.to_string(),
        },
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RulesetConfig {
    rules: Vec<RuleConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleConfig {
    threshold: i64,
    action: String,
}

/// Load an ordered rule list from an operator-supplied YAML file.
///
/// # Errors
/// Returns an error when the file cannot be read or parsed, a threshold
/// falls outside `[0, 100]`, or an action name is unknown.
pub fn load_rules_from_path(path: &Path) -> Result<Vec<PolicyRule>> {
    let content = fs::read_to_string(path)?;
    parse_rules_yaml(&content)
}

/// Parse and validate rule YAML of the form
/// `rules: [{threshold: 90, action: hold}, ...]`, preserving list order.
///
/// # Errors
/// Returns an error on malformed YAML, out-of-range thresholds, or unknown
/// actions.
pub fn parse_rules_yaml(yaml: &str) -> Result<Vec<PolicyRule>> {
    let config: RulesetConfig = serde_yaml::from_str(yaml)
        .map_err(|err| anyhow!("invalid policy ruleset YAML structure: {err}"))?;

    config
        .rules
        .into_iter()
        .map(|rule| {
            let threshold = u8::try_from(rule.threshold)
                .ok()
                .filter(|value| *value <= 100)
                .ok_or_else(|| {
                    anyhow!("rule threshold {} outside [0, 100]", rule.threshold)
                })?;
            let action = PolicyAction::parse(&rule.action).ok_or_else(|| {
                anyhow!(
                    "unknown policy action '{}'; use allow, review, hold, or step_up",
                    rule.action
                )
            })?;
            Ok(PolicyRule { threshold, action })
        })
        .collect()
}

//! Rule configuration and the result shapes the engine filters.

use serde::{Deserialize, Deserializer, Serialize};

/// Issue severity, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// Informational finding.
    Info,
    /// Minor issue.
    Minor,
    /// Major issue.
    Major,
    /// Critical issue.
    Critical,
    /// Blocker — must be fixed before release.
    Blocker,
}

/// A single permission rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionRule {
    /// Groups this rule applies to. Absent = applies to every caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,

    /// Regex patterns for allowed project keys. An empty list matches nothing;
    /// a pattern that fails to compile also matches nothing (never errors).
    pub allowed_projects: Vec<String>,

    /// Tools the rule allows.
    pub allowed_tools: Vec<String>,

    /// Tools the rule denies. Deny wins over allow.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_tools: Option<Vec<String>>,

    /// Reject mutating tools when set.
    pub read_only: bool,

    /// Issues above this severity are filtered out of results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_severity: Option<Severity>,

    /// Issue statuses the caller may see. Absent = all statuses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_statuses: Option<Vec<String>>,

    /// Redact sensitive fields (author, assignee) from results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hide_sensitive_data: Option<bool>,

    /// Rules with higher priority are consulted first. Missing = 0.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl PermissionRule {
    /// Effective priority (missing = 0).
    #[must_use]
    pub fn priority(&self) -> i64 {
        self.priority.unwrap_or(0)
    }

    /// Whether this rule applies to a caller with the given groups.
    ///
    /// A rule with no group filter applies to everyone.
    #[must_use]
    pub fn applies_to(&self, caller_groups: &[String]) -> bool {
        match &self.groups {
            None => true,
            Some(filter) => filter.iter().any(|g| caller_groups.contains(g)),
        }
    }
}

/// Prioritized rule list plus an optional fallback.
///
/// Absence of both rules and default means **fail closed**: deny everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Ordered rule list (higher `priority` wins; config order breaks ties).
    pub rules: Vec<PermissionRule>,
    /// Fallback applied when no rule's group filter matches the caller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_rule: Option<PermissionRule>,
}

/// Project summary as returned by the inspection API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Unique project key.
    pub key: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Issue summary as returned by the inspection API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    /// Unique issue key.
    pub key: String,
    /// Owning project key.
    pub project: String,
    /// Severity, when the upstream reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    /// Workflow status (`OPEN`, `CONFIRMED`, `RESOLVED`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Reference to a project inside a hotspot payload.
///
/// Upstream responses are inconsistent: `"project"` arrives either as a bare
/// key string or as a nested object carrying a `key` field. Both forms are
/// accepted; anything else normalizes to "no project" at the deserialization
/// boundary so the filtering logic only ever sees one shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProjectRef {
    /// Bare project key: `"project": "my-project"`.
    Key(String),
    /// Nested object: `"project": {"key": "my-project", ...}`.
    Object {
        /// The project key inside the nested object.
        key: String,
    },
}

impl ProjectRef {
    /// The project key, regardless of wire shape.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Key(k) | Self::Object { key: k } => k,
        }
    }
}

/// Security hotspot summary as returned by the inspection API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hotspot {
    /// Unique hotspot key.
    pub key: String,
    /// Owning project, when the payload carried a usable reference.
    /// `None` for absent/null/malformed project fields.
    #[serde(default, deserialize_with = "lenient_project_ref")]
    pub project: Option<ProjectRef>,
    /// Hotspot status (`TO_REVIEW`, `REVIEWED`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Deserialize a hotspot's `project` field, tolerating malformed shapes.
///
/// Strings and objects with a string `key` yield `Some`; null, numbers,
/// arrays, and objects without a usable `key` yield `None` rather than a
/// deserialization error — malformed entries are dropped by the filter, not
/// propagated as failures.
fn lenient_project_ref<'de, D>(deserializer: D) -> Result<Option<ProjectRef>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(key) => Some(ProjectRef::Key(key)),
        serde_json::Value::Object(map) => map
            .get("key")
            .and_then(serde_json::Value::as_str)
            .map(|key| ProjectRef::Object {
                key: key.to_string(),
            }),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Severity ordering ─────────────────────────────────────────────────

    #[test]
    fn severity_orders_from_info_to_blocker() {
        assert!(Severity::Info < Severity::Minor);
        assert!(Severity::Minor < Severity::Major);
        assert!(Severity::Major < Severity::Critical);
        assert!(Severity::Critical < Severity::Blocker);
    }

    #[test]
    fn severity_deserializes_uppercase_wire_form() {
        let sev: Severity = serde_json::from_str("\"BLOCKER\"").unwrap();
        assert_eq!(sev, Severity::Blocker);
    }

    // ── PermissionRule::applies_to ────────────────────────────────────────

    #[test]
    fn rule_without_group_filter_applies_to_everyone() {
        let rule = PermissionRule::default();
        assert!(rule.applies_to(&[]));
        assert!(rule.applies_to(&["any-group".to_string()]));
    }

    #[test]
    fn rule_with_group_filter_requires_membership() {
        let rule = PermissionRule {
            groups: Some(vec!["developers".to_string()]),
            ..Default::default()
        };
        assert!(rule.applies_to(&["developers".to_string(), "qa".to_string()]));
        assert!(!rule.applies_to(&["qa".to_string()]));
        assert!(!rule.applies_to(&[]));
    }

    // ── ProjectRef normalization ──────────────────────────────────────────

    #[test]
    fn hotspot_project_accepts_bare_string() {
        let hotspot: Hotspot =
            serde_json::from_str(r#"{"key": "h1", "project": "my-project"}"#).unwrap();
        assert_eq!(hotspot.project.as_ref().map(ProjectRef::key), Some("my-project"));
    }

    #[test]
    fn hotspot_project_accepts_nested_object() {
        let hotspot: Hotspot =
            serde_json::from_str(r#"{"key": "h1", "project": {"key": "my-project", "name": "My"}}"#)
                .unwrap();
        assert_eq!(hotspot.project.as_ref().map(ProjectRef::key), Some("my-project"));
    }

    #[test]
    fn hotspot_project_normalizes_malformed_shapes_to_none() {
        for payload in [
            r#"{"key": "h1"}"#,
            r#"{"key": "h1", "project": null}"#,
            r#"{"key": "h1", "project": 42}"#,
            r#"{"key": "h1", "project": ["a"]}"#,
            r#"{"key": "h1", "project": {"name": "no key"}}"#,
            r#"{"key": "h1", "project": {"key": 7}}"#,
        ] {
            let hotspot: Hotspot = serde_json::from_str(payload).unwrap();
            assert!(hotspot.project.is_none(), "payload: {payload}");
        }
    }

    // ── PermissionsConfig deserialization ─────────────────────────────────

    #[test]
    fn permissions_config_deserializes_rules_and_default() {
        let json = r#"{
            "rules": [
                {
                    "groups": ["developers"],
                    "allowed_projects": ["dev-.*"],
                    "allowed_tools": ["list_issues"],
                    "max_severity": "MAJOR",
                    "priority": 10
                }
            ],
            "default_rule": {
                "allowed_projects": ["public-.*"],
                "allowed_tools": ["list_projects"],
                "read_only": true
            }
        }"#;
        let config: PermissionsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].priority(), 10);
        assert_eq!(config.rules[0].max_severity, Some(Severity::Major));
        let default = config.default_rule.unwrap();
        assert!(default.read_only);
        assert!(default.groups.is_none());
    }
}

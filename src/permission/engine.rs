//! Rule evaluation, project-key matching, and result filtering.

use regex::Regex;
use tracing::{debug, warn};

use crate::context::IdentityContext;
use crate::{Error, Result};

use super::model::{Hotspot, Issue, PermissionRule, PermissionsConfig, Project, ProjectRef};

/// Parameter names scanned by [`PermissionEngine::check_project_access_for_params`].
///
/// `project_key` and entries of `projects` are bare project keys;
/// `component`, `components`, and `component_keys` carry compound keys of the
/// form `project:path/to/resource`.
const PARAM_PROJECT_KEY: &str = "project_key";
const PARAM_PROJECTS: &str = "projects";
const PARAM_COMPONENT: &str = "component";
const PARAM_COMPONENTS: &str = "components";
const PARAM_COMPONENT_KEYS: &str = "component_keys";

/// Outcome of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessCheck {
    /// Whether access is granted.
    pub allowed: bool,
    /// Denial reason, for logging and error shaping.
    pub reason: Option<String>,
}

impl AccessCheck {
    /// An allowed decision.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    /// A denied decision with a reason.
    #[must_use]
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// A rule with its project patterns compiled once at engine construction.
///
/// Invalid patterns compile to `None` and match nothing — fail-safe, not
/// fail-open, and never an error at check time.
#[derive(Debug)]
struct CompiledRule {
    rule: PermissionRule,
    patterns: Vec<Option<Regex>>,
}

impl CompiledRule {
    fn compile(rule: PermissionRule) -> Self {
        let patterns = rule
            .allowed_projects
            .iter()
            .map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Invalid project pattern; treating as match-nothing");
                    None
                }
            })
            .collect();
        Self { rule, patterns }
    }

    /// True iff `project_key` matches any valid pattern.
    fn allows_project(&self, project_key: &str) -> bool {
        self.patterns
            .iter()
            .flatten()
            .any(|re| re.is_match(project_key))
    }
}

/// Extract the project key from a compound key of the form
/// `project:path/to/resource`.
///
/// Everything before the *first* colon is the project key. A key with no
/// colon is itself the project key. A key that *starts* with a colon is
/// returned unchanged — colon position 0 does not count as a separator.
#[must_use]
pub fn extract_project_key(compound: &str) -> &str {
    match compound.find(':') {
        None | Some(0) => compound,
        Some(idx) => &compound[..idx],
    }
}

/// The permission engine: a prioritized rule list plus an optional default.
///
/// Construct one per process and pass it down through the request context —
/// never a shared mutable global.
#[derive(Debug)]
pub struct PermissionEngine {
    /// Rules sorted by descending priority; configuration order breaks ties.
    rules: Vec<CompiledRule>,
    default_rule: Option<CompiledRule>,
}

impl PermissionEngine {
    /// Build the engine from configuration, compiling all project patterns.
    #[must_use]
    pub fn new(config: PermissionsConfig) -> Self {
        let mut rules: Vec<CompiledRule> =
            config.rules.into_iter().map(CompiledRule::compile).collect();
        // Stable sort: equal priorities keep their configuration order.
        rules.sort_by_key(|c| std::cmp::Reverse(c.rule.priority()));
        Self {
            rules,
            default_rule: config.default_rule.map(CompiledRule::compile),
        }
    }

    /// The highest-priority rule applying to the caller, falling back to the
    /// default rule. `None` means fail closed.
    fn rule_for(&self, identity: &IdentityContext) -> Option<&CompiledRule> {
        self.rules
            .iter()
            .find(|c| c.rule.applies_to(&identity.groups))
            .or(self.default_rule.as_ref())
    }

    /// The caller's effective rule, if any. Exposed for error shaping and for
    /// handlers that need the read-only / hide-sensitive flags.
    #[must_use]
    pub fn effective_rule(&self, identity: &IdentityContext) -> Option<&PermissionRule> {
        self.rule_for(identity).map(|c| &c.rule)
    }

    // ── tool access ───────────────────────────────────────────────────────

    /// Decide whether the caller may invoke `tool`.
    ///
    /// Deny always wins over allow within the matched rule. No matching rule
    /// and no default rule means deny.
    #[must_use]
    pub fn check_tool_access(&self, identity: &IdentityContext, tool: &str) -> AccessCheck {
        let Some(matched) = self.rule_for(identity) else {
            debug!(user = %identity.user_id, tool = %tool, "No permission rule matched; failing closed");
            return AccessCheck::deny("no permission rule applies to this caller");
        };

        if let Some(denied) = &matched.rule.denied_tools {
            if denied.iter().any(|t| t == tool) {
                return AccessCheck::deny(format!("tool '{tool}' is explicitly denied"));
            }
        }

        if matched.rule.allowed_tools.iter().any(|t| t == tool) {
            AccessCheck::allow()
        } else {
            AccessCheck::deny(format!(
                "tool '{tool}' is not allowed; available tools: {}",
                matched.rule.allowed_tools.join(", ")
            ))
        }
    }

    /// Authorize a tool invocation, shaping denials into stable errors.
    ///
    /// `mutating` marks tools that write; under a read-only rule these are
    /// rejected with [`Error::ReadOnlyViolation`] even when allowed by name.
    pub fn authorize_tool(
        &self,
        identity: &IdentityContext,
        tool: &str,
        mutating: bool,
    ) -> Result<()> {
        let check = self.check_tool_access(identity, tool);
        if !check.allowed {
            return Err(Error::ToolAccessDenied(format!(
                "{tool} ({})",
                check.reason.unwrap_or_default()
            )));
        }
        if mutating {
            if let Some(rule) = self.effective_rule(identity) {
                if rule.read_only {
                    return Err(Error::ReadOnlyViolation(format!(
                        "tool '{tool}' modifies data but your access is read-only"
                    )));
                }
            }
        }
        Ok(())
    }

    // ── project access ────────────────────────────────────────────────────

    /// Whether `project_key` matches any of the caller's allowed patterns.
    ///
    /// An empty pattern list matches nothing; so does an invalid pattern.
    #[must_use]
    pub fn check_project_access(&self, identity: &IdentityContext, project_key: &str) -> bool {
        self.rule_for(identity)
            .is_some_and(|rule| rule.allows_project(project_key))
    }

    /// Check every key in `project_keys`. An empty slice is vacuously allowed.
    #[must_use]
    pub fn check_multiple_project_access(
        &self,
        identity: &IdentityContext,
        project_keys: &[String],
    ) -> AccessCheck {
        for key in project_keys {
            if !self.check_project_access(identity, key) {
                return AccessCheck::deny(format!("project '{key}' is not accessible"));
            }
        }
        AccessCheck::allow()
    }

    /// Like [`check_multiple_project_access`](Self::check_multiple_project_access)
    /// but raising [`Error::ProjectAccessDenied`] on the first inaccessible
    /// key. Called with an empty slice it never errors.
    pub fn validate_project_access_or_throw(
        &self,
        identity: &IdentityContext,
        project_keys: &[String],
    ) -> Result<()> {
        for key in project_keys {
            if !self.check_project_access(identity, key) {
                return Err(Error::ProjectAccessDenied(key.clone()));
            }
        }
        Ok(())
    }

    /// Scan tool-call parameters for project references and require every
    /// referenced project to be accessible.
    ///
    /// Recognized parameters: `project_key` (bare key), `projects` (array of
    /// bare keys), `component` (compound key), `components` and
    /// `component_keys` (arrays of compound keys). Non-string array entries
    /// are silently ignored. When no recognized parameter is present the
    /// check allows — filtering only constrains when projects are actually
    /// named.
    #[must_use]
    pub fn check_project_access_for_params(
        &self,
        identity: &IdentityContext,
        params: &serde_json::Value,
    ) -> AccessCheck {
        let mut keys: Vec<String> = Vec::new();

        if let Some(key) = params.get(PARAM_PROJECT_KEY).and_then(|v| v.as_str()) {
            keys.push(key.to_string());
        }
        if let Some(projects) = params.get(PARAM_PROJECTS).and_then(|v| v.as_array()) {
            keys.extend(
                projects
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(ToString::to_string),
            );
        }
        if let Some(component) = params.get(PARAM_COMPONENT).and_then(|v| v.as_str()) {
            keys.push(extract_project_key(component).to_string());
        }
        for param in [PARAM_COMPONENTS, PARAM_COMPONENT_KEYS] {
            if let Some(components) = params.get(param).and_then(|v| v.as_array()) {
                keys.extend(
                    components
                        .iter()
                        .filter_map(|v| v.as_str())
                        .map(|c| extract_project_key(c).to_string()),
                );
            }
        }

        self.check_multiple_project_access(identity, &keys)
    }

    // ── result filtering ──────────────────────────────────────────────────

    /// Keep only projects the caller may access.
    #[must_use]
    pub fn filter_projects(
        &self,
        identity: &IdentityContext,
        projects: Vec<Project>,
    ) -> Vec<Project> {
        let before = projects.len();
        let kept: Vec<Project> = projects
            .into_iter()
            .filter(|p| self.check_project_access(identity, &p.key))
            .collect();
        if kept.len() < before {
            debug!(
                user = %identity.user_id,
                removed = before - kept.len(),
                "Filtered projects outside caller's access"
            );
        }
        kept
    }

    /// Keep only issues in accessible projects, honoring the rule's
    /// max-severity and allowed-statuses constraints when configured.
    #[must_use]
    pub fn filter_issues(&self, identity: &IdentityContext, issues: Vec<Issue>) -> Vec<Issue> {
        let Some(matched) = self.rule_for(identity) else {
            return Vec::new();
        };
        issues
            .into_iter()
            .filter(|issue| {
                if !matched.allows_project(&issue.project) {
                    return false;
                }
                if let (Some(max), Some(sev)) = (matched.rule.max_severity, issue.severity) {
                    if sev > max {
                        return false;
                    }
                }
                if let Some(statuses) = &matched.rule.allowed_statuses {
                    match &issue.status {
                        Some(status) if statuses.iter().any(|s| s == status) => {}
                        _ => return false,
                    }
                }
                true
            })
            .collect()
    }

    /// Keep only hotspots whose normalized project is accessible.
    ///
    /// Hotspots without a usable project reference are dropped, not errored —
    /// the lenient shape handling happened at deserialization.
    #[must_use]
    pub fn filter_hotspots(
        &self,
        identity: &IdentityContext,
        hotspots: Vec<Hotspot>,
    ) -> Vec<Hotspot> {
        hotspots
            .into_iter()
            .filter(|h| {
                h.project
                    .as_ref()
                    .map(ProjectRef::key)
                    .is_some_and(|key| self.check_project_access(identity, key))
            })
            .collect()
    }
}

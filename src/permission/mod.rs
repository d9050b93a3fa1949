//! Permission-rule evaluation for authenticated callers.
//!
//! Given the verified identity of a request, the engine decides three things:
//!
//! 1. **Tool access** — may this caller invoke this tool at all?
//! 2. **Project access** — may this caller touch this project (pattern match)?
//! 3. **Result filtering** — which entries of a result collection
//!    (projects, issues, hotspots) may this caller see?
//!
//! # Evaluation order
//!
//! Rules are consulted highest-priority first; the first rule whose group
//! filter matches the caller (or that has no filter) wins. Within that rule,
//! an explicit deny always beats an allow. A caller matched by no rule falls
//! back to the configured default rule; with no default the engine **fails
//! closed** and denies everything. These tie-breaks are exact behavioral
//! contracts — permission logic is a security boundary.

pub mod engine;
pub mod model;

pub use engine::{AccessCheck, PermissionEngine, extract_project_key};
pub use model::{
    Hotspot, Issue, PermissionRule, PermissionsConfig, Project, ProjectRef, Severity,
};

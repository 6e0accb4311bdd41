//! Static checks over a definition, run without invoking any handler.
//!
//! The checks mirror what would fail at run time:
//! - every kind must be registered unless the registry passes unknown kinds through,
//! - dependency names must be unique within a step,
//! - nesting must stay within the configured depth.

use std::{collections::HashSet, fmt};

use serde::Serialize;
use stepwise_types::Step;

use crate::{config::UnknownKindPolicy, registry::ResolverRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One finding, located by a path such as `definition[1].dependencies.items[0]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckIssue {
    pub severity: Severity,
    pub location: String,
    pub message: String,
}

impl fmt::Display for CheckIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{label}: {}: {}", self.location, self.message)
    }
}

/// Walk `definition` and its nested dependencies and collect findings.
pub fn check_definition(definition: &[Step], registry: &ResolverRegistry, max_depth: usize) -> Vec<CheckIssue> {
    let mut issues = Vec::new();
    check_steps(definition, "definition", 0, registry, max_depth, &mut issues);
    issues
}

/// `true` when none of the findings is an error.
pub fn is_clean(issues: &[CheckIssue]) -> bool {
    issues.iter().all(|issue| issue.severity != Severity::Error)
}

fn check_steps(
    steps: &[Step],
    prefix: &str,
    depth: usize,
    registry: &ResolverRegistry,
    max_depth: usize,
    issues: &mut Vec<CheckIssue>,
) {
    for (index, step) in steps.iter().enumerate() {
        let location = format!("{prefix}[{index}]");
        check_kind(step, &location, registry, issues);

        let mut seen = HashSet::new();
        for dependency in &step.dependencies {
            let dependency_location = format!("{location}.dependencies.{}", dependency.name);
            if dependency.name.trim().is_empty() {
                issues.push(CheckIssue {
                    severity: Severity::Error,
                    location: dependency_location.clone(),
                    message: "dependency name must not be empty".into(),
                });
            } else if !seen.insert(dependency.name.as_str()) {
                issues.push(CheckIssue {
                    severity: Severity::Warning,
                    location: dependency_location.clone(),
                    message: format!("dependency '{}' is declared more than once; the last result wins", dependency.name),
                });
            }

            if depth + 1 > max_depth {
                issues.push(CheckIssue {
                    severity: Severity::Error,
                    location: dependency_location,
                    message: format!("nesting exceeds the maximum depth of {max_depth}"),
                });
                continue;
            }
            check_steps(&dependency.sub_steps, &dependency_location, depth + 1, registry, max_depth, issues);
        }
    }
}

fn check_kind(step: &Step, location: &str, registry: &ResolverRegistry, issues: &mut Vec<CheckIssue>) {
    if step.kind.trim().is_empty() {
        issues.push(CheckIssue {
            severity: Severity::Error,
            location: location.to_string(),
            message: "step kind must not be empty".into(),
        });
        return;
    }
    if registry.contains(&step.kind) {
        return;
    }
    let severity = match registry.unknown_kind() {
        UnknownKindPolicy::Fail => Severity::Error,
        UnknownKindPolicy::Passthrough => Severity::Warning,
    };
    issues.push(CheckIssue {
        severity,
        location: location.to_string(),
        message: format!("no resolver registered for kind '{}'", step.kind),
    });
}

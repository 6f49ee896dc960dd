// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource reports: tallies of additions, changes and destructions parsed
//! from phase output.
//!
//! - Plan phase: the JSON rendering of the plan file (`terraform show -json`),
//!   counted from `resource_changes[].change.actions`.
//! - Apply phase: the summary line printed at the end of the apply log.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Counts of resource changes detected in a phase's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    /// Resources to be (or that were) created.
    pub additions: u32,
    /// Resources to be (or that were) updated in place.
    pub changes: u32,
    /// Resources to be (or that were) destroyed.
    pub destructions: u32,
}

impl ResourceReport {
    /// Build a report from explicit counts.
    pub fn new(additions: u32, changes: u32, destructions: u32) -> Self {
        Self {
            additions,
            changes,
            destructions,
        }
    }

    /// True if any resource is added, changed or destroyed.
    pub fn has_changes(&self) -> bool {
        self.additions > 0 || self.changes > 0 || self.destructions > 0
    }
}

/// Why phase output could not be turned into a report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// The plan JSON is malformed.
    #[error("invalid plan json: {0}")]
    Json(#[from] serde_json::Error),

    /// The apply log has no summary line.
    #[error("apply output has no summary line")]
    MissingSummary,

    /// A count in the summary line does not fit.
    #[error("invalid resource count '{0}'")]
    Count(String),
}

#[derive(Deserialize)]
struct PlanJson {
    #[serde(default)]
    resource_changes: Vec<ResourceChange>,
}

#[derive(Deserialize)]
struct ResourceChange {
    change: Change,
}

#[derive(Deserialize)]
struct Change {
    actions: Vec<String>,
}

/// Parse the JSON form of a plan file into a report.
///
/// A replacement (`["delete", "create"]` in either order) counts as one
/// addition and one destruction. `no-op` and `read` are ignored.
pub fn parse_plan_json(json: &[u8]) -> Result<ResourceReport, ReportError> {
    let plan: PlanJson = serde_json::from_slice(json)?;
    let mut report = ResourceReport::default();

    for resource in plan.resource_changes {
        for action in resource.change.actions.iter().map(String::as_str) {
            match action {
                "create" => report.additions += 1,
                "update" => report.changes += 1,
                "delete" => report.destructions += 1,
                _ => {}
            }
        }
    }

    Ok(report)
}

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("valid ansi regex"));

static APPLY_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"Apply complete! Resources: (?:\d+ imported, )?(\d+) added, (\d+) changed, (\d+) destroyed",
    )
    .expect("valid apply summary regex")
});

static DESTROY_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Destroy complete! Resources: (\d+) destroyed").expect("valid destroy regex")
});

fn count(capture: Option<regex::Match<'_>>) -> Result<u32, ReportError> {
    let text = capture.map(|m| m.as_str()).unwrap_or_default();
    text.parse()
        .map_err(|_| ReportError::Count(text.to_string()))
}

/// Scan apply output for the summary line and parse it into a report.
///
/// Colour escape codes are stripped before matching.
pub fn parse_apply_output(output: &[u8]) -> Result<ResourceReport, ReportError> {
    let text = String::from_utf8_lossy(output);
    let text = ANSI_ESCAPE.replace_all(&text, "");

    if let Some(caps) = APPLY_SUMMARY.captures(&text) {
        return Ok(ResourceReport {
            additions: count(caps.get(1))?,
            changes: count(caps.get(2))?,
            destructions: count(caps.get(3))?,
        });
    }

    if let Some(caps) = DESTROY_SUMMARY.captures(&text) {
        return Ok(ResourceReport {
            destructions: count(caps.get(1))?,
            ..ResourceReport::default()
        });
    }

    Err(ReportError::MissingSummary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plan_json_counts_actions() {
        let json = br#"{
            "format_version": "1.2",
            "resource_changes": [
                {"address": "a.one", "change": {"actions": ["create"]}},
                {"address": "a.two", "change": {"actions": ["create"]}},
                {"address": "b.one", "change": {"actions": ["update"]}},
                {"address": "c.one", "change": {"actions": ["delete", "create"]}},
                {"address": "d.one", "change": {"actions": ["no-op"]}},
                {"address": "e.one", "change": {"actions": ["read"]}}
            ]
        }"#;

        let report = parse_plan_json(json).unwrap();
        assert_eq!(report, ResourceReport::new(3, 1, 1));
        assert!(report.has_changes());
    }

    #[test]
    fn test_parse_plan_json_without_changes() {
        let report = parse_plan_json(br#"{"format_version": "1.2"}"#).unwrap();
        assert_eq!(report, ResourceReport::default());
        assert!(!report.has_changes());
    }

    #[test]
    fn test_parse_plan_json_rejects_garbage() {
        assert!(matches!(
            parse_plan_json(b"not json"),
            Err(ReportError::Json(_))
        ));
    }

    #[test]
    fn test_parse_apply_output() {
        let output = b"aws_instance.web: Creating...\n\
            aws_instance.web: Creation complete after 2s\n\
            \n\
            Apply complete! Resources: 2 added, 1 changed, 0 destroyed.\n";

        let report = parse_apply_output(output).unwrap();
        assert_eq!(report, ResourceReport::new(2, 1, 0));
    }

    #[test]
    fn test_parse_apply_output_with_colour_and_imports() {
        let output = "\x1b[0m\x1b[1m\x1b[32mApply complete! Resources: 1 imported, 0 added, 0 changed, 4 destroyed.\x1b[0m";

        let report = parse_apply_output(output.as_bytes()).unwrap();
        assert_eq!(report, ResourceReport::new(0, 0, 4));
    }

    #[test]
    fn test_parse_destroy_output() {
        let report = parse_apply_output(b"Destroy complete! Resources: 3 destroyed.").unwrap();
        assert_eq!(report, ResourceReport::new(0, 0, 3));
    }

    #[test]
    fn test_parse_apply_output_missing_summary() {
        assert!(matches!(
            parse_apply_output(b"Error: something went wrong"),
            Err(ReportError::MissingSummary)
        ));
    }
}

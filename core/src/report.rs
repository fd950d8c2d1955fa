//! Scenario verdicts and suite reports.

use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::driver::OperationResult;
use crate::error::{Error, ErrorClass, Result};
use crate::orchestrator::Phase;
use crate::scenario::Scenario;
use crate::transport::TransportKind;
use crate::verifier::{Divergence, IntegrityReport};

/// Final outcome of one scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed { class: ErrorClass, reason: String },
    Skipped { reason: String },
}

impl Verdict {
    /// Failure verdict for an error.
    pub fn from_error(error: &Error) -> Self {
        if error.is_skip() {
            let reason = match error {
                Error::Skipped(reason) => reason.clone(),
                other => other.to_string(),
            };
            return Verdict::Skipped { reason };
        }
        Verdict::Failed {
            class: error.class(),
            reason: error.to_string(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, Verdict::Passed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Verdict::Failed { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Verdict::Skipped { .. })
    }

    /// Short label for tables.
    pub fn label(&self) -> &'static str {
        match self {
            Verdict::Passed => "PASS",
            Verdict::Failed { .. } => "FAIL",
            Verdict::Skipped { .. } => "SKIP",
        }
    }
}

/// Verdict plus diagnostics for one scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub name: String,
    pub tags: Vec<String>,
    pub transport: TransportKind,
    pub action: String,
    pub fault: Option<String>,
    pub verdict: Verdict,
    /// Phases entered, in order.
    pub phases: Vec<Phase>,
    /// Class of the error the driven operation (or setup) produced, if any.
    pub observed: Option<ErrorClass>,
    pub divergence: Option<Divergence>,
    pub integrity: Option<IntegrityReport>,
    /// Every client invocation, with argv, status and captured streams.
    pub diagnostics: Vec<OperationResult>,
    pub duration: Duration,
}

impl ScenarioReport {
    /// Creates a report for `scenario` with the given verdict and nothing else.
    pub fn new(scenario: &Scenario, verdict: Verdict) -> Self {
        Self {
            name: scenario.name.clone(),
            tags: scenario.effective_tags(),
            transport: scenario.transport,
            action: scenario.action.name().to_string(),
            fault: scenario.fault.as_ref().map(|f| f.name().to_string()),
            verdict,
            phases: Vec::new(),
            observed: None,
            divergence: None,
            integrity: None,
            diagnostics: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Report for a scenario whose task panicked.
    pub fn panicked(scenario: &Scenario, message: impl Into<String>) -> Self {
        Self::new(
            scenario,
            Verdict::Failed {
                class: ErrorClass::Infrastructure,
                reason: format!("scenario panicked: {}", message.into()),
            },
        )
    }

    fn detail(&self) -> String {
        match &self.verdict {
            Verdict::Passed => String::new(),
            Verdict::Failed { class, reason } => format!("{}: {}", class.label(), reason),
            Verdict::Skipped { reason } => reason.clone(),
        }
    }
}

/// Counts per verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Reports for a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub generated_at: DateTime<Utc>,
    pub summary: Summary,
    pub scenarios: Vec<ScenarioReport>,
}

impl SuiteReport {
    /// Creates a report from scenario reports, in the given order.
    pub fn new(scenarios: Vec<ScenarioReport>) -> Self {
        let mut summary = Summary {
            total: scenarios.len(),
            ..Summary::default()
        };
        for report in &scenarios {
            match report.verdict {
                Verdict::Passed => summary.passed += 1,
                Verdict::Failed { .. } => summary.failed += 1,
                Verdict::Skipped { .. } => summary.skipped += 1,
            }
        }
        Self {
            generated_at: Utc::now(),
            summary,
            scenarios,
        }
    }

    /// Returns true if no scenario failed.
    pub fn all_passed(&self) -> bool {
        self.summary.failed == 0
    }

    /// Returns the report for `name`.
    pub fn get(&self, name: &str) -> Option<&ScenarioReport> {
        self.scenarios.iter().find(|r| r.name == name)
    }

    /// Serializes the report as pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("failed to serialize report: {}", e)))
    }

    /// Writes the JSON report to `path`.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_json()?)?;
        Ok(())
    }

    /// Renders a markdown table for CI summaries.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("| Scenario | Transport | Action | Verdict | Duration | Detail |\n");
        out.push_str("|---|---|---|---|---|---|\n");
        for report in &self.scenarios {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} ms | {} |",
                escape_cell(&report.name),
                report.transport,
                report.action,
                report.verdict.label(),
                report.duration.as_millis(),
                escape_cell(&report.detail())
            );
        }
        let _ = writeln!(
            out,
            "\n**{} passed, {} failed, {} skipped** ({} total)",
            self.summary.passed, self.summary.failed, self.summary.skipped, self.summary.total
        );
        out
    }
}

fn escape_cell(text: &str) -> String {
    let single_line = text.lines().next().unwrap_or_default();
    single_line.replace('|', "\\|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Action;

    fn report(name: &str, verdict: Verdict) -> ScenarioReport {
        let scenario = Scenario::new(name, TransportKind::File, Action::default());
        ScenarioReport::new(&scenario, verdict)
    }

    #[test]
    fn summary_counts_verdicts() {
        let suite = SuiteReport::new(vec![
            report("a", Verdict::Passed),
            report(
                "b",
                Verdict::Failed {
                    class: ErrorClass::Client,
                    reason: "exit 128".into(),
                },
            ),
            report("c", Verdict::Skipped { reason: "no ssh".into() }),
        ]);

        assert_eq!(
            suite.summary,
            Summary {
                total: 3,
                passed: 1,
                failed: 1,
                skipped: 1
            }
        );
        assert!(!suite.all_passed());
        assert!(suite.get("c").unwrap().verdict.is_skipped());
    }

    #[test]
    fn skipped_error_becomes_skip_verdict() {
        let verdict = Verdict::from_error(&Error::Skipped("no SSH endpoint configured".into()));
        assert_eq!(
            verdict,
            Verdict::Skipped {
                reason: "no SSH endpoint configured".into()
            }
        );
    }

    #[test]
    fn json_export_tags_verdicts() {
        let suite = SuiteReport::new(vec![report("a", Verdict::Passed)]);
        let json = suite.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["scenarios"][0]["verdict"]["verdict"], "passed");
        assert_eq!(value["summary"]["passed"], 1);
    }

    #[test]
    fn markdown_escapes_pipes_and_newlines() {
        let suite = SuiteReport::new(vec![report(
            "a|b",
            Verdict::Failed {
                class: ErrorClass::Divergence,
                reason: "references [x]\nmore".into(),
            },
        )]);
        let markdown = suite.to_markdown();

        assert!(markdown.contains("| a\\|b | file | clone | FAIL |"));
        assert!(markdown.contains("divergence: references [x] |"));
        assert!(!markdown.contains("more"));
        assert!(markdown.contains("**0 passed, 1 failed, 0 skipped** (1 total)"));
    }
}

//! Collaborators invoked by lifecycle hooks.
//!
//! The engine never talks to git, CI, or a review system directly. It calls
//! these traits, which the binary wires to real (or logging-only)
//! implementations and tests wire to fakes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Feature, LifecycleEvent};

/// Result of an automated test run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestOutcome {
    pub passed: bool,
    /// Line coverage in percent, when the runner reports it.
    pub coverage: Option<f64>,
}

/// Result of the static checks run when implementation starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckReport {
    pub passed: bool,
    pub findings: Vec<String>,
}

/// Result of the quality gates run on a review request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateReport {
    pub passed: bool,
    pub details: Vec<String>,
}

/// Something worth telling stakeholders about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Notification {
    Blocked { feature_id: String, reason: String },
    Escalation { feature_id: String, blocked_for_hours: i64 },
    Transition(LifecycleEvent),
}

#[async_trait]
pub trait VersionControl: Send + Sync {
    async fn create_branch(&self, feature: &Feature, branch: &str) -> anyhow::Result<()>;
    async fn provision_environment(&self, feature: &Feature, branch: &str) -> anyhow::Result<()>;
    async fn merge(&self, feature: &Feature, branch: &str) -> anyhow::Result<()>;
    async fn update_docs(&self, feature: &Feature) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_checks(&self, feature: &Feature) -> anyhow::Result<CheckReport>;
    /// Run the automated test suite. Implementations should honour `timeout`;
    /// the engine enforces it regardless.
    async fn run(&self, feature: &Feature, timeout: Duration) -> anyhow::Result<TestOutcome>;
}

#[async_trait]
pub trait ReviewSystem: Send + Sync {
    /// Open a pull/merge request and return its URL.
    async fn open_request(&self, feature: &Feature, branch: &str) -> anyhow::Result<String>;
    async fn run_gates(&self, feature: &Feature) -> anyhow::Result<GateReport>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// The full set of collaborators the lifecycle engine calls into.
#[derive(Clone)]
pub struct Collaborators {
    pub version_control: Arc<dyn VersionControl>,
    pub test_runner: Arc<dyn TestRunner>,
    pub review: Arc<dyn ReviewSystem>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Collaborators that only log what they would do. Tests always pass
    /// unless a test command is configured, in which case it is run.
    pub fn local(test_command: Option<String>) -> Self {
        let test_runner: Arc<dyn TestRunner> = match test_command {
            Some(command) => Arc::new(ShellTestRunner::new(command)),
            None => Arc::new(LoggingCollaborator),
        };
        Self {
            version_control: Arc::new(LoggingCollaborator),
            test_runner,
            review: Arc::new(LoggingCollaborator),
            notifier: Arc::new(TracingNotifier),
        }
    }
}

/// Records intended side effects in the log and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCollaborator;

#[async_trait]
impl VersionControl for LoggingCollaborator {
    async fn create_branch(&self, feature: &Feature, branch: &str) -> anyhow::Result<()> {
        tracing::info!(feature_id = %feature.id, branch, "create branch");
        Ok(())
    }

    async fn provision_environment(&self, feature: &Feature, branch: &str) -> anyhow::Result<()> {
        tracing::info!(feature_id = %feature.id, branch, "provision environment");
        Ok(())
    }

    async fn merge(&self, feature: &Feature, branch: &str) -> anyhow::Result<()> {
        tracing::info!(feature_id = %feature.id, branch, "merge branch");
        Ok(())
    }

    async fn update_docs(&self, feature: &Feature) -> anyhow::Result<()> {
        tracing::info!(feature_id = %feature.id, "update docs");
        Ok(())
    }
}

#[async_trait]
impl TestRunner for LoggingCollaborator {
    async fn run_checks(&self, feature: &Feature) -> anyhow::Result<CheckReport> {
        tracing::info!(feature_id = %feature.id, "static checks skipped");
        Ok(CheckReport {
            passed: true,
            findings: Vec::new(),
        })
    }

    async fn run(&self, feature: &Feature, _timeout: Duration) -> anyhow::Result<TestOutcome> {
        tracing::warn!(feature_id = %feature.id, "no test command configured, assuming green");
        Ok(TestOutcome {
            passed: true,
            coverage: None,
        })
    }
}

#[async_trait]
impl ReviewSystem for LoggingCollaborator {
    async fn open_request(&self, feature: &Feature, branch: &str) -> anyhow::Result<String> {
        tracing::info!(feature_id = %feature.id, branch, "open review request");
        Ok(format!("local://review/{}", feature.id))
    }

    async fn run_gates(&self, feature: &Feature) -> anyhow::Result<GateReport> {
        tracing::info!(feature_id = %feature.id, "quality gates skipped");
        Ok(GateReport {
            passed: true,
            details: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()> {
        match notification {
            Notification::Blocked { feature_id, reason } => {
                tracing::warn!(feature_id = %feature_id, reason = %reason, "feature blocked");
            }
            Notification::Escalation {
                feature_id,
                blocked_for_hours,
            } => {
                tracing::warn!(
                    feature_id = %feature_id,
                    blocked_for_hours,
                    "blocked feature needs escalation"
                );
            }
            Notification::Transition(event) => {
                tracing::info!(
                    feature_id = %event.feature_id,
                    action = %event.action,
                    outcome = %event.outcome,
                    "lifecycle transition"
                );
            }
        }
        Ok(())
    }
}

/// Runs a shell command as the test suite: exit status is pass/fail, and a
/// line such as `coverage: 87.5%` in the output is picked up as coverage.
#[derive(Debug, Clone)]
pub struct ShellTestRunner {
    command: String,
}

impl ShellTestRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl TestRunner for ShellTestRunner {
    async fn run_checks(&self, feature: &Feature) -> anyhow::Result<CheckReport> {
        tracing::debug!(feature_id = %feature.id, "no static check command configured");
        Ok(CheckReport {
            passed: true,
            findings: Vec::new(),
        })
    }

    async fn run(&self, feature: &Feature, timeout: Duration) -> anyhow::Result<TestOutcome> {
        tracing::info!(feature_id = %feature.id, command = %self.command, "running tests");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("EPICFLOW_FEATURE_ID", &feature.id)
            .env("EPICFLOW_BRANCH", feature.branch_name())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(result) => result.with_context(|| format!("failed to run '{}'", self.command))?,
            Err(_) => bail!("test command exceeded {}s", timeout.as_secs()),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let coverage = parse_coverage(&stdout).or_else(|| parse_coverage(&stderr));

        Ok(TestOutcome {
            passed: output.status.success(),
            coverage,
        })
    }
}

/// Last percentage on a line mentioning coverage, e.g. `TOTAL coverage: 81.3%`.
pub fn parse_coverage(output: &str) -> Option<f64> {
    output
        .lines()
        .filter(|line| line.to_lowercase().contains("coverage"))
        .filter_map(|line| {
            line.split_whitespace()
                .filter_map(|token| token.trim_end_matches([',', ';']).strip_suffix('%'))
                .filter_map(|number| number.parse::<f64>().ok())
                .last()
        })
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coverage_percentage() {
        let output = "running 12 tests\ntest result: ok\nTOTAL coverage: 81.5%\n";
        assert_eq!(parse_coverage(output), Some(81.5));
    }

    #[test]
    fn ignores_percentages_on_unrelated_lines() {
        let output = "progress 50%\ndone\n";
        assert_eq!(parse_coverage(output), None);
    }

    #[test]
    fn takes_last_coverage_line() {
        let output = "coverage: 10%\nmore output\nCoverage 92%,\n";
        assert_eq!(parse_coverage(output), Some(92.0));
    }
}

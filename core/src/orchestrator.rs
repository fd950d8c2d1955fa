//! Scenario execution.
//!
//! Every scenario walks the same phases: a source repository is built, served
//! over the scenario's transport, the client operation is driven (optionally
//! under a fault), and the resulting client state is compared with what the
//! server holds. Teardown always runs, including after errors and after the
//! scenario-level timeout fires, and releases the server, fault resources and
//! the scenario's working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::builder::Builder;
use crate::config::HarnessConfig;
use crate::driver::{ClientDriver, Operation, OperationResult, RunOptions};
use crate::error::{Error, ErrorClass, Result};
use crate::fault::{FaultGuard, FaultInjector, FaultSpec, FaultTarget};
use crate::filter::TagFilter;
use crate::git::Git;
use crate::process::ProcessGroups;
use crate::report::{ScenarioReport, SuiteReport, Verdict};
use crate::scenario::{Action, Expectation, Scenario, ScenarioSuite};
use crate::snapshot::Snapshot;
use crate::transport::{self, batch_ssh_command, Endpoint, TransportServer};
use crate::verifier::{Divergence, ExpectedDivergence, IntegrityReport, Verifier};

/// Scenario lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Building,
    Serving,
    Driving,
    Verifying,
    Teardown,
}

/// How a batch of scenarios is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Sequential,
    /// At most `max` scenarios at once.
    Parallel { max: usize },
}

impl ExecutionMode {
    /// Sequential for a parallelism of 0 or 1, bounded parallel otherwise.
    pub fn from_parallelism(parallelism: usize) -> Self {
        if parallelism <= 1 {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Parallel { max: parallelism }
        }
    }
}

/// What the driven operation left behind.
#[derive(Debug, Default)]
struct Observation {
    result: Option<OperationResult>,
    error: Option<Error>,
    divergence: Option<Divergence>,
    integrity: Option<IntegrityReport>,
}

/// Per-scenario state that must outlive a cancelled execution.
///
/// The scenario's client, builder and driver record every process group they
/// spawn in `groups`, so teardown can reclaim helpers a cancelled execution
/// left behind.
struct ScenarioRun<'a> {
    scenario: &'a Scenario,
    work: PathBuf,
    phases: Vec<Phase>,
    diagnostics: Vec<OperationResult>,
    server: Option<Box<dyn TransportServer>>,
    guard: Option<FaultGuard>,
    /// Repository whose integrity a failure is judged by.
    target: Option<PathBuf>,
    groups: ProcessGroups,
    git: Git,
    builder: Builder,
    driver: ClientDriver,
}

impl<'a> ScenarioRun<'a> {
    fn new(scenario: &'a Scenario, work: PathBuf, orchestrator: &Orchestrator) -> Self {
        let groups = ProcessGroups::new();
        Self {
            scenario,
            work,
            phases: vec![Phase::Init],
            diagnostics: Vec::new(),
            server: None,
            guard: None,
            target: None,
            git: orchestrator.git.clone().tracked(&groups),
            builder: orchestrator.builder.tracked(&groups),
            driver: orchestrator.driver.tracked(&groups),
            groups,
        }
    }

    fn enter(&mut self, phase: Phase) {
        tracing::info!(scenario = %self.scenario.name, phase = ?phase, "entering phase");
        self.phases.push(phase);
    }

    fn injector(&self) -> FaultInjector {
        FaultInjector::new(self.builder.clone(), self.work.join("fault"))
    }
}

/// Runs scenarios and turns their outcomes into verdicts.
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<HarnessConfig>,
    git: Git,
    builder: Builder,
    driver: ClientDriver,
}

impl Orchestrator {
    /// Creates an orchestrator for `config`.
    pub fn new(config: HarnessConfig) -> Self {
        let git = Git::from_config(&config);
        // Server-side extensions over SSH must never prompt either.
        let builder_git = git.clone().with_env(
            "GIT_SSH_COMMAND",
            batch_ssh_command(config.server_start_timeout()),
        );
        Self {
            builder: Builder::new(builder_git),
            driver: ClientDriver::from_config(&config),
            git,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs the scenarios of `suite` selected by `filter`.
    pub async fn run_suite(
        &self,
        suite: &ScenarioSuite,
        filter: &TagFilter,
        mode: ExecutionMode,
    ) -> SuiteReport {
        let selected = suite.filtered(filter);
        tracing::info!(
            selected = selected.len(),
            total = suite.len(),
            filter = %filter,
            "running suite"
        );
        self.run_all(&selected, mode).await
    }

    /// Runs `scenarios`; reports come back in input order.
    pub async fn run_all(&self, scenarios: &[Scenario], mode: ExecutionMode) -> SuiteReport {
        let reports = match mode {
            ExecutionMode::Sequential => {
                let mut reports = Vec::with_capacity(scenarios.len());
                for scenario in scenarios {
                    reports.push(self.run_scenario(scenario).await);
                }
                reports
            }
            ExecutionMode::Parallel { max } => self.run_parallel(scenarios, max.max(1)).await,
        };
        SuiteReport::new(reports)
    }

    async fn run_parallel(&self, scenarios: &[Scenario], max: usize) -> Vec<ScenarioReport> {
        let permits = Arc::new(Semaphore::new(max));
        let mut set = JoinSet::new();

        for (index, scenario) in scenarios.iter().cloned().enumerate() {
            let this = self.clone();
            let permits = Arc::clone(&permits);
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                // The inner task keeps a panicking scenario from taking its
                // slot's report down with it.
                let task_scenario = scenario.clone();
                let handle =
                    tokio::spawn(async move { this.run_scenario(&task_scenario).await });
                let report = match handle.await {
                    Ok(report) => report,
                    Err(e) if e.is_panic() => {
                        let message = panic_message(e.into_panic());
                        tracing::error!(scenario = %scenario.name, panic = %message, "scenario panicked");
                        ScenarioReport::panicked(&scenario, message)
                    }
                    Err(e) => ScenarioReport::panicked(&scenario, e.to_string()),
                };
                (index, report)
            });
        }

        let mut reports = Vec::with_capacity(scenarios.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => reports.push(entry),
                Err(e) => tracing::error!(error = %e, "scenario slot failed"),
            }
        }
        reports.sort_by_key(|(index, _)| *index);
        reports.into_iter().map(|(_, report)| report).collect()
    }

    /// Runs one scenario to a verdict.
    pub async fn run_scenario(&self, scenario: &Scenario) -> ScenarioReport {
        let started = Instant::now();
        tracing::info!(
            scenario = %scenario.name,
            transport = %scenario.transport,
            action = scenario.action.name(),
            "starting scenario"
        );

        let mut report = self.run_isolated(scenario).await;
        report.duration = started.elapsed();

        match &report.verdict {
            Verdict::Passed => tracing::info!(
                scenario = %scenario.name,
                duration_ms = report.duration.as_millis() as u64,
                "scenario passed"
            ),
            Verdict::Failed { class, reason } => tracing::warn!(
                scenario = %scenario.name,
                class = class.label(),
                reason = %reason,
                "scenario failed"
            ),
            Verdict::Skipped { reason } => tracing::info!(
                scenario = %scenario.name,
                reason = %reason,
                "scenario skipped"
            ),
        }
        report
    }

    async fn run_isolated(&self, scenario: &Scenario) -> ScenarioReport {
        if scenario.needs_network() && self.config.skip_network {
            let mut report = ScenarioReport::new(
                scenario,
                Verdict::Skipped {
                    reason: "scenario requires network access and network tests are disabled"
                        .to_string(),
                },
            );
            report.phases = vec![Phase::Init];
            return report;
        }

        let workdir = match self.allocate(scenario) {
            Ok(dir) => dir,
            Err(e) => {
                let mut report = ScenarioReport::new(scenario, Verdict::from_error(&e));
                report.phases = vec![Phase::Init];
                report.observed = Some(e.class());
                return report;
            }
        };
        tracing::debug!(scenario = %scenario.name, work_dir = ?workdir.path(), "allocated working directory");

        let mut run = ScenarioRun::new(scenario, workdir.path().to_path_buf(), self);
        let limit = self.scenario_limit(scenario);
        let outcome = match tokio::time::timeout(limit, self.execute(&mut run)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout {
                command: format!("scenario {}", scenario.name),
                after: limit,
            }),
        };
        let outcome = match outcome {
            Err(e) if !e.is_skip() => Ok(self.salvage(&mut run, e).await),
            other => other,
        };

        self.teardown(&mut run, workdir).await;

        let mut report = ScenarioReport::new(scenario, Verdict::Passed);
        match outcome {
            Ok(observation) => {
                report.verdict = evaluate(&scenario.expect, &observation);
                report.observed = observation.error.as_ref().map(Error::class);
                report.divergence = observation.divergence;
                report.integrity = observation.integrity;
            }
            Err(e) => {
                report.observed = Some(e.class());
                report.verdict = Verdict::from_error(&e);
            }
        }
        report.phases = run.phases;
        report.diagnostics = run.diagnostics;
        report
    }

    /// Creates `<work_dir>/<scenario>-<id>-XXXX`, removed on drop.
    fn allocate(&self, scenario: &Scenario) -> Result<TempDir> {
        let parent = self
            .config
            .work_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&parent)?;
        let prefix = format!("{}-{}-", sanitize(&scenario.name), short_id());
        Ok(tempfile::Builder::new().prefix(&prefix).tempdir_in(&parent)?)
    }

    /// Scenario-level bound; never shorter than a few client invocations.
    fn scenario_limit(&self, scenario: &Scenario) -> Duration {
        let invocation = scenario
            .timeout()
            .unwrap_or_else(|| self.config.default_timeout());
        self.config.scenario_timeout().max(invocation * 3)
    }

    fn options_for(&self, scenario: &Scenario) -> RunOptions {
        let options = self.driver.options();
        match scenario.timeout() {
            Some(timeout) => options.with_timeout(timeout),
            None => options,
        }
    }

    async fn execute(&self, run: &mut ScenarioRun<'_>) -> Result<Observation> {
        let scenario = run.scenario;

        run.enter(Phase::Building);
        let source = run
            .builder
            .build(&scenario.fixture, &run.work.join("source"))
            .await?;
        let name = source.name();
        let branch = scenario.fixture.default_branch.clone();

        run.enter(Phase::Serving);
        let served_root = run.work.join("served");
        let (endpoint, served) = {
            let server = run.server.insert(transport::for_kind(
                scenario.transport,
                &served_root,
                &self.config,
            ));
            server.start().await?;
            if matches!(scenario.action, Action::Push) && !server.supports_push() {
                return Err(Error::Skipped(format!(
                    "{} transport does not accept pushes",
                    scenario.transport
                )));
            }
            let endpoint = match scenario.action {
                Action::Push => server.serve_empty(&name, &branch).await?,
                _ => server.serve(&source).await?,
            };
            (endpoint, server.repository_path(&name))
        };
        let origin = served
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| endpoint.url().to_string());

        run.enter(Phase::Driving);
        let options = self.options_for(scenario);
        let client = run.work.join("client");
        let scratch = run.work.join("scratch");
        let seed = scenario.fixture.seed.wrapping_add(1);

        let (operation, target, baseline) = match &scenario.action {
            Action::Clone {
                branch,
                depth,
                bare,
            } => (
                Operation::Clone {
                    dest: client.clone(),
                    branch: branch.clone(),
                    depth: *depth,
                    bare: *bare,
                    protocol: scenario.protocol,
                },
                client.clone(),
                None,
            ),
            Action::Push => {
                // Refspec globs match nothing in an empty source, which the
                // client rejects; listing the remote still exercises the
                // endpoint.
                let operation = if source.is_empty() {
                    tracing::info!(scenario = %scenario.name, "empty source, nothing to push");
                    Operation::LsRemote {
                        dir: run.work.clone(),
                    }
                } else {
                    Operation::push_all(&source.root)
                };
                // Failed pushes must leave the receiving side intact.
                let target = served.clone().unwrap_or_else(|| source.root.clone());
                (operation, target, None)
            }
            Action::Fetch { new_commits } => {
                self.setup_clone(run, &client, &endpoint, &options).await?;
                let extended = run
                    .builder
                    .extend(&origin, served.as_deref(), &scratch, *new_commits, seed)
                    .await?;
                let operation = Operation::fetch(&client).with_protocol(scenario.protocol);
                (operation, client.clone(), Some(extended))
            }
            Action::Pull { new_commits } => {
                self.setup_clone(run, &client, &endpoint, &options).await?;
                let baseline = match &scenario.fault {
                    Some(fault @ FaultSpec::MergeConflict { .. }) => {
                        let target = FaultTarget::Repositories {
                            origin: &origin,
                            served: served.as_deref(),
                            client: &client,
                        };
                        let guard = run.injector().apply(fault, target).await?;
                        run.guard = Some(guard);
                        None
                    }
                    _ => Some(
                        run.builder
                            .extend(&origin, served.as_deref(), &scratch, *new_commits, seed)
                            .await?,
                    ),
                };
                (
                    Operation::pull(&client, Some(branch.clone())),
                    client.clone(),
                    baseline,
                )
            }
        };

        run.target = Some(target.clone());
        let result = self.drive(run, &operation, &endpoint, &options).await?;

        run.enter(Phase::Verifying);
        if let Some(error) = result.error() {
            let integrity = Verifier::check_integrity(&run.git, &target).await?;
            if !integrity.is_clean() {
                tracing::warn!(
                    scenario = %scenario.name,
                    broken = ?integrity.broken_refs,
                    "client repository references incomplete history"
                );
            }
            return Ok(Observation {
                result: Some(result),
                error: Some(error),
                divergence: None,
                integrity: Some(integrity),
            });
        }

        let expected = match &scenario.expect {
            Expectation::Converge { expected } => expected.clone(),
            Expectation::Failure { .. } => ExpectedDivergence::default(),
        };
        let divergence = match &scenario.action {
            Action::Clone {
                branch,
                depth,
                bare,
            } => {
                let mut expected = expected;
                let cloned = Snapshot::capture(&run.git, &target).await?;
                // Missing history is only excused where the client really
                // stopped at a shallow boundary.
                if depth.is_some() {
                    let boundary = cloned.boundary_commits();
                    if !boundary.is_empty() {
                        tracing::debug!(boundary = boundary.len(), "client history is shallow");
                        expected.truncated_history = true;
                    }
                }
                let served_view = source.published_view();
                let client_view = if *bare {
                    cloned.published_view()
                } else {
                    cloned.remote_view("origin")
                };
                // A non-default branch checkout has a different worktree.
                if branch.is_some() {
                    Verifier::compare(
                        &served_view.history_only(),
                        &client_view.history_only(),
                        &expected,
                    )
                } else {
                    Verifier::compare(&served_view, &client_view, &expected)
                }
            }
            Action::Push => {
                let verify = run.work.join("verify");
                let fresh = self
                    .verification_clone(run, &verify, &endpoint, &options)
                    .await?;
                Verifier::compare(&source.published_view(), &fresh, &expected)
            }
            Action::Fetch { .. } => {
                let fetched = Snapshot::capture(&run.git, &target).await?.remote_view("origin");
                match &baseline {
                    Some(baseline) => Verifier::compare(
                        &baseline.history_only(),
                        &fetched.history_only(),
                        &expected,
                    ),
                    None => Divergence::default(),
                }
            }
            Action::Pull { .. } => {
                let pulled = Snapshot::capture(&run.git, &target).await?.remote_view("origin");
                match &baseline {
                    Some(baseline) => Verifier::compare(baseline, &pulled, &expected),
                    None => Divergence::default(),
                }
            }
        };

        Ok(Observation {
            result: Some(result),
            error: None,
            divergence: Some(divergence),
            integrity: None,
        })
    }

    /// Runs the scenario's operation, under its invocation fault if any.
    async fn drive(
        &self,
        run: &mut ScenarioRun<'_>,
        operation: &Operation,
        endpoint: &Endpoint,
        options: &RunOptions,
    ) -> Result<OperationResult> {
        let mut guard = match &run.scenario.fault {
            Some(fault) if fault.targets_invocation() => Some(
                run.injector()
                    .apply(fault, FaultTarget::Invocation(endpoint))
                    .await?,
            ),
            _ => None,
        };
        let target = guard
            .as_ref()
            .and_then(FaultGuard::endpoint)
            .cloned()
            .unwrap_or_else(|| endpoint.clone());

        let result = run.driver.run(operation, &target, options).await;
        if let Some(guard) = guard.as_mut() {
            guard.revert();
        }

        let result = result?;
        tracing::info!(
            scenario = %run.scenario.name,
            command = %result.command_line(),
            status = ?result.status(),
            duration_ms = result.duration().as_millis() as u64,
            "operation finished"
        );
        run.diagnostics.push(result.clone());
        Ok(result)
    }

    /// Clones the unfaulted endpoint as scenario setup.
    async fn setup_clone(
        &self,
        run: &mut ScenarioRun<'_>,
        dest: &Path,
        endpoint: &Endpoint,
        options: &RunOptions,
    ) -> Result<()> {
        let result = run
            .driver
            .run(&Operation::clone_into(dest), endpoint, options)
            .await?;
        run.diagnostics.push(result.clone());
        match result.error() {
            Some(e) => Err(Error::Build {
                command: result.command_line(),
                reason: format!("setup clone failed: {}", e),
            }),
            None => Ok(()),
        }
    }

    /// Clones the endpoint afresh and returns the server state it saw.
    async fn verification_clone(
        &self,
        run: &mut ScenarioRun<'_>,
        dest: &Path,
        endpoint: &Endpoint,
        options: &RunOptions,
    ) -> Result<Snapshot> {
        let result = run
            .driver
            .run(&Operation::clone_into(dest), endpoint, options)
            .await?;
        run.diagnostics.push(result.clone());
        result.into_result()?;
        Ok(Snapshot::capture(&run.git, dest).await?.remote_view("origin"))
    }

    /// Turns an aborted execution into an observation of its error.
    ///
    /// Leftover processes are reclaimed first so the repository the scenario
    /// was working on can be inspected.
    async fn salvage(&self, run: &mut ScenarioRun<'_>, error: Error) -> Observation {
        self.reap(run).await;
        let target = run
            .target
            .clone()
            .unwrap_or_else(|| run.work.join("client"));
        let integrity = match Verifier::check_integrity(&run.git, &target).await {
            Ok(integrity) => Some(integrity),
            Err(e) => {
                tracing::debug!(repo = ?target, error = %e, "integrity check after failure failed");
                None
            }
        };
        Observation {
            result: run.diagnostics.last().cloned(),
            error: Some(error),
            divergence: None,
            integrity,
        }
    }

    /// Stops every process group the scenario still has running.
    async fn reap(&self, run: &mut ScenarioRun<'_>) {
        let reaped = run.groups.terminate_all(self.config.stop_grace()).await;
        if reaped > 0 {
            tracing::warn!(
                scenario = %run.scenario.name,
                groups = reaped,
                "terminated leftover client processes"
            );
        }
    }

    async fn teardown(&self, run: &mut ScenarioRun<'_>, workdir: TempDir) {
        run.enter(Phase::Teardown);
        self.reap(run).await;

        if let Some(mut guard) = run.guard.take() {
            guard.revert();
        }
        if let Some(mut server) = run.server.take() {
            if let Err(e) = server.stop().await {
                tracing::warn!(
                    scenario = %run.scenario.name,
                    transport = %server.kind(),
                    error = %e,
                    "failed to stop server"
                );
            }
        }

        let path = workdir.path().to_path_buf();
        if let Err(e) = workdir.close() {
            tracing::warn!(path = ?path, error = %e, "failed to remove scenario directory");
        }
    }
}

/// Maps an observation onto the scenario's expectation.
fn evaluate(expect: &Expectation, observation: &Observation) -> Verdict {
    match expect {
        Expectation::Converge { .. } => {
            if let Some(error) = &observation.error {
                return Verdict::from_error(error);
            }
            match &observation.divergence {
                Some(divergence) if !divergence.is_empty() => {
                    Verdict::from_error(&Error::Divergence(divergence.clone()))
                }
                _ => Verdict::Passed,
            }
        }
        Expectation::Failure {
            class,
            marker,
            clean,
        } => {
            let Some(error) = &observation.error else {
                return Verdict::Failed {
                    class: ErrorClass::Expectation,
                    reason: format!(
                        "operation succeeded but a {} failure was expected",
                        class.label()
                    ),
                };
            };
            if error.class() != *class {
                return Verdict::Failed {
                    class: ErrorClass::Expectation,
                    reason: format!("expected a {} failure, got: {}", class.label(), error),
                };
            }
            if let Some(marker) = marker {
                let found = observation
                    .result
                    .as_ref()
                    .is_some_and(|result| result.contains(marker))
                    || error.to_string().contains(marker);
                if !found {
                    return Verdict::Failed {
                        class: ErrorClass::Expectation,
                        reason: format!("neither client output nor the error contains {:?}", marker),
                    };
                }
            }
            if *clean {
                if let Some(integrity) = &observation.integrity {
                    if !integrity.is_clean() {
                        return Verdict::Failed {
                            class: ErrorClass::Divergence,
                            reason: format!(
                                "client repository references incomplete history: {:?}",
                                integrity.broken_refs
                            ),
                        };
                    }
                }
            }
            Verdict::Passed
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches('-');
    if trimmed.is_empty() {
        "scenario".to_string()
    } else {
        trimmed.chars().take(40).collect()
    }
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::FixtureSpec;
    use crate::transport::TransportKind;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn config(work: &TempDir) -> HarnessConfig {
        HarnessConfig::default()
            .with_work_dir(work.path())
            .with_default_timeout(Duration::from_secs(30))
            .with_ssh_url(None)
    }

    #[test]
    fn sanitize_keeps_names_path_safe() {
        assert_eq!(sanitize("Clone over HTTP (dumb)"), "clone-over-http--dumb");
        assert_eq!(sanitize("///"), "scenario");
        assert_eq!(sanitize(&"x".repeat(100)).len(), 40);
    }

    #[test]
    fn parallelism_selects_mode() {
        assert_eq!(ExecutionMode::from_parallelism(0), ExecutionMode::Sequential);
        assert_eq!(ExecutionMode::from_parallelism(1), ExecutionMode::Sequential);
        assert_eq!(
            ExecutionMode::from_parallelism(4),
            ExecutionMode::Parallel { max: 4 }
        );
    }

    #[test]
    fn converge_fails_on_divergence() {
        let observation = Observation {
            divergence: Some(Divergence {
                references: BTreeSet::from(["refs/heads/main".to_string()]),
                ..Divergence::default()
            }),
            ..Observation::default()
        };
        let verdict = evaluate(&Expectation::converge(), &observation);
        assert!(matches!(
            verdict,
            Verdict::Failed {
                class: ErrorClass::Divergence,
                ..
            }
        ));

        let clean = Observation {
            divergence: Some(Divergence::default()),
            ..Observation::default()
        };
        assert_eq!(evaluate(&Expectation::converge(), &clean), Verdict::Passed);
    }

    #[test]
    fn failure_expectation_checks_class_and_integrity() {
        let timeout = || Error::Timeout {
            command: "git clone".to_string(),
            after: Duration::from_secs(1),
        };

        let matching = Observation {
            error: Some(timeout()),
            integrity: Some(IntegrityReport::default()),
            ..Observation::default()
        };
        assert_eq!(
            evaluate(&Expectation::failure(ErrorClass::Timeout), &matching),
            Verdict::Passed
        );

        let wrong_class = evaluate(&Expectation::failure(ErrorClass::Client), &matching);
        assert!(matches!(
            wrong_class,
            Verdict::Failed {
                class: ErrorClass::Expectation,
                ..
            }
        ));

        let succeeded = evaluate(
            &Expectation::failure(ErrorClass::Timeout),
            &Observation::default(),
        );
        assert!(matches!(
            succeeded,
            Verdict::Failed {
                class: ErrorClass::Expectation,
                ..
            }
        ));

        let dirty = Observation {
            error: Some(timeout()),
            integrity: Some(IntegrityReport {
                repository_exists: true,
                broken_refs: BTreeSet::from(["refs/heads/main".to_string()]),
                ..IntegrityReport::default()
            }),
            ..Observation::default()
        };
        assert!(matches!(
            evaluate(&Expectation::failure(ErrorClass::Timeout), &dirty),
            Verdict::Failed {
                class: ErrorClass::Divergence,
                ..
            }
        ));
    }

    #[test]
    fn missing_marker_fails_expectation() {
        let observation = Observation {
            error: Some(Error::Client {
                command: "git pull".to_string(),
                code: Some(1),
                stdout: String::new(),
                stderr: String::new(),
            }),
            ..Observation::default()
        };
        let expect = Expectation::failure(ErrorClass::Client).with_marker("CONFLICT");
        assert!(matches!(
            evaluate(&expect, &observation),
            Verdict::Failed {
                class: ErrorClass::Expectation,
                ..
            }
        ));
    }

    #[test]
    fn marker_is_also_searched_in_the_error() {
        let observation = Observation {
            error: Some(Error::ServerStart {
                transport: "daemon".to_string(),
                reason: "port 9418 in use".to_string(),
            }),
            ..Observation::default()
        };
        let matching = Expectation::failure(ErrorClass::ServerStart).with_marker("in use");
        assert_eq!(evaluate(&matching, &observation), Verdict::Passed);

        let missing = Expectation::failure(ErrorClass::ServerStart).with_marker("CONFLICT");
        assert!(evaluate(&missing, &observation).is_failed());
    }

    #[tokio::test]
    async fn setup_failures_are_judged_by_the_whole_expectation() {
        let work = TempDir::new().unwrap();
        let orchestrator =
            Orchestrator::new(config(&work).with_client_bin("/nonexistent/git-binary"));
        let scenario = |marker: &str| {
            Scenario::new("broken client", TransportKind::File, Action::default())
                .expecting(Expectation::failure(ErrorClass::Build).with_marker(marker))
        };

        let matched = orchestrator
            .run_scenario(&scenario("failed to build fixture"))
            .await;
        assert_eq!(matched.verdict, Verdict::Passed);
        assert_eq!(matched.observed, Some(ErrorClass::Build));
        let integrity = matched.integrity.unwrap();
        assert!(!integrity.repository_exists);
        assert!(integrity.repository.unwrap().ends_with("client"));

        let unmatched = orchestrator.run_scenario(&scenario("no such marker")).await;
        assert!(matches!(
            unmatched.verdict,
            Verdict::Failed {
                class: ErrorClass::Expectation,
                ..
            }
        ));
        assert_eq!(unmatched.phases.last(), Some(&Phase::Teardown));
    }

    #[tokio::test]
    async fn linear_clone_over_file_transport_passes() {
        let work = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&work));
        let scenario = Scenario::new("linear clone", TransportKind::File, Action::default())
            .with_fixture(FixtureSpec::linear(3));

        let report = orchestrator.run_scenario(&scenario).await;

        assert_eq!(report.verdict, Verdict::Passed, "{:?}", report.diagnostics);
        assert_eq!(report.divergence, Some(Divergence::default()));
        assert_eq!(
            report.phases,
            vec![
                Phase::Init,
                Phase::Building,
                Phase::Serving,
                Phase::Driving,
                Phase::Verifying,
                Phase::Teardown
            ]
        );
        assert_eq!(report.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn teardown_removes_working_directory() {
        let work = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&work));
        let scenario = Scenario::new("cleanup", TransportKind::File, Action::default())
            .with_fixture(FixtureSpec::linear(1));

        orchestrator.run_scenario(&scenario).await;

        let leftovers: Vec<_> = std::fs::read_dir(work.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn unconfigured_ssh_is_skipped() {
        let work = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&work));
        let scenario = Scenario::new("ssh clone", TransportKind::Ssh, Action::default());

        let report = orchestrator.run_scenario(&scenario).await;

        assert!(report.verdict.is_skipped(), "{:?}", report.verdict);
        assert_eq!(report.phases.last(), Some(&Phase::Teardown));
    }

    #[tokio::test]
    async fn network_scenarios_skip_when_disabled() {
        let work = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&work).with_skip_network(true));
        let scenario =
            Scenario::new("remote", TransportKind::File, Action::default()).requiring_network();

        let report = orchestrator.run_scenario(&scenario).await;

        assert!(report.verdict.is_skipped());
        assert_eq!(report.phases, vec![Phase::Init]);
    }

    #[tokio::test]
    async fn parallel_reports_keep_input_order() {
        let work = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&work));
        let scenarios: Vec<_> = (0..3)
            .map(|i| {
                Scenario::new(format!("clone-{}", i), TransportKind::File, Action::default())
                    .with_fixture(FixtureSpec::linear(i + 1))
            })
            .collect();

        let suite = orchestrator
            .run_all(&scenarios, ExecutionMode::Parallel { max: 2 })
            .await;

        let names: Vec<_> = suite.scenarios.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["clone-0", "clone-1", "clone-2"]);
        assert!(suite.all_passed(), "{}", suite.to_markdown());
    }
}

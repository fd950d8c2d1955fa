//! Scenario definitions and YAML suite loading.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::builder::FixtureSpec;
use crate::config::{Validate, ValidationResult};
use crate::error::{Error, ErrorClass, Result};
use crate::fault::FaultSpec;
use crate::filter::TagFilter;
use crate::transport::TransportKind;
use crate::verifier::ExpectedDivergence;

fn default_fetch_commits() -> usize {
    2
}

fn default_pull_commits() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Client operation a scenario drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Clone the served fixture.
    Clone {
        #[serde(default)]
        branch: Option<String>,
        #[serde(default)]
        depth: Option<u32>,
        #[serde(default)]
        bare: bool,
    },
    /// Push the fixture into an empty served repository.
    Push,
    /// Clone, add commits on the server, fetch them.
    Fetch {
        #[serde(default = "default_fetch_commits")]
        new_commits: usize,
    },
    /// Clone, add commits on the server, pull them.
    Pull {
        #[serde(default = "default_pull_commits")]
        new_commits: usize,
    },
}

impl Default for Action {
    fn default() -> Self {
        Action::Clone {
            branch: None,
            depth: None,
            bare: false,
        }
    }
}

impl Action {
    /// Returns the action name.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Clone { .. } => "clone",
            Action::Push => "push",
            Action::Fetch { .. } => "fetch",
            Action::Pull { .. } => "pull",
        }
    }
}

/// Expected outcome of a scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Expectation {
    /// Client and server converge, modulo tolerated differences.
    Converge {
        #[serde(default)]
        expected: ExpectedDivergence,
    },
    /// The driven operation fails.
    Failure {
        /// Error class the failure must have.
        class: ErrorClass,
        /// Text the client output must contain.
        #[serde(default)]
        marker: Option<String>,
        /// Whether the client repository must pass the integrity check.
        #[serde(default = "default_true")]
        clean: bool,
    },
}

impl Default for Expectation {
    fn default() -> Self {
        Expectation::converge()
    }
}

impl Expectation {
    /// Plain convergence.
    pub fn converge() -> Self {
        Expectation::Converge {
            expected: ExpectedDivergence::default(),
        }
    }

    /// Failure of `class` leaving a clean client.
    pub fn failure(class: ErrorClass) -> Self {
        Expectation::Failure {
            class,
            marker: None,
            clean: true,
        }
    }

    /// Requires `marker` in the client output (failure expectations only).
    pub fn with_marker(self, text: impl Into<String>) -> Self {
        match self {
            Expectation::Failure { class, clean, .. } => Expectation::Failure {
                class,
                marker: Some(text.into()),
                clean,
            },
            other => other,
        }
    }
}

/// One conformance scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique scenario name.
    pub name: String,

    /// What the scenario checks.
    #[serde(default)]
    pub description: String,

    /// Selection tags (`slow`, `network`, `ssh`, or custom).
    #[serde(default)]
    pub tags: Vec<String>,

    /// Transport the fixture is served over.
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Source repository.
    #[serde(default)]
    pub fixture: FixtureSpec,

    /// Client operation.
    #[serde(default)]
    pub action: Action,

    /// Failure to inject.
    #[serde(default)]
    pub fault: Option<FaultSpec>,

    /// Expected outcome.
    #[serde(default)]
    pub expect: Expectation,

    /// Whether the scenario needs network access beyond loopback.
    #[serde(default)]
    pub requires_network: bool,

    /// Per-invocation client timeout override, in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Wire protocol version pinned for clone and fetch (0, 1 or 2).
    #[serde(default)]
    pub protocol: Option<u8>,
}

fn default_transport() -> TransportKind {
    TransportKind::File
}

impl Scenario {
    /// Creates a scenario with a default fixture and a convergence expectation.
    pub fn new(name: impl Into<String>, transport: TransportKind, action: Action) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            tags: Vec::new(),
            transport,
            fixture: FixtureSpec::default(),
            action,
            fault: None,
            expect: Expectation::default(),
            requires_network: false,
            timeout_secs: None,
            protocol: None,
        }
    }

    /// Sets the fixture.
    pub fn with_fixture(mut self, fixture: FixtureSpec) -> Self {
        self.fixture = fixture;
        self
    }

    /// Sets the fault.
    pub fn with_fault(mut self, fault: FaultSpec) -> Self {
        self.fault = Some(fault);
        self
    }

    /// Sets the expectation.
    pub fn expecting(mut self, expect: Expectation) -> Self {
        self.expect = expect;
        self
    }

    /// Adds a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Sets the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    /// Pins the wire protocol version for clone and fetch.
    pub fn with_protocol(mut self, version: u8) -> Self {
        self.protocol = Some(version);
        self
    }

    /// Marks the scenario as needing network access.
    pub fn requiring_network(mut self) -> Self {
        self.requires_network = true;
        self
    }

    /// Returns the declared tags plus the derived ones (transport, network, fault).
    pub fn effective_tags(&self) -> Vec<String> {
        let mut tags: BTreeSet<String> = self.tags.iter().cloned().collect();
        tags.insert(self.transport.name().to_string());
        tags.insert(self.action.name().to_string());
        if self.requires_network {
            tags.insert("network".to_string());
        }
        if let Some(fault) = &self.fault {
            tags.insert(fault.name().to_string());
        }
        tags.into_iter().collect()
    }

    /// Returns true if the scenario cannot run without network access.
    pub fn needs_network(&self) -> bool {
        self.requires_network
    }

    /// Returns the per-invocation timeout override.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

impl Validate for Scenario {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.name.trim().is_empty() {
            result.add_error("scenario name cannot be empty");
        }
        if self.timeout_secs == Some(0) {
            result.add_error(format!("{}: timeout_secs must be at least 1", self.name));
        }
        if let Some(version) = self.protocol {
            if version > 2 {
                result.add_error(format!(
                    "{}: protocol version {} is not one of 0, 1, 2",
                    self.name, version
                ));
            }
            if !matches!(self.action, Action::Clone { .. } | Action::Fetch { .. }) {
                result.add_warning(format!(
                    "{}: protocol only applies to clone and fetch",
                    self.name
                ));
            }
        }

        if let Some(fault) = &self.fault {
            if !fault.supports(self.transport) {
                result.add_error(format!(
                    "{}: {} fault cannot be applied over the {} transport",
                    self.name,
                    fault.name(),
                    self.transport
                ));
            }
            if matches!(fault, FaultSpec::MergeConflict { .. }) && !matches!(self.action, Action::Pull { .. }) {
                result.add_error(format!("{}: merge_conflict requires a pull action", self.name));
            }
            if fault.targets_invocation() && matches!(self.expect, Expectation::Converge { .. }) {
                result.add_warning(format!(
                    "{}: expects convergence under a {} fault",
                    self.name,
                    fault.name()
                ));
            }
        }

        if self.transport == TransportKind::Http && self.action == Action::Push {
            result.add_warning(format!(
                "{}: the http transport is read-only; push scenarios are skipped",
                self.name
            ));
        }
        if self.fixture.is_empty() && matches!(self.action, Action::Fetch { .. } | Action::Pull { .. }) {
            result.add_warning(format!("{}: fetch/pull from an empty fixture", self.name));
        }
        if let Expectation::Failure {
            class: ErrorClass::Skipped,
            ..
        } = self.expect
        {
            result.add_error(format!("{}: skipped is not a failure class", self.name));
        }

        result
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SuiteFile {
    List(Vec<Scenario>),
    Suite { scenarios: Vec<Scenario> },
}

/// An ordered collection of scenarios.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScenarioSuite {
    pub scenarios: Vec<Scenario>,
}

impl ScenarioSuite {
    /// Creates a suite from scenarios.
    pub fn new(scenarios: Vec<Scenario>) -> Self {
        Self { scenarios }
    }

    /// Loads a suite from a YAML file (a list, or a map with `scenarios`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(Error::Io)?;
        Self::from_yaml(&content)
    }

    /// Parses a suite from YAML text.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: SuiteFile = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse scenario suite: {}", e)))?;
        let scenarios = match file {
            SuiteFile::List(scenarios) => scenarios,
            SuiteFile::Suite { scenarios } => scenarios,
        };
        Ok(Self { scenarios })
    }

    /// Returns the scenarios selected by `filter`, in suite order.
    pub fn filtered(&self, filter: &TagFilter) -> Vec<Scenario> {
        self.scenarios
            .iter()
            .filter(|s| filter.matches(&s.effective_tags()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

impl Validate for ScenarioSuite {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        let mut seen = BTreeSet::new();
        for scenario in &self.scenarios {
            if !seen.insert(scenario.name.as_str()) {
                result.add_error(format!("duplicate scenario name: {}", scenario.name));
            }
            result.merge(scenario.validate());
        }
        result
    }
}

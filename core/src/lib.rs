//! VCS Conformance - multi-transport client/server conformance harness
//!
//! This library builds reproducible source repositories, serves them over the
//! local filesystem, the native daemon protocol, dumb HTTP and SSH, drives the
//! real client binary against them (optionally under injected faults), and
//! verifies that client and server end up in equivalent states.

pub mod backoff;
pub mod builder;
pub mod config;
pub mod driver;
pub mod error;
pub mod fault;
pub mod filter;
pub mod git;
pub mod orchestrator;
pub mod process;
pub mod report;
pub mod scenario;
pub mod snapshot;
pub mod transport;
pub mod verifier;

pub use error::{Error, ErrorClass, Result};

pub use builder::{Builder, FileProfile, FixtureSpec, Topology};
pub use config::{HarnessConfig, Validate, ValidationResult};
pub use driver::{
    ClientDriver, ExitStatusKind, Operation, OperationKind, OperationResult, RunOptions,
};
pub use fault::{FaultGuard, FaultInjector, FaultSpec, FaultTarget, UnreachableMode};
pub use filter::TagFilter;
pub use git::Git;
pub use orchestrator::{ExecutionMode, Orchestrator, Phase};
pub use process::ProcessGroups;
pub use report::{ScenarioReport, SuiteReport, Summary, Verdict};
pub use scenario::{Action, Expectation, Scenario, ScenarioSuite};
pub use snapshot::Snapshot;
pub use transport::{
    AuthPolicy, DaemonServer, Endpoint, HttpServer, LocalServer, ServerState, SshServer,
    TransportKind, TransportServer,
};
pub use verifier::{Divergence, ExpectedDivergence, IntegrityReport, Verifier};

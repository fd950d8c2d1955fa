//! Conformance scenarios against real client and server binaries.
//!
//! Everything here runs on loopback with the local `git` installation. SSH
//! scenarios need `HARNESS_SSH_URL` and are ignored by default.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use vcs_conformance::builder::{Builder, FEATURE_BRANCH};
use vcs_conformance::transport::for_kind;
use vcs_conformance::{
    Action, ClientDriver, ErrorClass, ExecutionMode, Expectation, FaultSpec, FileProfile, FixtureSpec, Git,
    HarnessConfig, Operation, OperationKind, Orchestrator, Phase, Scenario, ScenarioSuite, ServerState,
    Snapshot, TagFilter, Topology, TransportKind, Validate, Verdict,
};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn harness(work: &TempDir) -> Orchestrator {
    let config = HarnessConfig::default()
        .with_work_dir(work.path())
        .with_default_timeout(Duration::from_secs(30))
        .with_ssh_url(None);
    Orchestrator::new(config)
}

fn clone_all() -> Action {
    Action::default()
}

#[tokio::test]
async fn clone_converges_over_every_local_transport() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let fixture = FixtureSpec::linear(4)
        .with_topology(Topology::Diverging)
        .with_tags();

    for kind in [TransportKind::File, TransportKind::Daemon, TransportKind::Http] {
        let scenario = Scenario::new(format!("clone-{}", kind), kind, clone_all())
            .with_fixture(fixture.clone());
        let report = orchestrator.run_scenario(&scenario).await;
        assert_eq!(
            report.verdict,
            Verdict::Passed,
            "{} diagnostics: {:?}",
            kind,
            report.diagnostics
        );
    }
}

#[tokio::test]
async fn binary_and_special_path_content_survives_clone() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);

    for files in [FileProfile::Binary, FileProfile::SpecialCharacters] {
        let scenario = Scenario::new("content", TransportKind::Daemon, clone_all())
            .with_fixture(FixtureSpec::linear(2).with_files(files.clone()));
        let report = orchestrator.run_scenario(&scenario).await;
        assert!(report.verdict.is_passed(), "{:?}: {:?}", files, report.verdict);
    }
}

#[tokio::test]
async fn shallow_clone_tolerates_truncated_history() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let scenario = Scenario::new(
        "shallow",
        TransportKind::Daemon,
        Action::Clone {
            branch: None,
            depth: Some(1),
            bare: false,
        },
    )
    .with_fixture(FixtureSpec::linear(5));

    let report = orchestrator.run_scenario(&scenario).await;
    assert!(report.verdict.is_passed(), "{:?}", report.verdict);
}

#[tokio::test]
async fn empty_repository_clones_cleanly() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let scenario = Scenario::new("empty", TransportKind::File, clone_all())
        .with_fixture(FixtureSpec::empty());

    let report = orchestrator.run_scenario(&scenario).await;
    assert!(report.verdict.is_passed(), "{:?}", report.verdict);
}

#[tokio::test]
async fn push_round_trips_on_write_capable_transports() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);

    for kind in [TransportKind::File, TransportKind::Daemon] {
        let scenario = Scenario::new(format!("push-{}", kind), kind, Action::Push)
            .with_fixture(FixtureSpec::linear(3).with_tags());
        let report = orchestrator.run_scenario(&scenario).await;
        assert!(report.verdict.is_passed(), "{}: {:?}", kind, report.verdict);
        // push, then the fresh verification clone
        assert_eq!(report.diagnostics.len(), 2);
    }
}

#[tokio::test]
async fn push_of_empty_fixture_leaves_remote_empty() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);

    for kind in [TransportKind::File, TransportKind::Daemon] {
        let scenario = Scenario::new(format!("push-empty-{}", kind), kind, Action::Push)
            .with_fixture(FixtureSpec::empty());
        let report = orchestrator.run_scenario(&scenario).await;

        assert!(report.verdict.is_passed(), "{}: {:?}", kind, report.verdict);
        assert_eq!(report.diagnostics[0].kind(), OperationKind::LsRemote);
        assert!(report.diagnostics[0].stdout().trim().is_empty());
        assert_eq!(report.divergence.map(|d| d.is_empty()), Some(true));
    }
}

#[tokio::test]
async fn truncated_push_leaves_server_repository_intact() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let scenario = Scenario::new("truncate-push-daemon", TransportKind::Daemon, Action::Push)
        .with_fixture(FixtureSpec::linear(1).with_files(FileProfile::Oversized { bytes: 200_000 }))
        .with_fault(FaultSpec::Truncate { at_byte: 300 })
        .with_timeout(Duration::from_secs(20))
        .expecting(Expectation::failure(ErrorClass::Client));
    assert!(scenario.validate().is_valid());

    let report = orchestrator.run_scenario(&scenario).await;

    assert!(report.verdict.is_passed(), "{:?} {:?}", report.verdict, report.diagnostics);
    assert_eq!(report.observed, Some(ErrorClass::Client));
    let push = &report.diagnostics[0];
    assert_eq!(push.kind(), OperationKind::Push);
    assert!(!push.success());

    let integrity = report.integrity.unwrap();
    assert!(integrity.repository_exists);
    assert!(integrity.is_clean(), "{:?}", integrity);
    assert!(integrity
        .repository
        .unwrap()
        .ends_with(PathBuf::from("served").join("source.git")));
}

#[tokio::test]
async fn branch_and_bare_clones_converge() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let fixture = FixtureSpec::linear(3).with_topology(Topology::Diverging);

    for kind in [TransportKind::File, TransportKind::Daemon] {
        for (label, action) in [
            (
                "branch",
                Action::Clone {
                    branch: Some(FEATURE_BRANCH.to_string()),
                    depth: None,
                    bare: false,
                },
            ),
            (
                "bare",
                Action::Clone {
                    branch: None,
                    depth: None,
                    bare: true,
                },
            ),
        ] {
            let scenario = Scenario::new(format!("clone-{}-{}", label, kind), kind, action)
                .with_fixture(fixture.clone());
            let report = orchestrator.run_scenario(&scenario).await;
            assert!(report.verdict.is_passed(), "{} {}: {:?}", label, kind, report.verdict);

            let argv = report.diagnostics[0].argv();
            match label {
                "branch" => assert!(argv.iter().any(|a| a == FEATURE_BRANCH)),
                _ => assert!(argv.iter().any(|a| a == "--bare")),
            }
        }
    }
}

#[tokio::test]
async fn pinned_protocol_version_reaches_the_client() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);

    for action in [clone_all(), Action::Fetch { new_commits: 1 }] {
        let scenario = Scenario::new(format!("v2-{}", action.name()), TransportKind::Daemon, action)
            .with_fixture(FixtureSpec::linear(2))
            .with_protocol(2);
        let report = orchestrator.run_scenario(&scenario).await;

        assert!(report.verdict.is_passed(), "{:?}", report.verdict);
        let driven = report.diagnostics.last().unwrap();
        assert!(
            driven.argv().iter().any(|a| a == "protocol.version=2"),
            "{}",
            driven.command_line()
        );
    }
}

#[tokio::test]
async fn remote_added_by_the_driver_can_be_fetched() {
    let work = TempDir::new().unwrap();
    let config = HarnessConfig::default();
    let git = Git::from_config(&config);
    let source = Builder::new(git.clone())
        .build(&FixtureSpec::linear(2).with_tags(), &work.path().join("source"))
        .await
        .unwrap();

    let mut server = for_kind(TransportKind::Daemon, &work.path().join("served"), &config);
    server.start().await.unwrap();
    let endpoint = server.serve(&source).await.unwrap();

    let repo = work.path().join("client");
    tokio::fs::create_dir_all(&repo).await.unwrap();
    git.run(&repo, &["init", "-q"]).await.unwrap();

    let driver = ClientDriver::from_config(&config);
    let options = driver.options();
    let add = Operation::RemoteAdd {
        repo: repo.clone(),
        name: "mirror".to_string(),
    };
    let added = driver.run(&add, &endpoint, &options).await.unwrap();
    assert!(added.success(), "{}", added.stderr());
    assert_eq!(added.kind(), OperationKind::RemoteAdd);

    let fetch = Operation::Fetch {
        repo: repo.clone(),
        remote: "mirror".to_string(),
        all: false,
        tags: true,
        prune: false,
        protocol: None,
    };
    assert!(driver.run(&fetch, &endpoint, &options).await.unwrap().success());

    let fetched = Snapshot::capture(&git, &repo).await.unwrap().remote_view("mirror");
    assert_eq!(fetched.refs, source.published_view().refs);
    assert_ok!(server.stop().await);
}

/// A pid counts as running unless it is gone or a zombie.
fn is_running(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map_or(false, |state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

#[tokio::test]
async fn scenario_timeout_reclaims_client_helpers() {
    use std::os::unix::fs::PermissionsExt;

    let work = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    let pid_file = bin.path().join("helper.pid");
    let client = bin.path().join("git");
    // Hangs on the first commit with a helper in the client's process group.
    let script = format!(
        "#!/bin/sh\n\
         for arg in \"$@\"; do\n\
         \x20 if [ \"$arg\" = commit ]; then\n\
         \x20   sleep 600 &\n\
         \x20   echo $! > {}\n\
         \x20   wait\n\
         \x20 fi\n\
         done\n\
         exec git \"$@\"\n",
        pid_file.display()
    );
    std::fs::write(&client, script).unwrap();
    std::fs::set_permissions(&client, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = HarnessConfig::default()
        .with_work_dir(work.path())
        .with_client_bin(&client)
        .with_default_timeout(Duration::from_secs(1))
        .with_scenario_timeout(Duration::from_secs(1))
        .with_ssh_url(None);
    let scenario = Scenario::new("hanging-build", TransportKind::File, clone_all())
        .with_fixture(FixtureSpec::linear(2));

    let started = Instant::now();
    let report = Orchestrator::new(config).run_scenario(&scenario).await;

    assert!(
        matches!(report.verdict, Verdict::Failed { class: ErrorClass::Timeout, .. }),
        "{:?}",
        report.verdict
    );
    assert_eq!(report.phases.last(), Some(&Phase::Teardown));
    assert!(started.elapsed() < Duration::from_secs(30));

    let helper: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while is_running(helper) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!is_running(helper), "helper {} outlived the scenario", helper);
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn push_over_read_only_http_is_skipped() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let scenario = Scenario::new("push-http", TransportKind::Http, Action::Push);

    let report = orchestrator.run_scenario(&scenario).await;
    assert!(report.verdict.is_skipped(), "{:?}", report.verdict);
}

#[tokio::test]
async fn fetch_and_pull_pick_up_server_commits() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);

    for kind in [TransportKind::File, TransportKind::Daemon, TransportKind::Http] {
        for action in [
            Action::Fetch { new_commits: 2 },
            Action::Pull { new_commits: 1 },
        ] {
            let scenario = Scenario::new(format!("{}-{}", action.name(), kind), kind, action);
            let report = orchestrator.run_scenario(&scenario).await;
            assert!(
                report.verdict.is_passed(),
                "{}: {:?} {:?}",
                scenario.name,
                report.verdict,
                report.diagnostics
            );
        }
    }
}

#[tokio::test]
async fn diverging_edits_make_pull_conflict() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let scenario = Scenario::new("conflict", TransportKind::File, Action::Pull { new_commits: 1 })
        .with_fault(FaultSpec::MergeConflict {
            path: "README.md".to_string(),
        })
        .expecting(Expectation::failure(ErrorClass::Client).with_marker("CONFLICT"));

    let report = orchestrator.run_scenario(&scenario).await;

    assert_eq!(report.verdict, Verdict::Passed, "{:?}", report.diagnostics);
    assert_eq!(report.observed, Some(ErrorClass::Client));
    let pull = report.diagnostics.last().unwrap();
    assert!(pull.has_conflict_marker());
    assert!(report.integrity.unwrap().is_clean());
}

#[tokio::test]
async fn unreachable_endpoint_fails_within_timeout() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let timeout = Duration::from_secs(10);
    let scenario = Scenario::new("unreachable", TransportKind::Daemon, clone_all())
        .with_fault(FaultSpec::Unreachable {
            mode: Default::default(),
        })
        .with_timeout(timeout)
        .expecting(Expectation::failure(ErrorClass::Client));

    let started = Instant::now();
    let report = orchestrator.run_scenario(&scenario).await;

    assert!(report.verdict.is_passed(), "{:?}", report.verdict);
    let clone = report.diagnostics.last().unwrap();
    assert!(clone.duration() < timeout + Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test]
async fn truncated_transfer_leaves_no_dangling_refs() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);

    for kind in [TransportKind::Daemon, TransportKind::Http] {
        let scenario = Scenario::new(format!("truncate-{}", kind), kind, clone_all())
            .with_fixture(FixtureSpec::linear(3).with_files(FileProfile::Oversized {
                bytes: 256 * 1024,
            }))
            .with_fault(FaultSpec::Truncate { at_byte: 2048 })
            .with_timeout(Duration::from_secs(20))
            .expecting(Expectation::failure(ErrorClass::Client));

        let report = orchestrator.run_scenario(&scenario).await;
        assert!(report.verdict.is_passed(), "{}: {:?}", kind, report.verdict);
        assert!(report.integrity.map_or(true, |i| i.is_clean()));
    }
}

#[tokio::test]
async fn rejected_credentials_fail_without_prompting() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);

    for kind in [TransportKind::Daemon, TransportKind::Http] {
        let scenario = Scenario::new(format!("auth-{}", kind), kind, clone_all())
            .with_fault(FaultSpec::AuthReject)
            .with_timeout(Duration::from_secs(20))
            .expecting(Expectation::failure(ErrorClass::Client));

        let report = orchestrator.run_scenario(&scenario).await;
        assert!(report.verdict.is_passed(), "{}: {:?}", kind, report.verdict);
    }
}

#[tokio::test]
async fn stop_twice_is_harmless() {
    let work = TempDir::new().unwrap();
    let config = HarnessConfig::default();

    for kind in [TransportKind::File, TransportKind::Daemon, TransportKind::Http] {
        let mut server = for_kind(kind, &work.path().join(kind.name()), &config);
        let endpoint = server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Running);

        assert_ok!(server.stop().await);
        assert_ok!(server.stop().await);
        assert_eq!(server.state(), ServerState::Stopped);
        assert_err!(endpoint.resolve());
    }
}

#[tokio::test]
async fn served_endpoint_goes_stale_after_stop() {
    let work = TempDir::new().unwrap();
    let config = HarnessConfig::default();
    let builder = Builder::new(Git::from_config(&config));
    let source = builder
        .build(&FixtureSpec::linear(2), &work.path().join("source"))
        .await
        .unwrap();

    let mut server = for_kind(TransportKind::Daemon, &work.path().join("served"), &config);
    server.start().await.unwrap();
    let endpoint = server.serve(&source).await.unwrap();
    assert!(endpoint.url().ends_with("/source.git"));
    assert!(endpoint.resolve().is_ok());

    server.stop().await.unwrap();
    assert!(endpoint.resolve().is_err());
}

#[tokio::test]
async fn ssh_without_configuration_is_skipped() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let scenario = Scenario::new("ssh", TransportKind::Ssh, clone_all());

    let report = orchestrator.run_scenario(&scenario).await;
    assert!(report.verdict.is_skipped(), "{:?}", report.verdict);
}

#[tokio::test]
async fn bundled_suite_runs_in_parallel() {
    let work = TempDir::new().unwrap();
    let suite = ScenarioSuite::load(fixture_path("suite.yaml")).unwrap();
    assert!(suite.validate().is_valid());

    let filter = TagFilter::parse("not ssh").unwrap();
    let report = harness(&work)
        .run_suite(&suite, &filter, ExecutionMode::Parallel { max: 3 })
        .await;

    assert_eq!(report.summary.total, suite.len() - 1);
    assert!(report.all_passed(), "{}", report.to_markdown());
    assert!(report.get("clone-ssh").is_none());

    let json = report.to_json().unwrap();
    assert!(json.contains("\"pull-conflict-file\""));
}

#[tokio::test]
#[ignore] // Requires HARNESS_SSH_URL pointing at a reachable account
async fn ssh_clone_and_push_round_trip() {
    let work = TempDir::new().unwrap();
    let config = HarnessConfig::from_env()
        .unwrap()
        .with_work_dir(work.path());
    let orchestrator = Orchestrator::new(config);

    for action in [clone_all(), Action::Push, Action::Pull { new_commits: 1 }] {
        let scenario = Scenario::new(format!("ssh-{}", action.name()), TransportKind::Ssh, action)
            .requiring_network();
        let report = orchestrator.run_scenario(&scenario).await;
        assert!(report.verdict.is_passed(), "{:?}", report.verdict);
    }
}

#[tokio::test]
#[ignore] // Waits for the connect timeout of a blackholed address
async fn blackholed_endpoint_times_out() {
    let work = TempDir::new().unwrap();
    let orchestrator = harness(&work);
    let timeout = Duration::from_secs(5);
    let scenario = Scenario::new("blackhole", TransportKind::Daemon, clone_all())
        .with_fault(FaultSpec::Unreachable {
            mode: vcs_conformance::UnreachableMode::Blackhole,
        })
        .with_timeout(timeout)
        .expecting(Expectation::failure(ErrorClass::Timeout));

    let report = orchestrator.run_scenario(&scenario).await;
    assert!(report.verdict.is_passed(), "{:?}", report.verdict);
    assert!(report.diagnostics.last().unwrap().duration() < timeout * 2);
}

#[tokio::test]
async fn ls_remote_lists_published_refs_over_http() {
    let work = TempDir::new().unwrap();
    let config = HarnessConfig::default();
    let builder = Builder::new(Git::from_config(&config));
    let source = builder
        .build(&FixtureSpec::linear(2).with_tags(), &work.path().join("source"))
        .await
        .unwrap();

    let mut server = for_kind(TransportKind::Http, &work.path().join("served"), &config);
    server.start().await.unwrap();
    let endpoint = server.serve(&source).await.unwrap();

    let driver = ClientDriver::from_config(&config);
    let refs = driver.ls_remote(&endpoint, &driver.options()).await.unwrap();
    let published = source.published_view();

    for (name, commit) in &published.refs {
        assert_eq!(refs.get(name), Some(commit), "{}", name);
    }
    assert_ok!(server.stop().await);
}

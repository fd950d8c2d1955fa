//! VCS Conformance CLI
//!
//! Runs a YAML scenario suite and prints a markdown verdict table.

use std::path::PathBuf;

use vcs_conformance::{
    ExecutionMode, HarnessConfig, Orchestrator, ScenarioSuite, TagFilter, Validate,
};

struct Args {
    suite: PathBuf,
    filter: TagFilter,
    parallel: Option<usize>,
    report: Option<PathBuf>,
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {} <suite.yaml> [--filter EXPR] [--parallel N] [--report out.json]\n\
         \n\
         Runs the conformance scenarios in the suite.\n\
         \n\
         Environment variables:\n\
         \x20 HARNESS_CONFIG                TOML file with base settings\n\
         \x20 HARNESS_CLIENT_BIN            client binary (default: git)\n\
         \x20 HARNESS_SERVER_BIN            server binary (default: git)\n\
         \x20 HARNESS_DEFAULT_TIMEOUT_SECS  per-invocation timeout\n\
         \x20 HARNESS_SSH_URL               ssh://user@host[:port]/base for SSH scenarios\n\
         \x20 HARNESS_SKIP_SSH=1            skip SSH scenarios\n\
         \x20 HARNESS_SKIP_NETWORK=1        skip scenarios that need the network\n\
         \x20 HARNESS_PARALLELISM           concurrent scenarios\n\
         \x20 HARNESS_WORK_DIR              parent of scenario working directories",
        program
    )
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let program = args.first().map(String::as_str).unwrap_or("vcs-conformance");
    let mut suite = None;
    let mut filter = TagFilter::default();
    let mut parallel = None;
    let mut report = None;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--filter" => {
                let expr = iter.next().ok_or("--filter needs an expression")?;
                filter = TagFilter::parse(expr).map_err(|e| e.to_string())?;
            }
            "--parallel" => {
                let n = iter.next().ok_or("--parallel needs a number")?;
                parallel = Some(
                    n.parse()
                        .map_err(|_| format!("--parallel expects a number, got '{}'", n))?,
                );
            }
            "--report" => {
                let path = iter.next().ok_or("--report needs a path")?;
                report = Some(PathBuf::from(path));
            }
            "-h" | "--help" => return Err(usage(program)),
            other if other.starts_with("--") => {
                return Err(format!("unknown option '{}'\n\n{}", other, usage(program)))
            }
            other => {
                if suite.is_some() {
                    return Err(format!("unexpected argument '{}'", other));
                }
                suite = Some(PathBuf::from(other));
            }
        }
    }

    Ok(Args {
        suite: suite.ok_or_else(|| usage(program))?,
        filter,
        parallel,
        report,
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            std::process::exit(2);
        }
    };

    let mut config = match HarnessConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    if let Some(n) = args.parallel {
        config = config.with_parallelism(n);
    }
    match config.validate().into_result() {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(warning = %warning, "configuration warning");
            }
        }
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    }

    let suite = match ScenarioSuite::load(&args.suite) {
        Ok(suite) => suite,
        Err(e) => {
            eprintln!("Failed to load suite {}: {}", args.suite.display(), e);
            std::process::exit(2);
        }
    };
    match suite.validate().into_result() {
        Ok(warnings) => {
            for warning in warnings {
                tracing::warn!(warning = %warning, "suite warning");
            }
        }
        Err(e) => {
            eprintln!("Invalid suite {}: {}", args.suite.display(), e);
            std::process::exit(2);
        }
    }

    let mode = ExecutionMode::from_parallelism(config.parallelism);
    tracing::info!(suite = ?args.suite, mode = ?mode, "running conformance suite");

    let orchestrator = Orchestrator::new(config);
    let report = orchestrator.run_suite(&suite, &args.filter, mode).await;

    println!("{}", report.to_markdown());

    if let Some(path) = &args.report {
        if let Err(e) = report.write_json(path) {
            eprintln!("Failed to write report {}: {}", path.display(), e);
            std::process::exit(1);
        }
        tracing::info!(path = ?path, "wrote JSON report");
    }

    if !report.all_passed() {
        std::process::exit(1);
    }
}

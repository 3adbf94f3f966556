//! Package Library - pipeline CLI
//!
//! The `library` command runs the build/release pipeline and lets operators
//! fire its triggers by hand.
//!
//! ## Commands
//!
//! - `serve`: run the periodic scheduler until Ctrl-C
//! - `package-built`: accept a package build callback
//! - `distro-staged` / `distro-passed`: accept a distro promotion callback
//! - `sweep-prs`, `reindex`, `cleanup`: run one periodic job now
//! - `runs`: list recorded chain executions

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use library_core::telemetry::{init_tracing, LogFormat};
use library_core::{CommandIndexer, DistroBuildRequest, PackageBuildRequest, Settings};
use library_github::{GitHubApi, RestGitHub};
use library_pipeline::{Completed, Job, Orchestrator, Scheduler, Services, WorkerPool};
use library_state::{BuildTarget, Gate, SurrealStore, TaskLedger, TaskStatus};
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "library")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Package library build/release pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and command output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the periodic scheduler (PR sweep, reindex, cleanup) until Ctrl-C
    Serve,

    /// Accept a package build callback and wait for its chains
    PackageBuilt(PackageArgs),

    /// Accept a staged promotion callback and wait for its chain
    DistroStaged(DistroArgs),

    /// Accept a passed promotion callback and wait for its chain
    DistroPassed(DistroArgs),

    /// Sweep every epoch for builds ready for integration
    SweepPrs,

    /// Reindex every tested and staged channel
    Reindex,

    /// Purge old task results of the periodic chains
    Cleanup,

    /// List recorded chain executions (newest first)
    Runs {
        /// Only show failed runs
        #[arg(long)]
        failed: bool,

        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Args, Debug)]
struct PackageArgs {
    /// Registration token of the package
    #[arg(long, env = "LIBRARY_PACKAGE_TOKEN", hide_env_values = true)]
    token: String,

    /// CI run that produced the artifact
    #[arg(long)]
    run_id: String,

    #[arg(long)]
    version: String,

    #[arg(long)]
    package_name: String,

    /// `owner/repo` of the package's CI project
    #[arg(long)]
    repository: String,

    /// `linux-64` or `osx-64`
    #[arg(long)]
    artifact_name: String,

    /// `dev` or `release`
    #[arg(long, default_value = "dev")]
    build_target: BuildTarget,
}

impl From<PackageArgs> for PackageBuildRequest {
    fn from(args: PackageArgs) -> Self {
        Self {
            token: args.token,
            run_id: args.run_id,
            version: args.version,
            package_name: args.package_name,
            repository: args.repository,
            artifact_name: args.artifact_name,
            build_target: args.build_target,
        }
    }
}

#[derive(Args, Debug)]
struct DistroArgs {
    /// Shared secret of the integration repository
    #[arg(long, env = "INTEGRATION_REPO_TOKEN", hide_env_values = true)]
    token: String,

    #[arg(long)]
    version: String,

    /// CI run that produced the artifact
    #[arg(long)]
    run_id: String,

    #[arg(long)]
    distro: String,

    #[arg(long)]
    epoch: String,

    /// `<distro>-linux` or `<distro>-osx`
    #[arg(long)]
    artifact_name: String,

    /// Integration PR the build came from
    #[arg(long)]
    pr_number: Option<u64>,

    /// Package version to promote, as `name=version` (repeatable)
    #[arg(long = "package", value_parser = parse_package_version)]
    packages: Vec<(String, String)>,
}

impl From<DistroArgs> for DistroBuildRequest {
    fn from(args: DistroArgs) -> Self {
        Self {
            token: args.token,
            version: args.version,
            run_id: args.run_id,
            distro_name: args.distro,
            epoch_name: args.epoch,
            artifact_name: args.artifact_name,
            pr_number: args.pr_number,
            package_versions: args.packages.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }
}

fn parse_package_version(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, version)) if !name.trim().is_empty() && !version.trim().is_empty() => {
            Ok((name.trim().to_string(), version.trim().to_string()))
        }
        _ => Err(format!("expected name=version, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(LogFormat::from_json_flag(cli.json), level);

    let orchestrator = connect().await?;

    match cli.command {
        Commands::Serve => cmd_serve(orchestrator).await,
        Commands::PackageBuilt(args) => cmd_package_built(&orchestrator, args.into()).await,
        Commands::DistroStaged(args) => {
            cmd_distro_built(&orchestrator, args.into(), Gate::Staged).await
        }
        Commands::DistroPassed(args) => {
            cmd_distro_built(&orchestrator, args.into(), Gate::Passed).await
        }
        Commands::SweepPrs => cmd_job(&orchestrator, Job::HandlePrs).await,
        Commands::Reindex => cmd_job(&orchestrator, Job::Reindex).await,
        Commands::Cleanup => cmd_job(&orchestrator, Job::Cleanup).await,
        Commands::Runs { failed, limit } => cmd_runs(&orchestrator, failed, limit, cli.json).await,
    }
}

/// Wire the production collaborators from the environment.
async fn connect() -> Result<Arc<Orchestrator>> {
    let settings = Arc::new(Settings::from_env());
    let store = Arc::new(
        SurrealStore::from_env()
            .await
            .context("Failed to connect to library database")?
            .with_lock_lease(settings.git_retry.ceiling),
    );
    let github: Arc<dyn GitHubApi> =
        Arc::new(RestGitHub::from_settings(&settings).context("Failed to build GitHub client")?);
    let indexer = Arc::new(CommandIndexer::new(
        settings.reindex_command.clone(),
        settings.reindex_timeout,
    ));

    let services = Services::new(
        settings,
        store.clone(),
        store.clone(),
        github,
        store,
        indexer,
    );
    Ok(Arc::new(Orchestrator::new(
        Arc::new(services),
        WorkerPool::default(),
    )))
}

async fn cmd_serve(orchestrator: Arc<Orchestrator>) -> Result<()> {
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!(error = %e, "cannot listen for Ctrl-C, stopping"),
        }
    };
    Scheduler::new(orchestrator).run(shutdown).await;
    Ok(())
}

async fn cmd_package_built(orchestrator: &Orchestrator, request: PackageBuildRequest) -> Result<()> {
    let results = orchestrator
        .accept_package_build(&request)
        .await
        .context("package build rejected")?
        .join()
        .await;

    let mut failed = 0;
    for result in results {
        match result {
            Ok(done) => report(&done),
            Err(e) => {
                failed += 1;
                println!("failed: {e}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} package build chain(s) failed");
    }
    Ok(())
}

async fn cmd_distro_built(
    orchestrator: &Orchestrator,
    request: DistroBuildRequest,
    gate: Gate,
) -> Result<()> {
    let done = orchestrator
        .accept_distro_build(&request, gate)
        .context("distro build rejected")?
        .await
        .context("promotion chain did not finish")??;
    report(&done);
    Ok(())
}

async fn cmd_job(orchestrator: &Orchestrator, job: Job) -> Result<()> {
    let outcome = job.run(orchestrator).await.with_context(|| format!("{job} failed to start"))?;
    println!(
        "{job}: {} succeeded, {} failed",
        outcome.succeeded, outcome.failed
    );
    if outcome.failed > 0 {
        bail!("{} {job} chain(s) failed", outcome.failed);
    }
    Ok(())
}

async fn cmd_runs(orchestrator: &Orchestrator, failed: bool, limit: usize, json: bool) -> Result<()> {
    let status = failed.then_some(TaskStatus::Failed);
    let runs = orchestrator
        .services()
        .ledger
        .list_runs(status)
        .await
        .context("failed to list runs")?;
    let runs: Vec<_> = runs.into_iter().take(limit).collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in &runs {
        println!(
            "{} {:<9} {} [{}]",
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            run.status,
            run.chain,
            run.subject
        );
        if let Some(error) = &run.error {
            println!("    {error}");
        }
    }
    Ok(())
}

fn report<X>(done: &Completed<X>) {
    println!("completed run {}", done.run_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_package_version_parser() {
        assert_eq!(
            parse_package_version("q2-types=2024.10.0").unwrap(),
            ("q2-types".to_string(), "2024.10.0".to_string())
        );
        assert!(parse_package_version("q2-types").is_err());
        assert!(parse_package_version("=1.0").is_err());
    }

    #[test]
    fn test_distro_args_become_request() {
        let cli = Cli::try_parse_from([
            "library",
            "distro-staged",
            "--token",
            "secret",
            "--version",
            "2024.10.0.dev1",
            "--run-id",
            "2002",
            "--distro",
            "core",
            "--epoch",
            "2024.10",
            "--artifact-name",
            "core-linux",
            "--pr-number",
            "7",
            "--package",
            "q2-types=1.0",
            "--package",
            "q2-feature-table=1.1",
        ])
        .unwrap();

        let Commands::DistroStaged(args) = cli.command else {
            panic!("expected distro-staged");
        };
        let request: DistroBuildRequest = args.into();
        assert_eq!(request.distro_name, "core");
        assert_eq!(request.pr_number, Some(7));
        assert_eq!(request.package_versions.len(), 2);
        assert_eq!(request.package_versions["q2-types"], "1.0");
    }

    #[test]
    fn test_package_build_target_defaults_to_dev() {
        let cli = Cli::try_parse_from([
            "library",
            "package-built",
            "--token",
            "t",
            "--run-id",
            "1001",
            "--version",
            "1.0",
            "--package-name",
            "q2-types",
            "--repository",
            "qiime2/q2-types",
            "--artifact-name",
            "linux-64",
        ])
        .unwrap();
        let Commands::PackageBuilt(args) = cli.command else {
            panic!("expected package-built");
        };
        let request: PackageBuildRequest = args.into();
        assert_eq!(request.build_target, BuildTarget::Dev);
    }

    #[test]
    fn test_unknown_build_target_is_rejected() {
        let parsed = Cli::try_parse_from([
            "library",
            "package-built",
            "--token",
            "t",
            "--run-id",
            "1001",
            "--version",
            "1.0",
            "--package-name",
            "q2-types",
            "--repository",
            "qiime2/q2-types",
            "--artifact-name",
            "linux-64",
            "--build-target",
            "nightly",
        ]);
        assert!(parsed.is_err());
    }
}

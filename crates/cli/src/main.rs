//! `watchdex`: watched-root scheduling and indexing coordinator.
//!
//! Admin surface over the registry plus the scheduler entry point:
//!
//! - `register` / `list` / `transition`: manage watched roots
//! - `pause` / `resume`: suspend and restore scheduling per root
//! - `scan-now`: one immediate scan, with `--dry-run` to preview changes
//! - `status`: per-root health from the last persisted snapshot
//! - `run`: the scheduling loop, client (`--executor <id>`) or server
//!   (`--server`, which competes for the singleton lease)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use watchdex_locks::{LeaseCoordinator, LockConfig, LockManager};
use watchdex_registry::{
    ExecutionScope, NewRoot, Requester, RootFilter, RootId, RootRegistry,
};
use watchdex_scanner::{ExecutorConfig, ScanExecutor};
use watchdex_scheduler::{load_health_snapshot, Scheduler, SchedulerConfig, StatusStore};

mod indexer;

use indexer::LocalIndexer;

#[derive(Debug, Parser)]
#[command(
    name = "watchdex",
    version,
    about = "Watched-root scheduling and indexing coordinator"
)]
struct Cli {
    /// State directory holding the registry, scan baselines and health
    /// snapshots.
    #[arg(long, global = true, default_value = ".watchdex")]
    state_dir: PathBuf,

    /// Act with the server identity.
    #[arg(long, global = true, conflicts_with = "executor")]
    server: bool,

    /// Client executor identity to act as.
    #[arg(long, global = true)]
    executor: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn requester(&self) -> Result<Requester> {
        if self.server {
            Ok(Requester::server())
        } else if let Some(executor) = &self.executor {
            Ok(Requester::client(executor.clone()))
        } else {
            bail!("pass --executor <id> for a client identity, or --server");
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScopeArg {
    Client,
    Server,
}

impl From<ScopeArg> for ExecutionScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Client => ExecutionScope::Client,
            ScopeArg::Server => ExecutionScope::Server,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a directory for scheduled indexing.
    Register {
        path: String,
        /// Scope override; defaults to the caller's own scope.
        #[arg(long)]
        scope: Option<ScopeArg>,
        /// Owning executor, when registering a client root on another
        /// executor's behalf.
        #[arg(long)]
        owner: Option<String>,
        /// Scan interval in seconds.
        #[arg(long)]
        schedule_secs: Option<u64>,
        /// Concurrent scans allowed for this root.
        #[arg(long)]
        max_concurrency: Option<u32>,
    },
    /// List watched roots for the calling identity.
    List {
        /// List every root regardless of scope or owner.
        #[arg(long)]
        all: bool,
    },
    /// Report per-root health from the last persisted snapshot.
    Status {
        /// Root id; omit for all roots.
        root: Option<String>,
    },
    /// Suspend scheduling for a root. An in-flight scan finishes on its own.
    Pause { root: String },
    /// Restore scheduling for a paused root.
    Resume { root: String },
    /// Run one scan immediately, outside the schedule.
    ScanNow {
        root: String,
        /// Report what the scan would change without dispatching anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Move a root between client and server ownership.
    Transition {
        root: String,
        /// Target scope.
        #[arg(long, value_enum)]
        to: ScopeArg,
        /// Target executor, required when transitioning to client scope.
        #[arg(long)]
        owner: Option<String>,
    },
    /// Run the scheduling loop until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let registry = Arc::new(
        RootRegistry::open(&cli.state_dir)
            .await
            .with_context(|| format!("opening state dir {}", cli.state_dir.display()))?,
    );

    match &cli.command {
        Command::Register {
            path,
            scope,
            owner,
            schedule_secs,
            max_concurrency,
        } => {
            let root = registry
                .register(
                    NewRoot {
                        path: path.clone(),
                        scope: scope.map(Into::into),
                        executor_id: owner.clone(),
                        schedule_secs: *schedule_secs,
                        max_concurrency: *max_concurrency,
                    },
                    &cli.requester()?,
                )
                .await?;
            print_json(&root)
        }
        Command::List { all } => {
            let filter = if *all {
                RootFilter::default()
            } else {
                RootFilter::for_requester(&cli.requester()?)
            };
            print_json(&registry.list(&filter).await)
        }
        Command::Status { root } => {
            let snapshot = load_health_snapshot(&cli.state_dir).await?;
            match root {
                Some(id) => {
                    let root_id = RootId::from(id.as_str());
                    let entry = snapshot
                        .into_iter()
                        .find(|health| health.root_id == root_id)
                        .with_context(|| format!("no recorded health for root {id}"))?;
                    print_json(&entry)
                }
                None => print_json(&snapshot),
            }
        }
        Command::Pause { root } => {
            let updated = registry
                .set_paused(&RootId::from(root.as_str()), &cli.requester()?, true)
                .await?;
            print_json(&updated)
        }
        Command::Resume { root } => {
            let updated = registry
                .set_paused(&RootId::from(root.as_str()), &cli.requester()?, false)
                .await?;
            print_json(&updated)
        }
        Command::ScanNow { root, dry_run } => scan_now(&cli, &registry, root, *dry_run).await,
        Command::Transition { root, to, owner } => {
            let updated = registry
                .transition_scope(
                    &RootId::from(root.as_str()),
                    &cli.requester()?,
                    (*to).into(),
                    owner.clone(),
                )
                .await?;
            print_json(&updated)
        }
        Command::Run => run_loop(&cli, registry).await,
    }
}

/// One-shot scan: same guard → lock → execute → record sequence the
/// scheduler's dispatch path follows, awaited to completion so the outcome
/// can be printed.
async fn scan_now(cli: &Cli, registry: &Arc<RootRegistry>, root: &str, dry_run: bool) -> Result<()> {
    let requester = cli.requester()?;
    let root_id = RootId::from(root);
    let root = registry.authorize(&root_id, &requester).await?;

    // The lock table lives in the state dir, so this one-shot contends with
    // any scheduler loop running against the same state.
    let locks = LockManager::open(&cli.state_dir, LockConfig::default());
    let token = locks.acquire_slot(
        root.root_id.as_str(),
        root.max_concurrency,
        requester.to_string(),
        None,
    )?;

    let root = if dry_run {
        root
    } else {
        registry.mark_scan_started(&root_id, &requester).await?
    };

    let indexer = Arc::new(LocalIndexer::new(&cli.state_dir));
    let executor = ScanExecutor::new(&cli.state_dir, indexer, ExecutorConfig::default());
    let result = executor.execute(&root, dry_run).await;
    locks.release(&token);

    let outcome = result?;
    if !dry_run {
        registry
            .record_outcome(&root_id, &requester, outcome.succeeded())
            .await?;
    }
    print_json(&outcome)
}

async fn run_loop(cli: &Cli, registry: Arc<RootRegistry>) -> Result<()> {
    let requester = cli.requester()?;
    let config = SchedulerConfig::default();
    let locks = Arc::new(LockManager::open(&cli.state_dir, LockConfig::default()));
    let status = Arc::new(StatusStore::new(&cli.state_dir, config.failure_threshold));
    let indexer = Arc::new(LocalIndexer::new(&cli.state_dir));
    let executor = Arc::new(ScanExecutor::new(
        &cli.state_dir,
        indexer,
        ExecutorConfig::default(),
    ));

    let scheduler = match &requester.executor_id {
        Some(executor_id) => Scheduler::client(
            registry,
            locks,
            executor,
            status,
            config,
            executor_id.clone(),
        ),
        None => Scheduler::server(
            registry,
            locks,
            executor,
            status,
            config,
            LeaseCoordinator::new(&cli.state_dir),
        ),
    };

    log::info!("Scheduler running as {requester}; press Ctrl-C to stop");
    let handle = scheduler.start();
    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn register_parses_schedule_and_owner() {
        let cli = Cli::try_parse_from([
            "watchdex",
            "--executor",
            "laptop-1",
            "register",
            "/data/docs",
            "--schedule-secs",
            "600",
        ])
        .unwrap();
        let requester = cli.requester().unwrap();
        assert_eq!(requester, Requester::client("laptop-1"));
        match cli.command {
            Command::Register {
                path,
                schedule_secs,
                owner,
                ..
            } => {
                assert_eq!(path, "/data/docs");
                assert_eq!(schedule_secs, Some(600));
                assert_eq!(owner, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn server_and_executor_are_mutually_exclusive() {
        assert!(Cli::try_parse_from([
            "watchdex",
            "--server",
            "--executor",
            "laptop-1",
            "list"
        ])
        .is_err());
    }

    #[test]
    fn missing_identity_is_rejected_lazily() {
        // Parsing succeeds without an identity; the mutation then refuses.
        let cli = Cli::try_parse_from(["watchdex", "pause", "r1"]).unwrap();
        assert!(cli.requester().is_err());

        let cli = Cli::try_parse_from(["watchdex", "--server", "pause", "r1"]).unwrap();
        assert_eq!(cli.requester().unwrap(), Requester::server());
    }
}

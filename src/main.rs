use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use conductor::artifacts::{self, ArtifactKind};
use conductor::checkpoint::{CheckpointCoordinator, TaskOutcome};
use conductor::errors::{ConfigError, CoreError, CoreResult, FsmError};
use conductor::fsm;
use conductor::halt::HaltController;
use conductor::metrics::{self, TokenUsage};
use conductor::phase::PhaseController;
use conductor::state::recovery;
use conductor::state::store::StateStore;
use conductor::status::StatusSummary;
use conductor::tasks::{self, dag, TaskLifecycle};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Task-decomposition orchestration engine")]
struct Cli {
    /// Planning directory holding state.json
    #[arg(long, global = true, default_value = ".")]
    planning_dir: PathBuf,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the planning directory skeleton and initial state
    Init {
        /// Code repository the plan targets
        target_dir: PathBuf,
    },
    /// Emit the derived status summary
    Status {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
    /// Run the schema check for a planning artifact and record the outcome
    Validate {
        /// One of: capability_map, physical_map, dependency_graph
        artifact: String,
    },
    /// Attempt the next phase transition
    Advance,
    /// Re-read task definitions from tasks/
    LoadTasks,
    /// Print the ready set, one ID:name per line
    ReadyTasks,
    /// Transition a task to running
    StartTask { id: String },
    /// Transition a running task to complete
    CompleteTask {
        id: String,
        /// Files the task created
        #[arg(long, value_delimiter = ',')]
        created: Vec<String>,
        /// Files the task modified
        #[arg(long, value_delimiter = ',')]
        modified: Vec<String>,
    },
    /// Transition a running task to failed
    FailTask {
        id: String,
        message: String,
        #[arg(long, default_value = "general")]
        category: String,
        #[arg(long)]
        retryable: bool,
    },
    /// Reset a retryable failed task to pending
    RetryTask { id: String },
    /// Skip a task that has not run
    SkipTask { id: String, reason: String },
    /// Request a cooperative halt
    Halt { reason: Option<String> },
    /// Exit 1 iff a halt is requested
    CheckHalt,
    /// Acknowledge the halt after the in-flight batch drained
    ConfirmHalt,
    /// Show the halt subsystem state
    HaltStatus,
    /// Clear halt triggers and resume execution
    Resume,
    /// Batch checkpoint operations
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Accumulate token usage for an agent session
    LogTokens {
        session: String,
        input: u64,
        output: u64,
        cost: f64,
    },
    /// Recover state.json from corruption
    Recover,
    /// Behavior-model operations
    Fsm {
        #[command(subcommand)]
        command: FsmCommands,
    },
}

#[derive(Subcommand)]
enum CheckpointCommands {
    /// Record a new batch
    Create {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Move a task to the list its outcome indicates
    Update {
        id: String,
        /// success or failed
        outcome: String,
    },
    /// Mark the batch complete
    Complete,
    /// Print the current checkpoint
    Status,
    /// Reconcile the checkpoint with worker result files
    Recover,
    /// Remove the checkpoint file
    Clear,
}

#[derive(Subcommand)]
enum FsmCommands {
    /// Compile a workflow or capability map into a state machine
    Compile {
        /// Workflow JSON (or capability map with --capability-map)
        input: PathBuf,
        /// Output directory (default: <planning-dir>/artifacts/fsm)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Treat the input as a capability map
        #[arg(long)]
        capability_map: bool,
    },
    /// Check structural invariants over an exported model
    Validate {
        /// Model directory (default: <planning-dir>/artifacts/fsm)
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long, default_value_t = 100.0)]
        steel_threshold: f64,
        #[arg(long, default_value_t = 90.0)]
        threshold: f64,
        /// JSON array of task-declared transition IDs
        #[arg(long)]
        coverage_file: Option<PathBuf>,
        /// Gather declared transition IDs from tasks/*.json
        #[arg(long)]
        coverage: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{}", err.render());
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let default = if verbose { "conductor=debug" } else { "conductor=warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> CoreResult<i32> {
    let store = StateStore::new(&cli.planning_dir);

    match &cli.command {
        Commands::Init { target_dir } => {
            let target = fs::canonicalize(target_dir)
                .unwrap_or_else(|_| target_dir.clone())
                .display()
                .to_string();
            let (doc, created) = store.init(&target)?;
            if created {
                println!("Initialized planning directory for {}", doc.target_dir);
            } else {
                println!("Planning directory already initialized for {}", doc.target_dir);
            }
            Ok(0)
        }
        Commands::Status { json } => {
            let doc = store.load()?;
            let summary = StatusSummary::from_document(&doc);
            if *json {
                println!("{}", to_json(&summary)?);
            } else {
                print!("{}", summary.render_text(&doc));
            }
            Ok(0)
        }
        Commands::Validate { artifact } => {
            let kind: ArtifactKind = artifact.parse()?;
            let record = artifacts::validate_artifact(&store, kind)?;
            println!("{}", to_json(&record)?);
            if record.valid {
                Ok(0)
            } else {
                Err(artifacts::schema_failure(kind, &record))
            }
        }
        Commands::Advance => {
            let controller = PhaseController::new(&store);
            let (from, to) = controller.advance()?;
            println!("{}", serde_json::json!({ "from": from, "to": to }));
            Ok(0)
        }
        Commands::LoadTasks => {
            let report = tasks::load_tasks(&store)?;
            println!(
                "{}",
                serde_json::json!({
                    "added": report.added,
                    "refreshed": report.refreshed,
                    "removed": report.removed,
                    "total": report.total,
                })
            );
            Ok(0)
        }
        Commands::ReadyTasks => {
            let doc = store.load()?;
            for task in dag::ready_tasks(&doc) {
                println!("{}:{}", task.id, task.name);
            }
            Ok(0)
        }
        Commands::StartTask { id } => {
            let task = TaskLifecycle::new(&store).start_task(id)?;
            println!("{}", to_json(&task)?);
            Ok(0)
        }
        Commands::CompleteTask { id, created, modified } => {
            let task =
                TaskLifecycle::new(&store).complete_task(id, created.clone(), modified.clone())?;
            println!("{}", to_json(&task)?);
            Ok(0)
        }
        Commands::FailTask {
            id,
            message,
            category,
            retryable,
        } => {
            let task = TaskLifecycle::new(&store).fail_task(id, message, category, *retryable)?;
            println!("{}", to_json(&task)?);
            Ok(0)
        }
        Commands::RetryTask { id } => {
            let task = TaskLifecycle::new(&store).retry_task(id)?;
            println!("{}", to_json(&task)?);
            Ok(0)
        }
        Commands::SkipTask { id, reason } => {
            let task = TaskLifecycle::new(&store).skip_task(id, reason)?;
            println!("{}", to_json(&task)?);
            Ok(0)
        }
        Commands::Halt { reason } => {
            let reason = reason.as_deref().unwrap_or("operator requested");
            HaltController::new(&store).request_halt(reason, "cli")?;
            println!("halt requested: {reason}");
            Ok(0)
        }
        Commands::CheckHalt => {
            let halted = HaltController::new(&store).check_halt()?;
            println!("{}", serde_json::json!({ "halted": halted }));
            Ok(if halted { 1 } else { 0 })
        }
        Commands::ConfirmHalt => {
            HaltController::new(&store).confirm_halt()?;
            println!("halt confirmed");
            Ok(0)
        }
        Commands::HaltStatus => {
            let status = HaltController::new(&store).halt_status()?;
            println!("{}", to_json(&status)?);
            Ok(0)
        }
        Commands::Resume => {
            HaltController::new(&store).resume()?;
            println!("resumed");
            Ok(0)
        }
        Commands::Checkpoint { command } => run_checkpoint(&store, command),
        Commands::LogTokens {
            session,
            input,
            output,
            cost,
        } => {
            let (total_tokens, total_cost) = metrics::log_tokens(
                &store,
                TokenUsage {
                    session: session.clone(),
                    input_tokens: *input,
                    output_tokens: *output,
                    cost_usd: *cost,
                },
            )?;
            println!(
                "{}",
                serde_json::json!({
                    "total_tokens": total_tokens,
                    "total_cost_usd": total_cost,
                })
            );
            Ok(0)
        }
        Commands::Recover => {
            let report = recovery::recover(&store)?;
            println!(
                "{}",
                serde_json::json!({
                    "rebuilt": report.rebuilt,
                    "backup": report.backup_path.as_ref().map(|p| p.display().to_string()),
                    "data_lost": report.data_lost,
                    "merged_tasks": report.merged_tasks,
                })
            );
            Ok(0)
        }
        Commands::Fsm { command } => run_fsm(cli, command),
    }
}

fn run_checkpoint(store: &StateStore, command: &CheckpointCommands) -> CoreResult<i32> {
    let coordinator = CheckpointCoordinator::new(store.dir());
    match command {
        CheckpointCommands::Create { ids } => {
            let checkpoint = coordinator.create(ids.clone())?;
            println!("{}", to_json(&checkpoint)?);
            Ok(0)
        }
        CheckpointCommands::Update { id, outcome } => {
            let outcome: TaskOutcome = outcome.parse()?;
            let checkpoint = coordinator.update(id, outcome)?;
            println!("{}", to_json(&checkpoint)?);
            Ok(0)
        }
        CheckpointCommands::Complete => {
            let checkpoint = coordinator.complete()?;
            println!("{}", to_json(&checkpoint)?);
            Ok(0)
        }
        CheckpointCommands::Status => {
            let checkpoint = coordinator.load()?;
            println!("{}", to_json(&checkpoint)?);
            Ok(0)
        }
        CheckpointCommands::Recover => {
            let doc = store.load()?;
            let recovery = coordinator.recover(&doc)?;
            println!("{}", to_json(&recovery)?);
            // Drift means the checkpoint disagreed with on-disk reality;
            // regeneration is advisable.
            Ok(if recovery.has_drift() { 2 } else { 0 })
        }
        CheckpointCommands::Clear => {
            coordinator.clear()?;
            println!("checkpoint cleared");
            Ok(0)
        }
    }
}

fn run_fsm(cli: &Cli, command: &FsmCommands) -> CoreResult<i32> {
    match command {
        FsmCommands::Compile {
            input,
            out,
            capability_map,
        } => {
            let raw = fs::read_to_string(input).map_err(|source| CoreError::ReadFailed {
                path: input.clone(),
                source,
            })?;

            let (machines, primary) = if *capability_map {
                let doc: conductor::fsm::model::CapabilityMapDoc = serde_json::from_str(&raw)
                    .map_err(|e| FsmError::CompileFailed {
                        workflow: input.display().to_string(),
                        detail: e.to_string(),
                    })?;
                fsm::compile_capability_map(&doc)?
            } else {
                let doc: conductor::fsm::model::WorkflowDoc = serde_json::from_str(&raw)
                    .map_err(|e| FsmError::CompileFailed {
                        workflow: input.display().to_string(),
                        detail: e.to_string(),
                    })?;
                let machine = fsm::compile_workflow(&doc)?;
                let slug = machine.slug.clone();
                (vec![machine], Some(slug))
            };

            // The index checksum covers the raw spec when one is ingested,
            // the compiler input otherwise.
            let spec_path = cli.planning_dir.join("inputs").join("spec.md");
            let spec_text = fs::read_to_string(&spec_path).unwrap_or(raw);

            let out_dir = out
                .clone()
                .unwrap_or_else(|| cli.planning_dir.join("artifacts").join("fsm"));
            let index =
                fsm::export_machines(&out_dir, &machines, primary.as_deref(), &spec_text)?;
            println!("{}", to_json(&index)?);
            Ok(0)
        }
        FsmCommands::Validate {
            dir,
            steel_threshold,
            threshold,
            coverage_file,
            coverage,
        } => {
            let model_dir = dir
                .clone()
                .unwrap_or_else(|| cli.planning_dir.join("artifacts").join("fsm"));
            let config = fsm::ValidatorConfig {
                steel_threshold: *steel_threshold,
                other_threshold: *threshold,
            };

            let declared: Option<BTreeSet<String>> = match (coverage_file, coverage) {
                (Some(path), _) => {
                    let raw = fs::read_to_string(path).map_err(|source| CoreError::ReadFailed {
                        path: path.clone(),
                        source,
                    })?;
                    let ids: Vec<String> =
                        serde_json::from_str(&raw).map_err(|e| ConfigError::Invalid(format!(
                            "coverage file must be a JSON array of transition IDs: {e}"
                        )))?;
                    Some(ids.into_iter().collect())
                }
                (None, true) => Some(fsm::validator::collect_declared_transitions(
                    &cli.planning_dir,
                )?),
                (None, false) => None,
            };

            let report = fsm::validate_dir(&model_dir, &config, declared.as_ref())?;
            println!("{}", to_json(&report)?);
            if report.passed() {
                Ok(0)
            } else {
                Err(FsmError::ValidationFailed {
                    errors: report.errors,
                }
                .into())
            }
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> CoreResult<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("output serialization: {e}")))
}

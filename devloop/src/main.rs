//! Stateful workflow engine for autonomous software development.
//!
//! Drives a design document through a fixed graph of worker nodes, one
//! checkpointed step at a time, pausing for human approval before sensitive
//! commands and before pushing.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use devloop::control::{abort_run, latest_run, pending_approvals, resolve_approval, summarize};
use devloop::core::types::Decision;
use devloop::engine::{Engine, StepOutcome};
use devloop::error::{DeltaRejectedError, TopologyError};
use devloop::exit_codes;
use devloop::io::checkpoint::{CheckpointRef, Checkpointer};
use devloop::io::clock::{Clock, SystemClock};
use devloop::io::config::{EngineConfig, load_config};
use devloop::io::design_doc::load_design;
use devloop::io::git::Git;
use devloop::io::init::{EnginePaths, InitOptions, init_engine};
use devloop::io::llm::CommandLlmClient;
use devloop::io::run_store::RunStore;
use devloop::io::sandbox::LocalSandbox;
use devloop::logging;
use devloop::looping::{LoopControl, LoopStop, run_loop};
use devloop::nodes::Capabilities;
use devloop::start::start_run;

#[derive(Parser)]
#[command(
    name = "devloop",
    version,
    about = "Checkpointed workflow engine for autonomous software development"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.devloop/` with a default config and a DESIGN.md placeholder.
    Init {
        /// Overwrite the existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a new run for a design document.
    Start {
        /// Design document (defaults to DESIGN.md).
        #[arg(long)]
        design: Option<PathBuf>,
    },
    /// Advance a run by one node.
    Step {
        /// Run id (defaults to the most recent run).
        #[arg(long)]
        run: Option<String>,
    },
    /// Advance a run until it finishes, suspends or halts.
    Run {
        #[arg(long)]
        run: Option<String>,
        /// Stop after this many steps.
        #[arg(long)]
        max_steps: Option<u32>,
    },
    /// Show a run's position, status and work items.
    Status {
        #[arg(long)]
        run: Option<String>,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// List unresolved approval requests across all runs.
    Approvals,
    /// Decide on a pending approval request.
    Resolve {
        run: String,
        request: String,
        decision: DecisionArg,
        /// Why the request was rejected.
        #[arg(long)]
        reason: Option<String>,
        /// Replacement payload for `edit` (commands or commit message).
        #[arg(long)]
        payload: Option<String>,
    },
    /// Fail a run immediately and release its sandbox.
    Abort {
        run: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// List a run's checkpoints.
    Checkpoints { run: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DecisionArg {
    Approve,
    Reject,
    Edit,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    let paths = EnginePaths::new(&root);
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Start { design } => cmd_start(&paths, design),
        Command::Step { run } => cmd_step(&paths, run),
        Command::Run { run, max_steps } => cmd_run(&paths, run, max_steps),
        Command::Status { run, json } => cmd_status(&paths, run, json),
        Command::Approvals => cmd_approvals(&paths),
        Command::Resolve {
            run,
            request,
            decision,
            reason,
            payload,
        } => cmd_resolve(&paths, &run, &request, decision, reason, payload),
        Command::Abort { run, reason } => cmd_abort(&paths, &run, reason.as_deref()),
        Command::Checkpoints { run } => cmd_checkpoints(&paths, &run),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_engine(root, &InitOptions { force })?;
    println!("initialized {}", paths.devloop_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_start(paths: &EnginePaths, design: Option<PathBuf>) -> Result<i32> {
    let design_path = design.unwrap_or_else(|| paths.design_path.clone());
    let design = load_design(&design_path)?;
    let started = start_run(paths, design, SystemClock.now())?;
    println!("{}", started.state.run_id);
    Ok(exit_codes::OK)
}

fn cmd_step(paths: &EnginePaths, run: Option<String>) -> Result<i32> {
    let run_id = resolve_run(paths, run)?;
    with_engine(paths, &run_id, |engine| {
        let state = engine.store().load(CheckpointRef::Latest)?;
        match engine.advance(state) {
            Ok(step) => {
                print_step(&step);
                Ok(exit_codes::for_status(step.state.status))
            }
            Err(err) if is_rejection(&err) => {
                eprintln!("{err:#}");
                Ok(exit_codes::HALTED)
            }
            Err(err) => Err(err),
        }
    })
}

fn cmd_run(paths: &EnginePaths, run: Option<String>, max_steps: Option<u32>) -> Result<i32> {
    let run_id = resolve_run(paths, run)?;
    with_engine(paths, &run_id, |engine| {
        // `devloop abort` from another shell lands between steps.
        let control = LoopControl {
            max_steps,
            abort: None,
        };
        let outcome = run_loop(engine, &control, print_step)?;
        let code = match &outcome.stop {
            LoopStop::Completed | LoopStop::StepLimit => exit_codes::OK,
            LoopStop::Failed { reason } => {
                eprintln!("run failed: {reason}");
                exit_codes::FAILED
            }
            LoopStop::Suspended { request_id } => {
                println!("waiting for approval {request_id}");
                exit_codes::SUSPENDED
            }
            LoopStop::Halted { status, node } => {
                eprintln!("run {} at {node}", status.as_str());
                exit_codes::HALTED
            }
            LoopStop::Rejected { message } => {
                eprintln!("{message}");
                exit_codes::HALTED
            }
        };
        println!("{} step(s), stopped: {:?}", outcome.steps_executed, outcome.stop);
        Ok(code)
    })
}

fn cmd_status(paths: &EnginePaths, run: Option<String>, json: bool) -> Result<i32> {
    let run_id = resolve_run(paths, run)?;
    let store = open_store(paths, &run_id)?;
    let state = store.load(CheckpointRef::Latest)?;
    let summary = summarize(&state);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary).context("serialize status")?);
    } else {
        println!(
            "{} {} at {} (iteration {})",
            summary.run_id,
            summary.status.as_str(),
            summary.position,
            summary.iteration
        );
        println!("design {}", summary.design);
        if let Some(task) = &summary.current_task {
            println!("current task {task}");
        }
        if let Some(request) = &summary.pending_approval {
            println!("pending approval {request}");
        }
        if let Some(reason) = &summary.terminal_reason {
            println!("reason {reason}");
        }
        for item in &summary.items {
            println!(
                "  {:<12} {} ({}/{})",
                item.status, item.path, item.attempts, item.max_attempts
            );
        }
    }
    Ok(exit_codes::for_status(state.status))
}

fn cmd_approvals(paths: &EnginePaths) -> Result<i32> {
    for pending in pending_approvals(paths)? {
        let request = &pending.request;
        println!(
            "{} {} {} {}",
            pending.run_id, request.id, request.requested_by, request.summary
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_resolve(
    paths: &EnginePaths,
    run_id: &str,
    request_id: &str,
    decision: DecisionArg,
    reason: Option<String>,
    payload: Option<String>,
) -> Result<i32> {
    let decision = match decision {
        DecisionArg::Approve => Decision::Approve,
        DecisionArg::Reject => Decision::Reject {
            reason: reason.unwrap_or_else(|| "rejected".to_string()),
        },
        DecisionArg::Edit => Decision::Edit {
            payload: payload.context("edit requires --payload")?,
        },
    };
    let store = open_store(paths, run_id)?;
    let (state, checkpoint) = resolve_approval(&store, request_id, decision, SystemClock.now())?;
    println!("{} resolved (checkpoint {checkpoint})", request_id);
    Ok(exit_codes::for_status(state.status))
}

fn cmd_abort(paths: &EnginePaths, run_id: &str, reason: Option<&str>) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let store = open_store(paths, run_id)?;
    let sandbox = LocalSandbox::new(
        cfg.sandbox.shell.clone(),
        store.paths().sandbox_dir.clone(),
        cfg.sandbox.output_limit_bytes,
    );
    let (state, _) = abort_run(&store, &sandbox, reason.unwrap_or_default(), SystemClock.now())?;
    println!("{} aborted", state.run_id);
    Ok(exit_codes::for_status(state.status))
}

fn cmd_checkpoints(paths: &EnginePaths, run_id: &str) -> Result<i32> {
    let store = open_store(paths, run_id)?;
    for id in store.checkpoints().list()? {
        let state = store.load(CheckpointRef::Id(id))?;
        println!(
            "{:>4} {:<13} {:<10} iteration {}",
            id.0,
            state.position.as_str(),
            state.status.as_str(),
            state.iteration
        );
    }
    Ok(exit_codes::OK)
}

fn resolve_run(paths: &EnginePaths, run: Option<String>) -> Result<String> {
    match run {
        Some(run_id) => Ok(run_id),
        None => latest_run(paths),
    }
}

fn open_store(paths: &EnginePaths, run_id: &str) -> Result<RunStore> {
    let store = RunStore::new(paths.run(run_id));
    if !store.exists() {
        anyhow::bail!("unknown run '{run_id}'");
    }
    Ok(store)
}

/// Build the shipped adapters for one run and hand an engine to `f`.
fn with_engine<T>(
    paths: &EnginePaths,
    run_id: &str,
    f: impl FnOnce(&Engine<'_>) -> Result<T>,
) -> Result<T> {
    let cfg: EngineConfig = load_config(&paths.config_path)?;
    let store = open_store(paths, run_id)?;
    let workspace = paths.root.join(&cfg.sandbox.workspace);

    let llm = CommandLlmClient::new(&cfg.llm, &workspace);
    let sandbox = LocalSandbox::new(
        cfg.sandbox.shell.clone(),
        store.paths().sandbox_dir.clone(),
        cfg.sandbox.output_limit_bytes,
    );
    let vcs = Git::new(&workspace, cfg.integration.remote.clone());
    let clock = SystemClock;
    let caps = Capabilities {
        llm: &llm,
        sandbox: &sandbox,
        vcs: &vcs,
        clock: &clock,
    };
    let engine = Engine::new(cfg, caps, store, workspace)?;
    f(&engine)
}

fn print_step(step: &StepOutcome) {
    match step.checkpoint {
        Some(id) => println!(
            "{} -> {} [{}] checkpoint {id}",
            step.from,
            step.to,
            step.state.status.as_str()
        ),
        None => println!("{} waiting [{}]", step.from, step.state.status.as_str()),
    }
}

fn is_rejection(err: &anyhow::Error) -> bool {
    err.downcast_ref::<DeltaRejectedError>().is_some() || err.downcast_ref::<TopologyError>().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["devloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_resolve_edit() {
        let cli = Cli::parse_from([
            "devloop", "resolve", "todo-1", "apr-2", "edit", "--payload", "cargo fmt",
        ]);
        match cli.command {
            Command::Resolve {
                run,
                request,
                decision,
                payload,
                ..
            } => {
                assert_eq!(run, "todo-1");
                assert_eq!(request, "apr-2");
                assert_eq!(decision, DecisionArg::Edit);
                assert_eq!(payload.as_deref(), Some("cargo fmt"));
            }
            _ => panic!("expected resolve"),
        }
    }

    #[test]
    fn parse_run_with_step_limit() {
        let cli = Cli::parse_from(["devloop", "run", "--run", "todo-1", "--max-steps", "5"]);
        assert!(matches!(
            cli.command,
            Command::Run {
                max_steps: Some(5),
                ..
            }
        ));
    }
}

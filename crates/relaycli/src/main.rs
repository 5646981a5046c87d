// crates/relaycli/src/main.rs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use relaycore::{
    ApprovalSpec, Decision, RelayError, RiskLevel, RunEvent, RunId, RunStatus, StepEvent,
    StepKind, StepStatus, WorkerConfig, WorkerRef, WorkflowDefinition, WorkflowStep,
};
use relayruntime::{
    ExecutorRegistry, RelayRuntime, RuntimeConfig, StaticWorkerSource, WorkerDirectory,
};
use relaysteps::CommandTransport;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay workflow orchestration CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run(RunArgs),

    /// Validate a workflow file without running it
    Validate {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Worker registry TOML file
        #[arg(short, long, env = "RELAY_WORKERS")]
        workers: Option<PathBuf>,

        /// Project whose role assignments apply
        #[arg(short, long, env = "RELAY_PROJECT")]
        project: Option<String>,
    },

    /// List available step kinds
    Kinds,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to workflow JSON file
    #[arg(short, long)]
    file: PathBuf,

    /// Worker registry TOML file
    #[arg(short, long, env = "RELAY_WORKERS")]
    workers: Option<PathBuf>,

    /// Runtime configuration TOML file
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Project whose role assignments apply
    #[arg(short, long, env = "RELAY_PROJECT")]
    project: Option<String>,

    /// Route untagged steps to the mock executor
    #[arg(long)]
    mock: bool,

    /// Approve every approval gate as soon as it opens
    #[arg(long)]
    auto_approve: bool,

    /// Upper bound on concurrently running steps
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Operator command typed on stdin while a run is in progress
#[derive(Debug, PartialEq)]
enum ControlCommand {
    Decide {
        step_id: String,
        decision: Decision,
        comment: Option<String>,
    },
    Abort,
}

fn parse_command(line: &str) -> Option<ControlCommand> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let decision = match verb.to_lowercase().as_str() {
        "abort" => return Some(ControlCommand::Abort),
        "approve" => Decision::Approve,
        "reject" => Decision::Reject,
        _ => return None,
    };

    let rest = rest.trim_start();
    let (step_id, comment) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    if step_id.is_empty() {
        return None;
    }
    let comment = comment.trim();

    Some(ControlCommand::Decide {
        step_id: step_id.to_string(),
        decision,
        comment: (!comment.is_empty()).then(|| comment.to_string()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            init_logging(args.verbose);
            run_workflow(args).await?;
        }

        Commands::Validate {
            file,
            workers,
            project,
        } => {
            validate_workflow(file, workers, project).await?;
        }

        Commands::Kinds => {
            list_kinds();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid workflow JSON in {}", path.display()))
}

/// One stand-in worker per distinct reference in the definition.
fn mock_workers(definition: &WorkflowDefinition) -> Vec<WorkerConfig> {
    let mut workers: Vec<WorkerConfig> = Vec::new();
    for step in &definition.steps {
        let worker = match step.worker_ref() {
            Some(WorkerRef::Id(id)) => WorkerConfig::new(id, "mock"),
            Some(WorkerRef::Role(role)) => {
                WorkerConfig::new(format!("mock-{}", role.to_lowercase()), role)
            }
            None => continue,
        };
        if !workers.iter().any(|w| w.id == worker.id) {
            workers.push(worker.with_model("mock"));
        }
    }
    workers
}

fn build_runtime(
    config: RuntimeConfig,
    workers: Option<&Path>,
    definition: &WorkflowDefinition,
) -> Result<Arc<RelayRuntime>> {
    let source = match workers {
        Some(path) => StaticWorkerSource::load(path)?,
        None if config.use_mock => StaticWorkerSource::from_workers(mock_workers(definition)),
        None => StaticWorkerSource::new(),
    };

    let mut registry = ExecutorRegistry::new();
    relaysteps::register_all(&mut registry, Arc::new(CommandTransport::default()));

    let directory = Arc::new(WorkerDirectory::new(Arc::new(source)));
    Ok(Arc::new(RelayRuntime::new(config, registry, directory)))
}

async fn run_workflow(args: RunArgs) -> Result<()> {
    println!("🚀 Loading workflow from: {}", args.file.display());

    let definition = load_definition(&args.file)?;

    println!("📋 Workflow: {}", definition.name);
    println!("   Steps: {}", definition.steps.len());
    if let Some(project) = &args.project {
        println!("   Project: {}", project);
    }
    println!();

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if args.mock {
        config = config.with_mock(true);
    }
    if let Some(max) = args.max_parallel {
        config = config.with_max_parallel_steps(max);
    }

    let runtime = build_runtime(config, args.workers.as_deref(), &definition)?;

    // Subscribe before submitting so RunStarted is not missed
    let events = runtime.subscribe_events();
    let event_task = tokio::spawn(print_events(
        events,
        Arc::clone(&runtime),
        args.auto_approve,
    ));

    let handle = match runtime.submit(&definition, args.project.clone(), None).await {
        Ok(handle) => handle,
        Err(RelayError::Validation(errors)) => {
            event_task.abort();
            println!("❌ Workflow is invalid:");
            for error in errors.iter() {
                println!("   • {}", error);
            }
            anyhow::bail!("{} validation error(s)", errors.len());
        }
        Err(e) => {
            event_task.abort();
            return Err(e.into());
        }
    };

    tracing::debug!(run_id = %handle.run_id, thread_id = %handle.thread_id, "run submitted");

    let control_task = tokio::spawn(handle_commands(
        spawn_stdin_reader(),
        Arc::clone(&runtime),
        handle.run_id,
        handle.thread_id.clone(),
    ));

    let outcome = handle.wait().await?;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();
    control_task.abort();

    println!();
    println!("📊 Run Summary:");
    println!("   Run ID: {}", outcome.run_id);
    println!("   Thread: {}", outcome.thread_id);
    println!("   Status: {}", outcome.status);
    println!(
        "   Completed: {}/{} steps in {}ms",
        outcome.completed_steps(),
        definition.steps.len(),
        outcome.duration_ms
    );

    println!();
    println!("📤 Steps:");
    for step in &definition.steps {
        let Some(result) = outcome.result(&step.id) else {
            continue;
        };
        println!("   {} {} [{}]", status_icon(result.status), step.id, result.status);
        if let Some(output) = &result.output {
            println!("     {}", preview(output, 200));
        }
        if let Some(error) = &result.error {
            println!("     error: {}", error);
        }
    }

    if outcome.status != RunStatus::Completed {
        anyhow::bail!("Run {} finished with status {}", outcome.run_id, outcome.status);
    }

    Ok(())
}

async fn print_events(
    mut events: broadcast::Receiver<RunEvent>,
    runtime: Arc<RelayRuntime>,
    auto_approve: bool,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                println!("     ⚠️  {} events dropped", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            RunEvent::RunStarted { step_count, .. } => {
                println!("▶️  Run started ({} steps)", step_count);
            }
            RunEvent::StepStarted {
                step_id,
                kind,
                worker_id,
                ..
            } => match worker_id {
                Some(worker) => println!("  ⚡ Starting step: {} ({} via {})", step_id, kind, worker),
                None => println!("  ⚡ Starting step: {} ({})", step_id, kind),
            },
            RunEvent::StepCompleted {
                step_id,
                duration_ms,
                ..
            } => {
                println!("  ✅ Step {} completed in {}ms", step_id, duration_ms);
            }
            RunEvent::StepFailed { step_id, error, .. } => {
                println!("  ❌ Step {} failed: {}", step_id, error);
            }
            RunEvent::StepBlocked {
                step_id,
                failed_dependency,
                ..
            } => {
                println!("  ⛔ Step {} blocked by {}", step_id, failed_dependency);
            }
            RunEvent::StepAborted { step_id, .. } => {
                println!("  🛑 Step {} aborted", step_id);
            }
            RunEvent::StepEvent { step_id, event, .. } => match event {
                StepEvent::Info { message } => {
                    println!("     ℹ️  [{}] {}", step_id, message);
                }
                StepEvent::Warning { message } => {
                    println!("     ⚠️  [{}] {}", step_id, message);
                }
                StepEvent::Progress { percent, message } => {
                    if let Some(msg) = message {
                        println!("     📊 [{}] {}% - {}", step_id, percent, msg);
                    } else {
                        println!("     📊 [{}] {}%", step_id, percent);
                    }
                }
            },
            RunEvent::ApprovalRequested { approval, .. } => {
                println!("  ✋ Approval needed for {}: {}", approval.step_id, approval.prompt);
                if auto_approve {
                    let decided = runtime
                        .decide(
                            &approval.thread_id,
                            &approval.step_id,
                            Decision::Approve,
                            Some("auto-approved".to_string()),
                        )
                        .await;
                    if let Err(e) = decided {
                        println!("     ⚠️  Auto-approve failed: {}", e);
                    }
                } else {
                    println!(
                        "     type: approve {} [comment] | reject {} [comment] | abort",
                        approval.step_id, approval.step_id
                    );
                }
            }
            RunEvent::ApprovalProcessed {
                approval,
                decision,
                comment,
                ..
            } => match comment {
                Some(comment) => println!("  📝 {} {}: {}", approval.step_id, decision, comment),
                None => println!("  📝 {} {}", approval.step_id, decision),
            },
            RunEvent::ApprovalOverdue {
                approval,
                severity,
                overdue_secs,
                ..
            } => {
                println!(
                    "  ⏰ Approval for {} is overdue by {}s ({})",
                    approval.step_id, overdue_secs, severity
                );
            }
            RunEvent::ApprovalExpired {
                approval, reason, ..
            } => {
                println!("  ⌛ Approval for {} expired: {}", approval.step_id, reason);
            }
            RunEvent::RunCompleted {
                status,
                duration_ms,
                ..
            } => {
                if status == RunStatus::Completed {
                    println!("✨ Run completed successfully in {}ms", duration_ms);
                } else {
                    println!("💥 Run {} after {}ms", status, duration_ms);
                }
            }
            RunEvent::RunAborted { reason, .. } => {
                println!("🛑 Run aborted: {}", reason.as_deref().unwrap_or("no reason given"));
            }
        }
    }
}

/// Read stdin on a plain thread so a pending read never holds up shutdown.
fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_commands(
    mut lines: mpsc::UnboundedReceiver<String>,
    runtime: Arc<RelayRuntime>,
    run_id: RunId,
    thread_id: String,
) {
    while let Some(line) = lines.recv().await {
        match parse_command(&line) {
            Some(ControlCommand::Decide {
                step_id,
                decision,
                comment,
            }) => {
                if let Err(e) = runtime.decide(&thread_id, &step_id, decision, comment).await {
                    println!("  ⚠️  {}", e);
                }
            }
            Some(ControlCommand::Abort) => {
                if let Err(e) = runtime.abort(run_id).await {
                    println!("  ⚠️  {}", e);
                }
            }
            None if line.trim().is_empty() => {}
            None => {
                println!(
                    "  ❓ Unknown command: {} (approve <step> [comment] | reject <step> [comment] | abort)",
                    line.trim()
                );
            }
        }
    }
}

fn status_icon(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Completed => "✅",
        StepStatus::Failed => "❌",
        StepStatus::WaitingForApproval => "✋",
        StepStatus::Expired => "⌛",
        StepStatus::Aborted => "🛑",
        StepStatus::BlockedByFailure => "⛔",
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

async fn validate_workflow(
    file: PathBuf,
    workers: Option<PathBuf>,
    project: Option<String>,
) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let definition = load_definition(&file)?;

    // Without a registry file only the graph can be checked
    let config = RuntimeConfig::default().with_mock(workers.is_none());
    let runtime = build_runtime(config, workers.as_deref(), &definition)?;
    let errors = runtime.validate(&definition, project.as_deref()).await?;

    if !errors.is_empty() {
        println!("❌ Workflow is invalid:");
        for error in &errors {
            println!("   • {}", error);
        }
        anyhow::bail!("{} validation error(s)", errors.len());
    }

    println!("✅ Workflow is valid:");
    println!("   Name: {}", definition.name);
    println!("   Steps: {}", definition.steps.len());
    let gated = definition.steps.iter().filter(|s| s.approval.is_some()).count();
    if gated > 0 {
        println!("   Approval gates: {}", gated);
    }
    if workers.is_none() {
        println!("   (no worker registry given: worker references were not checked)");
    }

    Ok(())
}

fn list_kinds() {
    println!("📦 Available Step Kinds:");
    println!();

    let mut registry = ExecutorRegistry::new();
    relaysteps::register_all(&mut registry, Arc::new(CommandTransport::default()));

    for info in registry.list_executors() {
        println!("  • {}", info.kind);
        println!("    {}", info.description);
    }
}

fn example_workflow() -> WorkflowDefinition {
    let mut workflow = WorkflowDefinition::new("Example Research Brief");
    workflow.description =
        Some("Plans a topic, researches and outlines it in parallel, then merges the two for review".to_string());

    workflow
        .with_step(
            WorkflowStep::new("plan", "Break the topic 'edge caching' into three questions")
                .with_name("Plan")
                .with_role("planner"),
        )
        .with_step(
            WorkflowStep::new("research", "Answer the planned questions with sources")
                .with_name("Research")
                .with_role("researcher")
                .depends_on("plan"),
        )
        .with_step(
            WorkflowStep::new("outline", "Draft a section outline for the brief")
                .with_name("Outline")
                .with_role("writer")
                .depends_on("plan"),
        )
        .with_step(
            WorkflowStep::new("merge", "Merge research and outline into one brief")
                .with_name("Merge")
                .with_role("editor")
                .with_kind(StepKind::ScriptedOperator)
                .with_config("operation", "concat")
                .with_config("separator", "\n\n---\n\n")
                .depends_on("research")
                .depends_on("outline")
                .with_approval(
                    ApprovalSpec::new("Publish the merged brief?")
                        .with_timeout(600)
                        .with_risk(RiskLevel::Medium),
                ),
        )
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let workflow = example_workflow();

    // Save to file
    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  relay run --file {} --mock", output.display());

    Ok(())
}

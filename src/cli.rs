//! Command-line surface of the `featureloop` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tracing::{info, warn};

use featureloop::agent::CommandAgentClient;
use featureloop::config::{config_path, state_dir};
use featureloop::feature::{Feature, FeatureStatus, FeatureStore, PlanStatus};
use featureloop::metrics::{format_metrics, MetricsStore};
use featureloop::plan::{ApprovalInbox, SubmittedDecision, Verdict};
use featureloop::state::ExecutionStateStore;
use featureloop::{Orchestrator, OrchestratorConfig, OrchestratorError, Result};

#[derive(Debug, Parser)]
#[command(name = "featureloop", version, about = "Drive a coding agent through planned, verified features")]
pub struct Cli {
    /// Project root holding the `.featureloop` directory.
    #[arg(long, global = true, default_value = ".")]
    pub project: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a default configuration file.
    Init {
        /// Overwrite an existing configuration.
        #[arg(long)]
        force: bool,
    },
    /// Recover interrupted work and run the auto-loop until Ctrl-C.
    Run {
        /// Features in flight at once (1-10).
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Approve every generated plan without waiting.
        #[arg(long)]
        auto_approve: bool,
    },
    /// Run one feature to completion.
    Start {
        feature_id: String,
    },
    /// Approve a plan waiting for review in a running process.
    Approve {
        feature_id: String,
        /// File holding an edited plan to use instead.
        #[arg(long)]
        plan_file: Option<PathBuf>,
        /// Notes passed to the implementation.
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Reject a plan waiting for review. With feedback or an edited plan
    /// the plan is revised; otherwise the feature goes back to the backlog.
    Reject {
        feature_id: String,
        #[arg(long)]
        feedback: Option<String>,
        /// File holding an edited plan to revise from.
        #[arg(long)]
        plan_file: Option<PathBuf>,
    },
    /// List features with their status and task progress.
    Status,
    /// Print aggregate run metrics.
    Metrics,
    /// Record an explicit stop so the next run does not resume the auto-loop.
    Stop,
}

pub async fn run(cli: Cli) -> Result<()> {
    let project = cli.project;
    match cli.command {
        Command::Init { force } => init(&project, force),
        Command::Run {
            max_concurrency,
            auto_approve,
        } => run_loop(&project, max_concurrency, auto_approve).await,
        Command::Start { feature_id } => start(&project, &feature_id).await,
        Command::Approve {
            feature_id,
            plan_file,
            feedback,
        } => {
            let edited_plan = read_plan_file(plan_file.as_deref())?;
            submit(
                &project,
                &feature_id,
                SubmittedDecision::approve(edited_plan, feedback),
            )
        }
        Command::Reject {
            feature_id,
            feedback,
            plan_file,
        } => {
            let edited_plan = read_plan_file(plan_file.as_deref())?;
            submit(
                &project,
                &feature_id,
                SubmittedDecision::reject(feedback, edited_plan),
            )
        }
        Command::Status => status(&project),
        Command::Metrics => metrics(&project),
        Command::Stop => stop(&project),
    }
}

fn orchestrator(project: &Path, auto_approve: bool) -> Result<Orchestrator> {
    let mut config = OrchestratorConfig::load(project)?;
    if auto_approve {
        config = config.with_auto_approve_plans(true);
    }
    let agent = Arc::new(CommandAgentClient::new(config.agent.clone()));
    Orchestrator::new(project, config, agent)
}

fn init(project: &Path, force: bool) -> Result<()> {
    let path = config_path(project);
    if path.exists() && !force {
        println!(
            "{} {} already exists (use --force to overwrite)",
            "!".yellow(),
            path.display()
        );
        return Ok(());
    }
    fs::create_dir_all(state_dir(project))?;
    let toml = OrchestratorConfig::default()
        .to_toml()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    fs::write(&path, toml)?;
    println!("{} Wrote {}", "✓".green(), path.display());
    Ok(())
}

async fn run_loop(project: &Path, max_concurrency: Option<usize>, auto_approve: bool) -> Result<()> {
    let orchestrator = orchestrator(project, auto_approve)?;
    let journal = orchestrator.start_journal()?;

    let inbox = orchestrator.start_approval_inbox();

    let report = orchestrator.recover_with_concurrency(max_concurrency)?;
    if !report.resumed.is_empty() {
        println!("{} Resumed: {}", "↻".cyan(), report.resumed.join(", "));
    }
    if !report.requeued.is_empty() {
        println!("{} Requeued: {}", "↻".cyan(), report.requeued.join(", "));
    }
    if !report.auto_loop_restarted {
        orchestrator.start_auto_loop(max_concurrency)?;
    }
    println!("{} Auto-loop running, press Ctrl-C to stop", "▶".green());

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for Ctrl-C");
    }
    info!("Stopping auto-loop");
    orchestrator.stop_auto_loop().await;
    for feature in orchestrator.running_features() {
        orchestrator.stop_feature(&feature.feature_id);
    }
    inbox.abort();
    journal.abort();
    println!("{} Stopped", "■".yellow());
    Ok(())
}

async fn start(project: &Path, feature_id: &str) -> Result<()> {
    let orchestrator = orchestrator(project, false)?;
    let journal = orchestrator.start_journal()?;
    let inbox = orchestrator.start_approval_inbox();
    let outcome = orchestrator.execute_feature(feature_id).await;
    inbox.abort();
    journal.abort();

    let outcome = outcome?;
    let marker = if outcome.passed {
        "✓".green().to_string()
    } else {
        "✗".red().to_string()
    };
    println!("{} {} -> {}", marker, outcome.feature_id, outcome.status);
    if !outcome.message.is_empty() {
        println!("  {}", outcome.message.dimmed());
    }
    Ok(())
}

fn read_plan_file(path: Option<&Path>) -> Result<Option<String>> {
    path.map(fs::read_to_string).transpose().map_err(Into::into)
}

/// Leave a decision for the process waiting on the feature's plan.
fn submit(project: &Path, feature_id: &str, decision: SubmittedDecision) -> Result<()> {
    let feature = FeatureStore::new(project)?.get(feature_id)?;
    let awaiting = feature
        .plan_spec
        .as_ref()
        .is_some_and(|plan| plan.status == PlanStatus::Generated);
    if !awaiting {
        return Err(OrchestratorError::NoPendingApproval(feature_id.to_string()));
    }
    ApprovalInbox::new(project).submit(feature_id, &decision)?;
    let verb = match decision.verdict {
        Verdict::Approve => "Approval",
        Verdict::Reject => "Rejection",
    };
    println!(
        "{} {} recorded for {}; the running process applies it on its next poll",
        "✓".green(),
        verb,
        feature_id
    );
    Ok(())
}

fn status(project: &Path) -> Result<()> {
    let store = FeatureStore::new(project)?;
    let features = store.list()?;
    if features.is_empty() {
        println!("No features.");
        return Ok(());
    }
    for feature in &features {
        println!("{}", status_line(feature));
    }
    Ok(())
}

fn status_line(feature: &Feature) -> String {
    let label = feature.status.to_string();
    let label = match feature.status {
        FeatureStatus::Verified => label.green().to_string(),
        FeatureStatus::WaitingApproval => label.yellow().to_string(),
        FeatureStatus::InProgress | FeatureStatus::Pipeline(_) => label.cyan().to_string(),
        _ => label.dimmed().to_string(),
    };
    let progress = feature
        .plan_spec
        .as_ref()
        .filter(|plan| plan.tasks_total > 0)
        .map(|plan| format!(" [{}/{} tasks]", plan.tasks_completed, plan.tasks_total))
        .unwrap_or_default();
    format!("{:<20} {:<24} {}{}", feature.id, label, feature.title, progress)
}

fn metrics(project: &Path) -> Result<()> {
    let config = OrchestratorConfig::load(project)?;
    let store = MetricsStore::new(project, config.metrics_history_limit);
    match store.load_aggregates()? {
        Some(aggregates) => print!("{}", format_metrics(&aggregates)),
        None => println!("No metrics recorded yet."),
    }
    Ok(())
}

fn stop(project: &Path) -> Result<()> {
    ExecutionStateStore::new(project).clear()?;
    println!("{} Execution state cleared", "■".yellow());
    Ok(())
}

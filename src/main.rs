//! Nexus CLI
//!
//! Issue-driven agent workflow orchestration.

use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nexus::orchestrator::Collaborators;
use nexus::shutdown::ShutdownSignal;
use nexus::{Config, Orchestrator, Result};

#[derive(Parser)]
#[command(name = "nexus")]
#[command(author, version, about = "Issue-driven agent workflow orchestration")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory layout
    Init,

    /// Create a workflow for an issue
    Create {
        issue: String,

        /// Project name (defaults to default_project)
        #[arg(long, short)]
        project: Option<String>,

        /// Workflow tier; detected from issue labels when omitted
        #[arg(long, short)]
        tier: Option<String>,

        /// Start the workflow right away
        #[arg(long)]
        start: bool,
    },

    /// Start an issue's workflow and launch the first agent
    Start { issue: String },

    /// Show workflow status (all workflows without an issue)
    Status { issue: Option<String> },

    /// Compare the workflow record with local and comment signals
    Snapshot {
        issue: String,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay completion signals from issue comments
    Reconcile { issue: String },

    /// Mark the current step complete
    Complete {
        issue: String,

        /// Agent that finished the step
        agent: String,
    },

    /// Approve the pending step
    Approve {
        issue: String,

        #[arg(long, default_value = "operator")]
        by: String,
    },

    /// Deny the pending step (fails the workflow)
    Deny {
        issue: String,

        #[arg(long, default_value = "operator")]
        by: String,

        #[arg(long, short, default_value = "no reason given")]
        reason: String,
    },

    /// Pause automatic launches
    Pause {
        issue: String,

        #[arg(long, short, default_value = "paused by operator")]
        reason: String,
    },

    /// Resume automatic launches
    Resume { issue: String },

    /// Kill the agent, cancel the workflow and close the issue
    Stop {
        issue: String,

        #[arg(long, short, default_value = "stopped by operator")]
        reason: String,
    },

    /// Move the workflow pointer back to an agent's step
    Reset { issue: String, agent: String },

    /// Relaunch the current step
    Continue {
        issue: String,

        /// Agent expected to run next
        #[arg(long)]
        from: Option<String>,
    },

    /// Remove all local state for an issue (audit history is kept)
    Forget { issue: String },

    /// Show audit history
    Audit {
        #[arg(long)]
        issue: String,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Handle a GitHub issue_comment webhook payload (file or stdin)
    Comment { payload: Option<PathBuf> },

    /// Run one stuck-agent sweep and log scan
    Sweep,

    /// Poll logs and sweep agents until interrupted
    Watch,
}

impl Commands {
    fn issue(&self) -> Option<&str> {
        match self {
            Commands::Create { issue, .. }
            | Commands::Start { issue }
            | Commands::Snapshot { issue, .. }
            | Commands::Reconcile { issue }
            | Commands::Complete { issue, .. }
            | Commands::Approve { issue, .. }
            | Commands::Deny { issue, .. }
            | Commands::Pause { issue, .. }
            | Commands::Resume { issue }
            | Commands::Stop { issue, .. }
            | Commands::Reset { issue, .. }
            | Commands::Continue { issue, .. }
            | Commands::Forget { issue }
            | Commands::Audit { issue, .. } => Some(issue),
            Commands::Status { issue } => issue.as_deref(),
            Commands::Init | Commands::Comment { .. } | Commands::Sweep | Commands::Watch => None,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let issue = cli.command.issue().map(str::to_string);
    if let Err(e) = run(cli).await {
        match issue {
            Some(issue) => eprintln!("❌ Issue #{}: {}", issue, e),
            None => eprintln!("❌ {}", e),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    if let Commands::Init = cli.command {
        config.init()?;
        println!("Initialized {}", config.data_dir().display());
        return Ok(());
    }

    let orchestrator = Orchestrator::new(config.clone(), Collaborators::from_config(&config));

    match cli.command {
        Commands::Init => {}

        Commands::Create {
            issue,
            project,
            tier,
            start,
        } => {
            let id = orchestrator
                .create_workflow(&issue, project.as_deref(), tier.as_deref())
                .await?;
            println!("Created workflow {}", id);
            if start {
                println!("{}", orchestrator.start_issue(&issue).await?);
            }
        }

        Commands::Start { issue } => {
            println!("{}", orchestrator.start_issue(&issue).await?);
        }

        Commands::Status { issue: Some(issue) } => {
            println!("{}", orchestrator.status(&issue)?);
        }

        Commands::Status { issue: None } => {
            let workflows = orchestrator.engine().list_workflows();
            if workflows.is_empty() {
                println!("No workflows");
            }
            for wf in workflows {
                let (done, total) = wf.progress();
                println!(
                    "#{:<6} {:<32} {:<18} {}/{} @{}{}",
                    wf.issue(),
                    wf.id,
                    wf.state.to_string(),
                    done,
                    total,
                    wf.active_agent_type().unwrap_or("-"),
                    if wf.paused { " (paused)" } else { "" }
                );
            }
        }

        Commands::Snapshot { issue, json } => {
            let snapshot = orchestrator.snapshot(&issue).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{}", snapshot.summary());
            }
        }

        Commands::Reconcile { issue } => {
            let report = orchestrator.reconcile(&issue).await?;
            println!("{}", report.summary());
        }

        Commands::Complete { issue, agent } => {
            let outcome = orchestrator
                .complete_step(&issue, &agent, serde_json::json!({ "source": "operator" }))
                .await?;
            println!("{}", outcome);
        }

        Commands::Approve { issue, by } => {
            println!("{}", orchestrator.approve_issue(&issue, &by).await?);
        }

        Commands::Deny { issue, by, reason } => {
            let wf = orchestrator.deny_issue(&issue, &by, &reason).await?;
            println!("{}", wf.summary());
        }

        Commands::Pause { issue, reason } => {
            orchestrator.pause_issue(&issue, &reason)?;
            println!("⏸️  Paused issue #{}", issue);
        }

        Commands::Resume { issue } => {
            println!("{}", orchestrator.resume_issue(&issue).await?);
        }

        Commands::Stop { issue, reason } => {
            let wf = orchestrator.stop_issue(&issue, &reason).await?;
            println!("🛑 Stopped {}", wf.id);
        }

        Commands::Reset { issue, agent } => {
            let wf = orchestrator.reset_issue(&issue, &agent)?;
            println!("{}", wf.summary());
        }

        Commands::Continue { issue, from } => {
            println!("{}", orchestrator.continue_issue(&issue, from.as_deref()).await?);
        }

        Commands::Forget { issue } => match orchestrator.forget_issue(&issue).await? {
            Some(id) => println!("Forgot workflow {}", id),
            None => println!("Issue #{} had no workflow; local state cleared", issue),
        },

        Commands::Audit { issue, limit } => {
            for event in orchestrator.audit_history(&issue, limit) {
                println!(
                    "{}  {:<22} {}{}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type.to_string(),
                    event.data.details,
                    event
                        .user_id
                        .map(|u| format!(" (by {})", u))
                        .unwrap_or_default()
                );
            }
        }

        Commands::Comment { payload } => {
            let body = match payload {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut body = String::new();
                    std::io::stdin().read_to_string(&mut body)?;
                    body
                }
            };
            println!("{}", orchestrator.handle_issue_comment(&body).await?);
        }

        Commands::Sweep => {
            for (issue, outcome) in orchestrator.scan_log_completions().await {
                match outcome {
                    Ok(outcome) => println!("#{}: {}", issue, outcome),
                    Err(e) => println!("#{}: {}", issue, e),
                }
            }
            let report = orchestrator.sweep_stuck_agents().await;
            println!(
                "Checked {}: {} killed, {} dead, {} retried, {} failed, {} pruned",
                report.checked, report.killed, report.dead, report.retried, report.failed, report.pruned
            );
            for (issue, outcome) in orchestrator.launch_pending().await {
                println!("#{}: {}", issue, outcome);
            }
        }

        Commands::Watch => {
            let shutdown = ShutdownSignal::new();
            shutdown.install()?;
            info!("Data directory: {}", config.data_dir().display());
            orchestrator.run(shutdown.flag()).await;
        }
    }

    Ok(())
}

//! Muster CLI: route tasks across specialists, run agent workflows and
//! deliver reminders, all on top of `muster-core`.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use muster_cli::commands;
use muster_core::scheduler::{ChannelConversationSink, ConversationSink, LoggingConversationSink};
use muster_core::MusterConfig;

/// Muster: a planner that routes work across specialist agents
#[derive(Parser)]
#[command(name = "muster", version, about = "Muster: route tasks across specialist agents")]
pub struct Cli {
    /// Path to a YAML config file
    #[arg(long, env = "MUSTER_CONFIG", default_value = "muster.yaml")]
    config: String,

    /// Path to the SQLite database file (overrides the config file)
    #[arg(long, env = "MUSTER_DB_PATH")]
    db: Option<String>,

    /// Use a local stand-in instead of the LLM provider
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message through the planner (reads stdin turns when omitted)
    Ask {
        message: Option<String>,
        /// Conversation ID
        #[arg(long, default_value = "cli")]
        conversation: String,
        /// Recent conversation summary handed to the planner
        #[arg(long)]
        context: Option<String>,
        /// Run ID currently waiting for this user's answer
        #[arg(long)]
        waiting_run: Option<String>,
        /// Seconds to wait for runs started during the turn
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },

    /// List specialists, optionally storing overrides first
    Specialists {
        /// YAML file with a list of specialist overrides
        #[arg(long)]
        overrides: Option<String>,
    },

    /// Manage agents
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },

    /// Manage workflows and their runs
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Manage reminders
    Reminder {
        #[command(subcommand)]
        action: ReminderAction,
    },
}

#[derive(Subcommand)]
enum AgentAction {
    /// List agents
    List,
    /// Create a new agent
    Create {
        /// Agent name
        #[arg(long)]
        name: String,
        /// System prompt
        #[arg(long, default_value = "")]
        system_prompt: String,
        #[arg(long)]
        description: Option<String>,
        /// Tool names (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tools: Vec<String>,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Create a workflow from a YAML file
    Create {
        /// Path to the workflow YAML file
        file: String,
    },
    /// List workflows
    List,
    /// Run a workflow (or a single agent with --agent) and wait for it
    Run {
        /// Workflow (or agent) id or name
        target: String,
        /// Run input: JSON, or plain text
        #[arg(long)]
        input: Option<String>,
        /// Treat TARGET as an agent
        #[arg(long)]
        agent: bool,
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
    /// Show a run, or the most recent runs
    Status { run_id: Option<String> },
    /// Answer a run that is waiting for input
    Respond {
        run_id: String,
        /// The answer (empty is allowed)
        #[arg(default_value = "")]
        response: String,
        #[arg(long, default_value_t = 300)]
        wait_secs: u64,
    },
    /// Cancel a running or waiting run
    Cancel { run_id: String },
}

#[derive(Subcommand)]
enum ReminderAction {
    /// Schedule a reminder
    Add {
        message: String,
        /// Minutes from now
        #[arg(long)]
        in_minutes: Option<f64>,
        /// Absolute time: RFC 3339, or local "YYYY-MM-DD HH:MM"
        #[arg(long)]
        at: Option<String>,
        #[arg(long)]
        conversation: Option<String>,
        /// message | assistant_task
        #[arg(long)]
        task_type: Option<String>,
    },
    /// List reminders
    List {
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Cancel a pending reminder
    Cancel { reminder_id: String },
    /// Fire reminders as they come due
    Watch {
        /// Exit once no timers remain
        #[arg(long)]
        until_idle: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "muster_core=warn,muster_cli=info".into()),
        )
        .init();

    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let mut config = MusterConfig::load(Some(&cli.config)).map_err(|e| e.to_string())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    // Only `reminder watch` stays up long enough to deliver synthetic turns.
    let watching = matches!(
        &cli.command,
        Commands::Reminder {
            action: ReminderAction::Watch { .. }
        }
    );
    let (sink, mut turns) = if watching {
        let (sink, rx) = ChannelConversationSink::new();
        (Arc::new(sink) as Arc<dyn ConversationSink>, Some(rx))
    } else {
        (Arc::new(LoggingConversationSink) as Arc<dyn ConversationSink>, None)
    };
    let state = commands::init_state(config, cli.offline, sink).await?;

    match cli.command {
        Commands::Ask {
            message,
            conversation,
            context,
            waiting_run,
            wait_secs,
        } => {
            let opts = commands::ask::AskOptions {
                conversation_id: &conversation,
                context: context.as_deref(),
                waiting_run: waiting_run.as_deref(),
                wait: Duration::from_secs(wait_secs),
            };
            commands::ask::run(&state, message.as_deref(), &opts).await
        }

        Commands::Specialists { overrides } => {
            commands::specialists::list(&state, overrides.as_deref()).await
        }

        Commands::Agent { action } => match action {
            AgentAction::List => commands::agent::list(&state).await,
            AgentAction::Create {
                name,
                system_prompt,
                description,
                tools,
            } => {
                commands::agent::create(&state, &name, &system_prompt, description.as_deref(), &tools)
                    .await
            }
        },

        Commands::Workflow { action } => match action {
            WorkflowAction::Create { file } => commands::workflow::create(&state, &file).await,
            WorkflowAction::List => commands::workflow::list(&state).await,
            WorkflowAction::Run {
                target,
                input,
                agent,
                wait_secs,
            } => {
                commands::workflow::run(
                    &state,
                    &target,
                    input.as_deref(),
                    agent,
                    Duration::from_secs(wait_secs),
                )
                .await
            }
            WorkflowAction::Status { run_id } => {
                commands::workflow::status(&state, run_id.as_deref()).await
            }
            WorkflowAction::Respond {
                run_id,
                response,
                wait_secs,
            } => {
                commands::workflow::respond(&state, &run_id, &response, Duration::from_secs(wait_secs))
                    .await
            }
            WorkflowAction::Cancel { run_id } => commands::workflow::cancel(&state, &run_id).await,
        },

        Commands::Reminder { action } => match action {
            ReminderAction::Add {
                message,
                in_minutes,
                at,
                conversation,
                task_type,
            } => {
                let reminder = commands::reminder::NewReminder {
                    message: &message,
                    in_minutes,
                    at: at.as_deref(),
                    conversation_id: conversation.as_deref(),
                    task_type: task_type.as_deref(),
                };
                commands::reminder::add(&state, &reminder).await
            }
            ReminderAction::List { conversation } => {
                commands::reminder::list(&state, conversation.as_deref()).await
            }
            ReminderAction::Cancel { reminder_id } => {
                commands::reminder::cancel(&state, &reminder_id).await
            }
            ReminderAction::Watch { until_idle } => {
                let turns = turns
                    .take()
                    .ok_or_else(|| "reminder channel not set up".to_string())?;
                let handled = commands::reminder::watch(&state, turns, until_idle).await?;
                println!("Delivered {} reminder turn(s).", handled);
                Ok(())
            }
        },
    }
}

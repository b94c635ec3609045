//! Errand: scheduled follow-ups for a personal assistant.
//!
//! Main binary with subcommands:
//! - `daemon`: Run the scheduler loop
//! - `tasks list`: Show the durable tasks in the store
//! - `tasks add`: Append a durable task to the store

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use errand_scheduler::{DelaySpec, TaskSpec};

mod agent;
mod daemon;
mod tasks;

#[derive(Parser)]
#[command(name = "errand")]
#[command(about = "Scheduled errands for a personal assistant", long_about = None)]
struct Cli {
    /// Path to the task document (defaults to <data dir>/errand/db.json)
    #[arg(long, env = "ERRAND_STORE", global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon
    Daemon {
        /// Shell command that carries out a durable task (task JSON on stdin)
        #[arg(long, env = "ERRAND_TASK_COMMAND")]
        task_command: String,

        /// Shell command that prints a JSON array of new tasks
        #[arg(long, env = "ERRAND_POLL_COMMAND")]
        poll_command: Option<String>,

        /// Scheduler tick interval in milliseconds
        #[arg(long, default_value = "1000")]
        tick_ms: u64,

        /// Retries for each handler or poll command invocation
        #[arg(long, default_value = "2")]
        tool_retries: u32,
    },

    /// Inspect or edit durable tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List durable tasks, earliest first
    List {
        /// Print the raw JSON records
        #[arg(long)]
        json: bool,
    },

    /// Add a durable task. Stop the daemon first; it owns the document while running.
    Add {
        /// Instructions for the task
        task: String,

        /// Page the task should be performed on
        #[arg(long)]
        url: Option<String>,

        /// Delay in minutes
        #[arg(long)]
        minutes: Option<f64>,

        /// Delay in hours
        #[arg(long)]
        hours: Option<f64>,

        /// Delay in days
        #[arg(long)]
        days: Option<f64>,
    },
}

/// Default location of the task document.
fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("errand")
        .join("db.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "errand=info,errand_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let store_path = cli.store.unwrap_or_else(default_store_path);

    match cli.command {
        Commands::Daemon {
            task_command,
            poll_command,
            tick_ms,
            tool_retries,
        } => {
            daemon::run(daemon::DaemonConfig {
                store_path,
                task_command,
                poll_command,
                tick_interval: Duration::from_millis(tick_ms),
                tool_retries,
            })
            .await
        }

        Commands::Tasks { command } => match command {
            TaskCommands::List { json } => tasks::list(&store_path, json).await,
            TaskCommands::Add {
                task,
                url,
                minutes,
                hours,
                days,
            } => {
                let mut spec = TaskSpec::new(
                    task,
                    DelaySpec {
                        minutes,
                        hours,
                        days,
                    },
                );
                spec.url = url;
                tasks::add(&store_path, spec).await
            }
        },
    }
}

mod commands;
mod render;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Instrument;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// bughunt -- triage production errors into draft pull requests.
#[derive(Parser)]
#[command(name = "bughunt", version, about)]
struct Cli {
    /// Config file (default: ~/.bughunt/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit operator logs as JSON on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List unresolved issues from Sentry.
    Issues {
        /// Maximum number of issues to show.
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Investigate an error and pause for approval.
    Investigate {
        /// Sentry issue id.
        error_id: String,
        /// Task id (defaults to the error id).
        #[arg(long)]
        task_id: Option<String>,
    },

    /// Approve a paused task and open the draft pull request.
    Approve {
        task_id: String,
    },

    /// Reject a paused task.
    Reject {
        task_id: String,
    },

    /// Show one task.
    Status {
        task_id: String,
        /// Print the raw task as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List all tasks, most recently updated first.
    List,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Issues { .. } => "issues",
            Commands::Investigate { .. } => "investigate",
            Commands::Approve { .. } => "approve",
            Commands::Reject { .. } => "reject",
            Commands::Status { .. } => "status",
            Commands::List => "list",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;
    bh_telemetry::logging::init(
        "bughunt",
        &config.general.log_level,
        cli.json_logs || config.general.json_logs,
    );

    let (span, trace_id) = bh_telemetry::spans::create_operation_span(cli.command.name());
    tracing::debug!(%trace_id, "command started");

    async move {
        match cli.command {
            Commands::Issues { limit } => commands::issues::run(&config, limit).await,
            Commands::Investigate { error_id, task_id } => {
                commands::investigate::run(&config, &error_id, task_id.as_deref()).await
            }
            Commands::Approve { task_id } => {
                commands::decide::run(&config, &task_id, bh_core::types::Decision::Approved).await
            }
            Commands::Reject { task_id } => {
                commands::decide::run(&config, &task_id, bh_core::types::Decision::Rejected).await
            }
            Commands::Status { task_id, json } => commands::status::show(&config, &task_id, json),
            Commands::List => commands::status::list(&config),
        }
    }
    .instrument(span)
    .await
}

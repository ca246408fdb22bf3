//! tasksync CLI - inspect and drive the offline sync queue
//!
//! Local commands (queue, conflicts, activity) work without a server; `sync`
//! and `ping` need `server_url` configured.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use crate::cli::{ActivityCommands, Cli, Commands, ConflictCommands, QueueCommands};
use crate::commands::activity::{run_activity_list, run_activity_record};
use crate::commands::common::{load_settings, resolve_db_path};
use crate::commands::completions::run_completions;
use crate::commands::conflicts::{run_conflicts_dismiss, run_conflicts_list, run_conflicts_resolve};
use crate::commands::enqueue::run_enqueue;
use crate::commands::queue::{run_queue_list, run_queue_retry};
use crate::commands::status::run_status;
use crate::commands::sync::{run_ping, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let db_path = resolve_db_path(cli.db_path);
    let settings = load_settings(cli.config)?;

    match cli.command {
        Commands::Status { json } => run_status(json, &db_path, &settings).await?,
        Commands::Ping => run_ping(&db_path, &settings).await?,
        Commands::Enqueue {
            entity_type,
            entity_id,
            operation,
            payload,
            label,
        } => {
            run_enqueue(
                &entity_type,
                &entity_id,
                operation,
                payload.as_deref(),
                label.as_deref(),
                &db_path,
                &settings,
            )
            .await?;
        }
        Commands::Queue { command } => match command {
            QueueCommands::List { json } => run_queue_list(json, &db_path, &settings).await?,
            QueueCommands::Retry { id } => run_queue_retry(&id, &db_path, &settings).await?,
        },
        Commands::Sync { json } => run_sync(json, &db_path, &settings).await?,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { all, limit, json } => {
                run_conflicts_list(all, limit, json, &db_path, &settings).await?;
            }
            ConflictCommands::Resolve {
                id,
                resolution,
                merged,
                by,
            } => {
                run_conflicts_resolve(&id, resolution, merged.as_deref(), &by, &db_path, &settings)
                    .await?;
            }
            ConflictCommands::Dismiss { id } => {
                run_conflicts_dismiss(&id, &db_path, &settings).await?;
            }
        },
        Commands::Activity { command } => match command {
            ActivityCommands::Record {
                task_id,
                summary,
                kind,
                details,
                duration_ms,
            } => {
                run_activity_record(
                    &task_id,
                    &kind,
                    &summary,
                    details,
                    duration_ms,
                    &db_path,
                    &settings,
                )
                .await?;
            }
            ActivityCommands::List {
                task_id,
                limit,
                json,
            } => run_activity_list(&task_id, limit, json, &db_path, &settings).await?,
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}

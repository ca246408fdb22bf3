use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tasksync_core::models::{ChangeOperation, Resolution};

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "Inspect and drive the offline task sync queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the JSON settings file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show queue counts, open conflicts and the last clean sync
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check whether the sync server is reachable
    Ping,
    /// Queue a local mutation
    Enqueue {
        /// Entity type, e.g. `task`
        entity_type: String,
        /// Entity id
        entity_id: String,
        /// Mutation kind
        #[arg(value_enum)]
        operation: OperationArg,
        /// Entity snapshot as a JSON object (create/update)
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,
        /// Human readable entity name shown in progress output
        #[arg(long)]
        label: Option<String>,
    },
    /// Inspect or repair the pending change queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Push queued changes to the server now
    Sync {
        /// Output the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List and resolve sync conflicts
    Conflicts {
        #[command(subcommand)]
        command: ConflictCommands,
    },
    /// Record or list task activity
    Activity {
        #[command(subcommand)]
        command: ActivityCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List stored changes in queue order
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Put a permanently failed change back in line
    Retry {
        /// Change id
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConflictCommands {
    /// List conflicts awaiting a decision
    List {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show with --all
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle a conflict
    Resolve {
        /// Conflict id
        id: String,
        /// Which side wins
        #[arg(value_enum)]
        resolution: ResolutionArg,
        /// Merged entity snapshot (required for `merged`)
        #[arg(long, value_name = "JSON")]
        merged: Option<String>,
        /// Recorded as the resolver
        #[arg(long, default_value = "cli")]
        by: String,
    },
    /// Hide a conflict without resolving it
    Dismiss {
        /// Conflict id
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ActivityCommands {
    /// Record one activity entry for a task
    Record {
        /// Task id
        task_id: String,
        /// Short description
        summary: String,
        /// Activity kind
        #[arg(long, default_value = "command")]
        kind: String,
        /// Free-form details
        #[arg(long)]
        details: Option<String>,
        /// Duration in milliseconds
        #[arg(long, value_name = "MS")]
        duration_ms: Option<i64>,
    },
    /// List stored activity of a task
    List {
        /// Task id
        task_id: String,
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum OperationArg {
    Create,
    Update,
    Delete,
}

impl From<OperationArg> for ChangeOperation {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::Create => Self::Create,
            OperationArg::Update => Self::Update,
            OperationArg::Delete => Self::Delete,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum ResolutionArg {
    #[value(alias = "local")]
    KeepLocal,
    #[value(alias = "server")]
    KeepServer,
    Merged,
}

impl From<ResolutionArg> for Resolution {
    fn from(value: ResolutionArg) -> Self {
        match value {
            ResolutionArg::KeepLocal => Self::KeepLocal,
            ResolutionArg::KeepServer => Self::KeepServer,
            ResolutionArg::Merged => Self::Merged,
        }
    }
}

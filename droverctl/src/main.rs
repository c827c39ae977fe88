//! `droverctl`: inspect and repair the shared drover store.

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "droverctl", about = "Operator tool for drover queues and leases", version)]
struct Cli {
    /// Configuration file (TOML or JSON). Overrides DROVER_CONFIG_PATH.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Dotenv file loaded before reading the environment.
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    /// Postgres URL. Defaults to DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply the embedded schema migrations.
    Migrate,
    /// Print the live item count of a queue.
    Size {
        /// Queue name; defaults to the configured monitor queue.
        #[arg(long)]
        queue: Option<String>,
    },
    /// List the lowest-scored monitor chunks without dequeuing them.
    Peek {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
    /// Fill the monitor queue from stale workers.
    Populate {
        /// Only workers untouched for this many seconds are queued.
        #[arg(long, default_value_t = 60)]
        staleness_secs: u64,
        /// Drop every queued chunk first.
        #[arg(long)]
        clear_first: bool,
    },
    /// Report whether the head monitor chunk is due.
    Due,
    /// Force a monitor chunk to be checked immediately.
    Preempt {
        #[arg(long)]
        id: i64,
    },
    /// Return held items to the live queue.
    Restore {
        #[arg(long)]
        queue: Option<String>,
        /// Item ids; all held items when omitted.
        #[arg(long, value_delimiter = ',')]
        ids: Vec<i64>,
    },
    /// Permanently delete held items.
    Delete {
        #[arg(long)]
        queue: Option<String>,
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<i64>,
    },
    /// Inspect or clear leases.
    Lease {
        #[command(subcommand)]
        action: LeaseAction,
    },
}

#[derive(Subcommand)]
enum LeaseAction {
    /// Show the current holder of a lease key.
    Show {
        #[arg(long)]
        key: String,
        #[arg(long, value_enum, default_value = "object")]
        store: LeaseStoreArg,
    },
    /// Clear a lease regardless of its holder.
    Release {
        #[arg(long)]
        key: String,
        #[arg(long, value_enum, default_value = "object")]
        store: LeaseStoreArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LeaseStoreArg {
    /// `object_locks` table.
    Object,
    /// `workers.locked_by` / `workers.lock_time`.
    Worker,
    /// Redis at REDIS_URL.
    Redis,
}

#[tokio::main]
async fn main() -> Result<()> {
    drover_config::init_tracing("info,drover=info");

    let cli = Cli::parse();
    let ctx = commands::Context::load(
        cli.config.as_deref(),
        cli.env_file.as_deref(),
        cli.database_url,
    )?;

    match cli.command {
        Command::Migrate => commands::migrate(&ctx).await,
        Command::Size { queue } => commands::size(&ctx, queue).await,
        Command::Peek { queue, count } => commands::peek(&ctx, queue, count).await,
        Command::Populate {
            staleness_secs,
            clear_first,
        } => commands::populate(&ctx, staleness_secs, clear_first).await,
        Command::Due => commands::due(&ctx).await,
        Command::Preempt { id } => commands::preempt(&ctx, id).await,
        Command::Restore { queue, ids } => commands::restore(&ctx, queue, ids).await,
        Command::Delete { queue, ids } => commands::delete(&ctx, queue, ids).await,
        Command::Lease { action } => match action {
            LeaseAction::Show { key, store } => {
                commands::lease_show(&ctx, &key, store.into()).await
            }
            LeaseAction::Release { key, store } => {
                commands::lease_release(&ctx, &key, store.into()).await
            }
        },
    }
}

impl From<LeaseStoreArg> for commands::LeaseBackend {
    fn from(val: LeaseStoreArg) -> Self {
        match val {
            LeaseStoreArg::Object => commands::LeaseBackend::Object,
            LeaseStoreArg::Worker => commands::LeaseBackend::Worker,
            LeaseStoreArg::Redis => commands::LeaseBackend::Redis,
        }
    }
}

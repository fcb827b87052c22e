//! Canopy CLI - Command-line interface for inspecting workflow storage
//!
//! Provides subcommands for initializing a storage root and inspecting the
//! workflow instances persisted under it.

use canopy::runtime::error::{RuntimeError, StorageError};
use canopy::runtime::storage::{FileInstanceStore, InstanceStore};
use canopy::runtime::{Result, RuntimeConfig, WorkflowInstanceId};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "canopy")]
#[command(about = "Resumable workflow execution core", long_about = None)]
struct Cli {
    /// Root directory for runtime storage
    #[arg(short, long, default_value = ".canopy")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new storage root
    Init {
        /// Do not persist automatically when an instance goes idle
        #[arg(long)]
        no_persist_on_idle: bool,

        /// Seconds to wait for exclusive access to an instance
        #[arg(long, default_value = "30")]
        acquire_lock_secs: u64,
    },

    /// Show storage status
    Status,

    /// List persisted instances
    List,

    /// Show one persisted instance
    Show {
        /// Workflow instance id (UUID)
        id: String,
    },
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            no_persist_on_idle,
            acquire_lock_secs,
        } => {
            let mut config = RuntimeConfig {
                root: cli.root.clone(),
                persist_on_idle: !no_persist_on_idle,
                ..RuntimeConfig::default()
            };
            config.timeouts.acquire_lock = Duration::from_secs(acquire_lock_secs);

            config.init()?;
            println!("Initialized Canopy storage at {:?}", cli.root);
        }

        Commands::Status => {
            let config = RuntimeConfig::load(&cli.root)?;
            let store = FileInstanceStore::open(&config.root)?;
            println!("Storage root: {:?}", store.storage().root());
            println!("Persist on idle: {}", config.persist_on_idle);
            println!("Dispatcher: {:?}", config.dispatcher);
            println!("Persisted instances: {}", store.list()?.len());
        }

        Commands::List => {
            let store = FileInstanceStore::open(&cli.root)?;
            for id in store.list()? {
                let snapshot = store.load(id)?;
                let state = match &snapshot.outcome {
                    Some(outcome) => format!("{:?}", outcome.state()),
                    None => "Executing".to_string(),
                };
                println!(
                    "{}  {}  {}  {} instances, {} bookmarks",
                    id,
                    snapshot.identity,
                    state,
                    snapshot.instance_count(),
                    snapshot.bookmarks.records.len()
                );
            }
        }

        Commands::Show { id } => {
            let id: WorkflowInstanceId = id
                .parse()
                .map_err(|err| RuntimeError::Config(format!("invalid instance id: {err}")))?;
            let store = FileInstanceStore::open(&cli.root)?;
            let snapshot = store.load(id)?;
            let json = serde_json::to_string_pretty(&snapshot).map_err(StorageError::from)?;
            println!("{json}");
        }
    }

    Ok(())
}

//! Rehydra CLI - inspect, seed and purge persisted state

mod commands;

use clap::{Parser, Subcommand};
use commands::{load_json, load_options, StoreClient};
use rehydra_core::PersistOptions;
use rehydra_state::create_sled_storage;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rehydra")]
#[command(about = "Inspect and manage persisted rehydra state")]
#[command(version)]
struct Cli {
    /// Database directory
    #[arg(long)]
    db: Option<PathBuf>,

    /// Persist options file (JSON)
    #[arg(short, long)]
    options: Option<PathBuf>,

    /// Log level or filter directive
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted keys
    Keys,

    /// Print the stored state of a key
    Inspect {
        /// Logical key
        key: String,

        /// Print the blob as stored instead of decoding it
        #[arg(long)]
        raw: bool,
    },

    /// Persist a JSON object as the state of a key
    Seed {
        /// Logical key
        key: String,

        /// JSON file holding the state object
        file: PathBuf,
    },

    /// Remove the stored state of a key
    Purge {
        /// Logical key
        key: String,
    },
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("rehydra"))
        .unwrap_or_else(|| PathBuf::from("./rehydra-data"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let options = match &cli.options {
        Some(path) => load_options(path)?,
        None => PersistOptions::default(),
    };
    let db_path = cli.db.unwrap_or_else(default_db_path);
    let client = StoreClient::new(create_sled_storage(&db_path)?, options);

    match cli.command {
        Commands::Keys => {
            let keys = client.keys()?;
            if keys.is_empty() {
                println!("No persisted keys in {}", db_path.display());
            } else {
                for key in keys {
                    println!("{}", key);
                }
            }
        }

        Commands::Inspect { key, raw } => {
            if raw {
                match client.raw(&key).await? {
                    Some(blob) => println!("{}", blob),
                    None => println!("No stored state for '{}'", key),
                }
            } else {
                match client.inspect(&key).await? {
                    Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                    None => println!("No stored state for '{}'", key),
                }
            }
        }

        Commands::Seed { key, file } => {
            let state = load_json(&file)?;
            let written = client.seed(&key, state).await?;
            println!("Seeded {} keys into '{}'", written, key);
        }

        Commands::Purge { key } => {
            client.purge(&key).await?;
            println!("Purged '{}'", key);
        }
    }

    Ok(())
}

//! OVault CLI - Offline content storage from the command line
//!
//! Downloads streaming presentations and keeps them playable offline.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// OVault - Offline Content Storage
#[derive(Parser)]
#[command(name = "ovault")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Data directory for OVault
    #[arg(long, env = "OVAULT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download and store a presentation for offline playback
    Store {
        /// Source manifest URL
        source: String,

        /// Request a persistent license for protected content
        #[arg(long)]
        persistent_license: bool,

        /// Segment fetch concurrency budget
        #[arg(short, long)]
        concurrency: Option<u32>,

        /// Speed limit in bytes/sec
        #[arg(long)]
        speed_limit: Option<u64>,
    },

    /// List stored content
    List {
        /// Show all details
        #[arg(short, long)]
        all: bool,
    },

    /// Show a stored record
    Info {
        /// Offline URI
        uri: String,
    },

    /// Remove stored content
    Remove {
        /// Offline URI
        uri: String,
    },

    /// Remove all stored content
    DeleteAll {
        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Cancel an in-flight store session
    Cancel {
        /// Source identifier
        source: String,
    },

    /// Check whether this environment supports offline storage
    Support,

    /// Show/update engine configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key
        key: String,

        /// Config value
        value: String,
    },

    /// Show all config
    Show,

    /// Reset to defaults
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "ovault_core=debug,ovault=debug".into()),
            )
            .init();
    }

    // Determine data directory
    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::data_dir()
            .map(|d| d.join("ovault"))
            .unwrap_or_else(|| PathBuf::from(".ovault"))
    });

    // Execute command
    match cli.command {
        Commands::Store {
            source,
            persistent_license,
            concurrency,
            speed_limit,
        } => {
            commands::store(
                &data_dir,
                &source,
                persistent_license,
                concurrency,
                speed_limit,
                cli.output,
            )
            .await?
        }

        Commands::List { all } => commands::list(&data_dir, all, cli.output).await?,

        Commands::Info { uri } => commands::info(&data_dir, &uri, cli.output).await?,

        Commands::Remove { uri } => commands::remove(&data_dir, &uri, cli.output).await?,

        Commands::DeleteAll { yes } => commands::delete_all(&data_dir, yes, cli.output).await?,

        Commands::Cancel { source } => commands::cancel(&data_dir, &source, cli.output).await?,

        Commands::Support => commands::support(&data_dir, cli.output).await?,

        Commands::Config { action } => commands::config_action(&data_dir, action, cli.output).await?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "ovault", &mut std::io::stdout());
        }
    }

    Ok(())
}

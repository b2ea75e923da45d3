use std::path::PathBuf;

use clap::{Parser, Subcommand};
use semvault::Result;
use semvault::commands::{
    index_directory, purge_corrupted, remove_path, rename_path, search_index, show_status,
    upgrade_vectors,
};
use semvault::config::{BASE_DIR_ENV, Config, init_config, show_config};

#[derive(Parser)]
#[command(name = "semvault")]
#[command(about = "Local semantic index over a document collection")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and the embeddings database
    #[arg(long, global = true, env = BASE_DIR_ENV)]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Embed new and changed documents below a directory
    Index {
        /// Root of the document collection
        dir: PathBuf,
    },
    /// Search indexed documents by meaning
    Search {
        query: String,
        /// Maximum number of results
        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },
    /// Move stored vectors after a file or directory was renamed
    Rename { old: String, new: String },
    /// Drop stored vectors of a deleted file or directory
    Remove { path: String },
    /// Repair or remove corrupted vectors
    Purge,
    /// Rewrite stored vectors into the current canonical format
    Upgrade,
    /// Show storage and provider status
    Status,
    /// Create the configuration file, or show it
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let base_dir = match cli.base_dir {
        Some(dir) => dir,
        None => Config::default_base_dir()?,
    };

    if let Commands::Config { show } = cli.command {
        let (config, created) = init_config(&base_dir)?;
        if created {
            eprintln!("Wrote default configuration to {}", config.config_file_path().display());
        }
        if show || !created {
            show_config(&config);
        }
        return Ok(());
    }

    let config = Config::load(&base_dir)?;
    match cli.command {
        Commands::Index { dir } => {
            let result = index_directory(&config, &dir).await?;
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Search { query, limit } => {
            search_index(&config, &query, limit).await?;
        }
        Commands::Rename { old, new } => {
            rename_path(&config, &old, &new).await?;
        }
        Commands::Remove { path } => {
            remove_path(&config, &path).await?;
        }
        Commands::Purge => {
            purge_corrupted(&config).await?;
        }
        Commands::Upgrade => {
            upgrade_vectors(&config).await?;
        }
        Commands::Status => {
            show_status(&config).await?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

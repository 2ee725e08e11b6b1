use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use textbook_rag::commands::{ask, ingest, load_config, reset_store, show_status};
use textbook_rag::config::show_config;

#[derive(Parser)]
#[command(name = "textbook-rag")]
#[command(about = "Grounded question answering over Markdown textbook chapters")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and the vector store (default ~/.textbook-rag)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Chunk, embed and store every Markdown file in a directory
    Ingest {
        /// Directory containing chapter files
        dir: PathBuf,
        /// Clear the vector store before ingesting
        #[arg(long)]
        reset: bool,
    },
    /// Ask a question about the ingested material
    Ask {
        question: String,
        /// Only use material from this chapter
        #[arg(long)]
        chapter: Option<u32>,
        /// Print the answer as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove everything from the vector store
    Reset,
    /// Show provider connectivity and store contents
    Status,
    /// Write the effective configuration to config.toml
    Config {
        /// Print the configuration instead of writing it
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
    let config = load_config(cli.config_dir.as_deref())?;

    match cli.command {
        Commands::Ingest { dir, reset } => {
            ingest(&config, &dir, reset).await?;
        }
        Commands::Ask {
            question,
            chapter,
            json,
        } => {
            ask(&config, &question, chapter, json).await?;
        }
        Commands::Reset => {
            reset_store(&config).await?;
        }
        Commands::Status => {
            show_status(&config).await?;
        }
        Commands::Config { show } => {
            if show {
                show_config(&config)?;
            } else {
                config.save()?;
                println!("Configuration written to {}", config.config_file_path().display());
            }
        }
    }

    Ok(())
}

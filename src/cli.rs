use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "semdex", version, about = "Local semantic document index")]
pub struct Cli {
    /// Override the data directory (default: $SEMDEX_DATA_DIR or the
    /// XDG data home).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Base URL of the embedding model service.
    #[arg(long, global = true, default_value = "http://127.0.0.1:8000")]
    pub endpoint: String,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Index documents under a collection key.
    Index {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long, default_value = "default")]
        key: String,

        /// Copy each file into the managed Docs/ directory (read-only)
        /// and index the copy.
        #[arg(long)]
        copy: bool,
    },

    /// Re-index documents (delete then insert).
    Update {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long, default_value = "default")]
        key: String,
    },

    /// Remove documents from the index.
    Delete {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long, default_value = "default")]
        key: String,
    },

    /// Run a top-K semantic query and print the result JSON.
    Search {
        query: String,

        #[arg(short, long, default_value = "default")]
        key: String,

        #[arg(short = 'n', long, default_value_t = 10)]
        top_k: usize,
    },

    /// List every indexed source path.
    Sources {
        #[arg(short, long, default_value = "default")]
        key: String,
    },

    /// Check whether a key has any indexed content.
    Exists {
        #[arg(short, long, default_value = "default")]
        key: String,
    },

    /// Drop metadata left behind by deleted documents.
    Purge {
        #[arg(short, long, default_value = "default")]
        key: String,
    },
}

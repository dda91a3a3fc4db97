use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command};
use semdex::{DataDir, EmbedderConfig, Engine, IndexWorker, RemoteEmbedder};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("SEMDEX_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> semdex::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config = EmbedderConfig::new(cli.endpoint.clone());
    let embedder = Arc::new(RemoteEmbedder::new(&config)?);
    let worker = IndexWorker::spawn(Engine::new(data_dir, embedder));

    let ok = match cli.command {
        Command::Index { files, key, copy } => {
            if copy {
                worker.create_index_copy(files, &key)
            } else {
                worker.create_index(files, &key)
            }
        }
        Command::Update { files, key } => worker.update_index(files, &key),
        Command::Delete { files, key } => worker.delete_index(files, &key),
        Command::Search { query, key, top_k } => {
            println!("{}", worker.vector_search(&query, &key, top_k)?);
            true
        }
        Command::Sources { key } => {
            for source in worker.list_sources(&key)? {
                println!("{source}");
            }
            true
        }
        Command::Exists { key } => {
            let exists = worker.index_exists(&key);
            println!("{exists}");
            exists
        }
        Command::Purge { key } => {
            let purged = worker.engine().purge(&key)?;
            eprintln!("purged {purged} records");
            true
        }
    };

    worker.shutdown();
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

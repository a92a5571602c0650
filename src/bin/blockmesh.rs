//! blockmesh node binary
//!
//! Runs a node, works with a local block store directly, or computes
//! content identifiers offline.

use anyhow::{bail, Context, Result};
use blockmesh::{BlockStore, Config, ContentId, Node};
use clap::{Parser, Subcommand};
use env_logger::Env;
use std::io::Write;
use std::path::{Path, PathBuf};

const DEFAULT_DATA_DIR: &str = "./data";

#[derive(Parser, Debug)]
#[command(name = "blockmesh")]
#[command(about = "Content-addressed block store with peer-to-peer retrieval", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until interrupted
    Start {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Block store directory (overrides the config file)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Peer listener address (overrides the config file)
        #[arg(short, long)]
        listen: Option<String>,

        /// Peer to dial at start-up, e.g. ws://127.0.0.1:9081 (repeatable)
        #[arg(short, long = "peer")]
        peers: Vec<String>,
    },

    /// Add a file to the local block store
    Add {
        /// File to add
        file: PathBuf,

        /// Block store directory
        #[arg(short, long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
    },

    /// Print a block held in the local store
    Cat {
        /// Content identifier
        id: String,

        /// Block store directory
        #[arg(short, long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,

        /// Write the block to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List blocks in the local store, newest first
    List {
        /// Block store directory
        #[arg(short, long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
    },

    /// Show local store statistics
    Stats {
        /// Block store directory
        #[arg(short, long, default_value = DEFAULT_DATA_DIR)]
        data_dir: PathBuf,
    },

    /// Print the content identifier of a string or file
    Hash {
        /// Input string, or a path when --file is given
        input: String,

        /// Treat the input as a file path
        #[arg(short, long)]
        file: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            config,
            data_dir,
            listen,
            peers,
        } => {
            let mut config = match config {
                Some(path) => Config::load(&path)
                    .with_context(|| format!("Failed to load config from {:?}", path))?,
                None => Config::new(data_dir.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))),
            };
            if let Some(data_dir) = data_dir {
                config.node.data_dir = data_dir;
            }
            if let Some(listen) = listen {
                config.node.listen = listen;
            }
            config.network.peers.extend(peers);
            config.validate().context("Invalid configuration")?;

            // Initialize logging
            env_logger::Builder::from_env(Env::default().default_filter_or(config.node.log_level.as_str())).init();

            run(config).await
        }
        Command::Add { file, data_dir } => cmd_add(&data_dir, &file),
        Command::Cat { id, data_dir, output } => cmd_cat(&data_dir, &id, output.as_deref()),
        Command::List { data_dir } => cmd_list(&data_dir),
        Command::Stats { data_dir } => cmd_stats(&data_dir),
        Command::Hash { input, file } => {
            let data = if file {
                std::fs::read(&input).with_context(|| format!("Failed to read {:?}", input))?
            } else {
                input.into_bytes()
            };
            println!("{}", ContentId::derive(&data));
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    log::info!("Starting blockmesh node");
    log::info!("  Data directory: {:?}", config.node.data_dir);
    log::info!("  Listen address: {}", config.node.listen);
    log::info!("  Request timeout: {} ms", config.network.request_timeout_ms);

    let node = Node::open(config).context("Failed to open node")?;
    let addr = node.start().await.context("Failed to start peer listener")?;
    log::info!("Node {} reachable at ws://{}", node.network().local_id(), addr);

    let stats = node.stats().await?;
    log::info!("  Blocks: {} ({})", stats.count, stats.human_readable_total);

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
    log::info!("Shutting down");
    Ok(())
}

fn open_store(data_dir: &Path) -> Result<BlockStore> {
    BlockStore::new(data_dir).with_context(|| format!("Failed to open block store at {:?}", data_dir))
}

fn cmd_add(data_dir: &Path, file: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());

    let store = open_store(data_dir)?;
    let id = store.store(&data, filename, None)?;
    println!("Added file: {}", id);
    Ok(())
}

fn cmd_cat(data_dir: &Path, id: &str, output: Option<&Path>) -> Result<()> {
    let store = open_store(data_dir)?;
    let Some(data) = store.retrieve(id)? else {
        bail!("File not found: {}", id);
    };

    match output {
        Some(path) => {
            std::fs::write(path, &data).with_context(|| format!("Failed to write {:?}", path))?;
            println!("File saved to: {:?}", path);
        }
        None => std::io::stdout().write_all(&data)?,
    }
    Ok(())
}

fn cmd_list(data_dir: &Path) -> Result<()> {
    let store = open_store(data_dir)?;
    let blocks = store.list()?;

    if blocks.is_empty() {
        println!("No files stored");
        return Ok(());
    }

    println!("Stored files:");
    for meta in blocks {
        println!(
            "{} - {} ({} bytes)",
            meta.id,
            meta.filename.as_deref().unwrap_or("unnamed"),
            meta.size
        );
    }
    Ok(())
}

fn cmd_stats(data_dir: &Path) -> Result<()> {
    let stats = open_store(data_dir)?.stats()?;

    println!("Storage Statistics:");
    println!("  Total files: {}", stats.count);
    println!("  Total size:  {}", stats.human_readable_total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_add_then_cat_to_file() {
        let temp = TempDir::new().unwrap();
        let data_dir = temp.path().join("data");
        let input = temp.path().join("notes.txt");
        std::fs::write(&input, b"offline block").unwrap();

        cmd_add(&data_dir, &input).unwrap();

        let id = ContentId::derive(b"offline block");
        let store = BlockStore::new(&data_dir).unwrap();
        let meta = store.stat(id.as_str()).unwrap().unwrap();
        assert_eq!(meta.filename.as_deref(), Some("notes.txt"));

        let output = temp.path().join("out.txt");
        cmd_cat(&data_dir, id.as_str(), Some(&output)).unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"offline block");

        cmd_list(&data_dir).unwrap();
        cmd_stats(&data_dir).unwrap();
    }

    #[test]
    fn test_cat_missing_and_invalid() {
        let temp = TempDir::new().unwrap();

        let missing = ContentId::derive(b"not here");
        assert!(cmd_cat(temp.path(), missing.as_str(), None).is_err());
        assert!(cmd_cat(temp.path(), "garbage", None).is_err());
        assert!(cmd_add(temp.path(), &temp.path().join("no-such-file")).is_err());
    }

    #[test]
    fn test_cli_parses_store_commands() {
        let cli = Cli::try_parse_from(["blockmesh", "cat", "QmX", "--data-dir", "/tmp/d", "-o", "out"]).unwrap();
        match cli.command {
            Command::Cat { id, data_dir, output } => {
                assert_eq!(id, "QmX");
                assert_eq!(data_dir, PathBuf::from("/tmp/d"));
                assert_eq!(output, Some(PathBuf::from("out")));
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::try_parse_from(["blockmesh", "list"]).unwrap();
        assert!(matches!(cli.command, Command::List { data_dir } if data_dir == PathBuf::from(DEFAULT_DATA_DIR)));
    }
}

//! `folio` - inspect and edit a folio package from the command line.

use clap::{Parser, Subcommand};
use folio_store::{Store, StoreConfig, Value};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "folio", version, about = "File-package key-value store")]
struct Cli {
    /// Package directory (overrides FOLIO_PACKAGE)
    #[arg(long, global = true)]
    package: Option<PathBuf>,

    /// Device identifier (overrides FOLIO_DEVICE_ID)
    #[arg(long, global = true)]
    device: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the value of a key as JSON
    Get { key: String },
    /// Set a key to a JSON value
    Set { key: String, value: String },
    /// Delete a key
    Delete { key: String },
    /// Print every key and value
    List,
    /// Merge other devices' journals and flush
    Sync,
    /// Latest folded timestamp per device
    Timestamps,
    /// Every recorded change to a key
    History { key: String },
    /// Manage blobs
    Blob {
        #[command(subcommand)]
        cmd: BlobCmd,
    },
}

#[derive(Subcommand)]
enum BlobCmd {
    /// Copy a file into the package
    Put { source: PathBuf, path: String },
    /// Write a blob to stdout or to a file
    Get {
        path: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Remove a blob
    Rm { path: String },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "folio_store=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    dotenvy::dotenv().ok();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> CliResult {
    let mut config = StoreConfig::from_env_with(cli.device)?;
    if let Some(package) = cli.package {
        config.location = Some(package);
    }
    if config.location.is_none() {
        return Err("no package given: pass --package or set FOLIO_PACKAGE".into());
    }

    let store = Store::new(config)?;
    store.load_now()?;
    store.sync_now()?;

    match cli.cmd {
        Command::Get { key } => match store.get_now(&key)? {
            Some(value) => println!("{}", value.to_plain_json()),
            None => return Err(format!("key not found: {key}").into()),
        },
        Command::Set { key, value } => {
            let json: serde_json::Value = serde_json::from_str(&value)?;
            store.set(key, Value::from(json)).wait()?;
        }
        Command::Delete { key } => store.delete(key).wait()?,
        Command::List => {
            for (key, value) in store.all_values_now()? {
                println!("{key}\t{}", value.to_plain_json());
            }
        }
        Command::Sync => {}
        Command::Timestamps => {
            for (device, timestamp) in store.most_recent_timestamps_by_device_now()? {
                println!("{device}\t{timestamp}");
            }
        }
        Command::History { key } => {
            for record in store.history_now(&key)? {
                let value = match record.change.value() {
                    Some(value) => value.to_plain_json().to_string(),
                    None => "<deleted>".to_string(),
                };
                println!("{}\t{}\t{value}", record.timestamp, record.device_id);
            }
        }
        Command::Blob { cmd } => match cmd {
            BlobCmd::Put { source, path } => store.write_blob_from_path_now(source, &path)?,
            BlobCmd::Get { path, output } => {
                let data = store.read_blob_now(&path)?;
                match output {
                    Some(output) => std::fs::write(output, data)?,
                    None => std::io::Write::write_all(&mut std::io::stdout(), &data)?,
                }
            }
            BlobCmd::Rm { path } => store.delete_blob_now(&path)?,
        },
    }

    store.close_now()?;
    Ok(())
}

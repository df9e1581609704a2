//! putbridge - stream a payload into a destination object
//!
//! Reads bytes from a file or stdin, hands them to an upload worker through
//! a blocking write handle, and exits once the object is finalized.

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use putbridge::logging::init_logging;
use putbridge::storage::FsDestination;
use putbridge::upload::{TransferOptions, UploadRequest, Uploader};
use putbridge::Config;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// putbridge - blocking uploads into a directory-backed object store
#[derive(Parser, Debug)]
#[command(name = "putbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a payload to BUCKET/OBJECT
    Put(PutArgs),
}

#[derive(ClapArgs, Debug)]
struct PutArgs {
    bucket: String,

    object: String,

    /// Exact number of bytes to upload
    #[arg(long, allow_negative_numbers = true)]
    size: i64,

    /// Expected SHA-256 of the payload (hex)
    #[arg(long)]
    sha256: Option<String>,

    /// Read the payload from this file instead of stdin
    #[arg(long)]
    file: Option<PathBuf>,

    /// Storage root, overrides the configuration
    #[arg(long)]
    root: Option<PathBuf>,

    /// Print Prometheus metrics to stdout when done
    #[arg(long)]
    print_metrics: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => Config::default_with_root("./data"),
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    init_logging(&config.logging)?;
    info!("Starting putbridge v{}", putbridge::VERSION);

    match args.command {
        Command::Put(put) => run_put(config, put),
    }
}

fn run_put(mut config: Config, put: PutArgs) -> anyhow::Result<()> {
    if let Some(root) = put.root {
        config.storage.root = root;
    }
    config.validate()?;

    let uploader = Uploader::new(
        Arc::new(FsDestination::from_config(&config.storage)),
        TransferOptions::from_config(&config),
    );

    let mut request = UploadRequest::new(put.bucket, put.object, put.size);
    if let Some(digest) = put.sha256 {
        request = request.with_digest(digest);
    }

    let mut source: Box<dyn Read> = match put.file {
        Some(ref path) => {
            Box::new(File::open(path).with_context(|| format!("opening {}", path.display()))?)
        }
        None => Box::new(io::stdin().lock()),
    };

    let target = format!("{}/{}", request.bucket, request.object);
    let bytes = uploader
        .put_reader(request, &mut source)
        .with_context(|| format!("uploading {target}"))?;
    info!(object = %target, bytes, "Uploaded");

    if put.print_metrics {
        print_metrics()?;
    }

    Ok(())
}

#[cfg(feature = "metrics")]
fn print_metrics() -> anyhow::Result<()> {
    print!("{}", putbridge::metrics::gather_text()?);
    Ok(())
}

#[cfg(not(feature = "metrics"))]
fn print_metrics() -> anyhow::Result<()> {
    anyhow::bail!("built without the metrics feature")
}

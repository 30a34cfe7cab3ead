use std::path::PathBuf;

use clap::{Parser, Subcommand};
use resplog::{Aof, AofConfig, Error, Frame, FsyncPolicy};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Inspect, repair and write RESP append only files")]
struct Args {
    /// When appended records are flushed to disk
    #[arg(long, env = "RESPLOG_FSYNC", value_enum, default_value_t = FsyncPolicy::EverySec)]
    fsync: FsyncPolicy,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print every record in the file
    Dump { path: PathBuf },
    /// Check that every record decodes
    Check {
        path: PathBuf,
        /// Cut a torn last record off the file
        #[arg(long)]
        fix: bool,
    },
    /// Append one command, e.g. `append app.aof SET foo bar`
    Append {
        path: PathBuf,
        #[arg(required = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();
    let config = AofConfig {
        fsync: args.fsync,
        ..AofConfig::default()
    };

    match args.command {
        Cmd::Dump { path } => {
            let aof = Aof::open_with(&path, config)?;
            let res = aof.replay(|frame| println!("{}", frame));
            aof.shutdown().await?;
            res?;
        }
        Cmd::Check { path, fix } => {
            let aof = Aof::open_with(&path, config)?;
            let res = if fix {
                aof.repair().map(|truncated| match truncated {
                    Some(offset) => warn!(offset, "dropped truncated record"),
                    None => info!("append only file is valid"),
                })
            } else {
                aof.replay(|_| {})
                    .map(|records| info!(records, "append only file is valid"))
            };
            aof.shutdown().await?;
            res?;
        }
        Cmd::Append { path, args } => {
            let aof = Aof::open_with(&path, config)?;
            let frame = Frame::command(&args);
            aof.append(&frame)?;
            info!("appended {}", frame);
            aof.shutdown().await?;
        }
    }

    Ok(())
}

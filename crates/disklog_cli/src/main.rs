//! DiskLog CLI
//!
//! Command-line tools for inspecting and maintaining a disk log.
//!
//! # Commands
//!
//! - `index` - Display the segment index
//! - `validate` - Check the index and every record checksum
//! - `dump` - Print events starting at a seqno
//! - `delete` - Delete events from the start or end of the log

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// DiskLog command-line tools.
#[derive(Parser)]
#[command(name = "disklog")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the log directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display the segment index
    Index {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate the index and record checksums
    Validate,

    /// Print events
    Dump {
        /// First seqno to print (defaults to the start of the log)
        #[arg(long)]
        from: Option<u64>,

        /// Maximum number of events to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Keep waiting for new events at the end of the log
        #[arg(long)]
        follow: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Delete events from the start or the end of the log
    Delete {
        /// Lowest seqno to delete (defaults to the start of the log)
        #[arg(long)]
        low: Option<u64>,

        /// Highest seqno to delete (defaults to the end of the log)
        #[arg(long)]
        high: Option<u64>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Index { format } => {
            let path = cli.path.ok_or("Log directory required for index")?;
            commands::index::run(&path, &format)?;
        }
        Commands::Validate => {
            let path = cli.path.ok_or("Log directory required for validate")?;
            commands::validate::run(&path)?;
        }
        Commands::Dump {
            from,
            limit,
            follow,
            format,
        } => {
            let path = cli.path.ok_or("Log directory required for dump")?;
            commands::dump::run(&path, from, limit, follow, &format)?;
        }
        Commands::Delete { low, high } => {
            let path = cli.path.ok_or("Log directory required for delete")?;
            commands::delete::run(&path, low, high)?;
        }
        Commands::Version => {
            println!("DiskLog CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("DiskLog Core v{}", disklog_core::VERSION);
        }
    }

    Ok(())
}

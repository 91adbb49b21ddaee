//! mfsck Command Line Interface
//!
//! Check, repair, make and inspect MINIX V2/V3 filesystem images.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{debug, LevelFilter};

mod commands;

/// mfsck - offline checker and repairer for MINIX filesystems
#[derive(Parser)]
#[command(
    name = "mfsck",
    about = "MINIX V2/V3 filesystem checker",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check and repair a filesystem
    Check(commands::check::CheckArgs),

    /// Make an empty MINIX V3 filesystem
    Format(commands::format::FormatArgs),

    /// Show the superblock or inodes of a filesystem
    Inspect(commands::inspect::InspectArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new().filter_level(log_level).init();

    debug!("mfsck v{} starting", env!("CARGO_PKG_VERSION"));

    let result: Result<i32> = match cli.command {
        Commands::Check(args) => commands::check::run(args).await,
        Commands::Format(args) => commands::format::run(args).await.map(|_| 0),
        Commands::Inspect(args) => commands::inspect::run(args).await.map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("mfsck: {:#}", e);
            std::process::exit(commands::check::EXIT_OPERATIONAL);
        }
    }
}

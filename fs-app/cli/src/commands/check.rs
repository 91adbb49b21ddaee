//! Check command: verify and repair a filesystem

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use mfsck::blockdev::FileBackedBlockDevice;
use mfsck::policy::{DEFAULT_BLOCK_CACHE, DEFAULT_INODE_CACHE, DEFAULT_REPORT_CAP};
use mfsck::{CheckOptions, Checker, Confirm, Defect, FsckReport, RepairPolicy};

/// No defects, or the check was skipped
pub const EXIT_CLEAN: i32 = 0;
/// Defects were found and all of them repaired
pub const EXIT_CORRECTED: i32 = 1;
/// Defects remain on the filesystem
pub const EXIT_UNCORRECTED: i32 = 4;
/// The check could not run
pub const EXIT_OPERATIONAL: i32 = 8;

/// Check and repair a MINIX filesystem
#[derive(Parser, Debug)]
#[command(about = "Check and repair a MINIX V2/V3 filesystem")]
pub struct CheckArgs {
    /// Device or image file to check
    pub device: PathBuf,

    /// List defects only; open the device read-only
    #[arg(short = 'n', long = "no", conflicts_with = "auto")]
    pub list_only: bool,

    /// Repair without asking, using the safe default for every defect
    #[arg(
        short = 'a',
        long = "auto",
        visible_short_alias = 'p',
        visible_alias = "preen"
    )]
    pub auto: bool,

    /// Check even if the filesystem is marked clean
    #[arg(short, long)]
    pub force: bool,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,

    /// Inode cache slots
    #[arg(long = "inode-cache", default_value_t = DEFAULT_INODE_CACHE)]
    pub inode_cache: usize,

    /// Block cache size in blocks
    #[arg(long = "block-cache", default_value_t = DEFAULT_BLOCK_CACHE)]
    pub block_cache: usize,

    /// Bitmap defects listed per bitmap before the rest are summarized
    #[arg(long = "max-report-lines", default_value_t = DEFAULT_REPORT_CAP)]
    pub max_report_lines: usize,
}

impl CheckArgs {
    fn options(&self) -> CheckOptions {
        let policy = if self.list_only {
            RepairPolicy::ListOnly
        } else if self.auto {
            RepairPolicy::Automatic
        } else {
            RepairPolicy::Interactive
        };
        CheckOptions {
            policy,
            force: self.force,
            inode_cache: self.inode_cache,
            block_cache: self.block_cache,
            max_report_lines: self.max_report_lines,
        }
    }
}

/// Asks on the terminal; answers "no" when stdin is not one
struct TerminalPrompt {
    interactive: bool,
}

impl TerminalPrompt {
    fn new() -> Self {
        Self {
            interactive: io::stdin().is_terminal(),
        }
    }
}

impl Confirm for TerminalPrompt {
    fn confirm(&mut self, defect: &Defect) -> bool {
        let action = defect.resolution().unwrap_or("repair");
        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "{}. {}? [y/N] ", defect, action);

        if !self.interactive {
            let _ = writeln!(stdout, "no");
            return false;
        }
        let _ = stdout.flush();
        drop(stdout);

        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes" | "Yes")
    }
}

pub async fn run(args: CheckArgs) -> Result<i32> {
    let options = args.options();
    let device = FileBackedBlockDevice::open(&args.device, !options.may_write())
        .await
        .with_context(|| format!("Failed to open {}", args.device.display()))?;

    info!("Checking {} ({:?})", args.device.display(), options.policy);
    let start_time = Instant::now();

    let checker = Checker::new(Arc::new(device), options);
    let mut prompt = TerminalPrompt::new();
    let report = checker
        .run(&mut prompt)
        .await
        .with_context(|| format!("Failed to check {}", args.device.display()))?;

    info!(
        "Check finished in {:.2} seconds",
        start_time.elapsed().as_secs_f64()
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&args, &report);
    }
    Ok(exit_code(&report))
}

fn print_report(args: &CheckArgs, report: &FsckReport) {
    if report.skipped {
        println!("{}: clean, not checked", args.device.display());
        return;
    }

    for line in report.defect_lines() {
        println!("{}", line);
    }

    println!();
    for line in report.summary_lines() {
        println!("{}", line);
    }

    if report.is_clean() {
        println!("\n{}: no defects found", args.device.display());
    } else {
        println!(
            "\n{}: {} defects, {} repaired, {} left",
            args.device.display(),
            report.defect_count(),
            report.repair_count(),
            report.unrepaired_count()
        );
    }
}

fn exit_code(report: &FsckReport) -> i32 {
    if report.unrepaired_count() > 0 {
        EXIT_UNCORRECTED
    } else if report.repair_count() > 0 {
        EXIT_CORRECTED
    } else {
        EXIT_CLEAN
    }
}

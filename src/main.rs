use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::warn;

use wim::{
    check_root, is_block_device, CopyEndpoint, Disk, ExpandPlan, FsFamily, ImageSpec,
    PartitionAction, PartitionListing, ToolConfig, Transfer, WriteReport,
};

const BUILD_TIMESTAMP: u64 = const_parse_u64(env!("BUILD_TIMESTAMP"));
const GIT_HASH: &str = env!("GIT_HASH");

const fn const_parse_u64(s: &str) -> u64 {
    let bytes = s.as_bytes();
    let mut result: u64 = 0;
    let mut i = 0;
    while i < bytes.len() {
        result = result * 10 + (bytes[i] - b'0') as u64;
        i += 1;
    }
    result
}

fn format_build_time() -> String {
    let secs = BUILD_TIMESTAMP;
    // Simple UTC formatting: YYYY-MM-DD HH:MM:SS
    let days_since_epoch = secs / 86400;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    // Calculate year/month/day from days since 1970-01-01
    let (year, month, day) = days_to_ymd(days_since_epoch);

    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        year, month, day, hours, minutes, seconds
    )
}

fn days_to_ymd(days: u64) -> (u64, u64, u64) {
    let mut remaining = days as i64;
    let mut year = 1970i64;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining < days_in_year {
            break;
        }
        remaining -= days_in_year;
        year += 1;
    }

    let days_in_months: [i64; 12] = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1i64;
    for days in days_in_months {
        if remaining < days {
            break;
        }
        remaining -= days;
        month += 1;
    }

    (year as u64, month as u64, (remaining + 1) as u64)
}

fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

fn version_long() -> String {
    format!(
        "{} (built {} git:{})",
        env!("CARGO_PKG_VERSION"),
        format_build_time(),
        GIT_HASH
    )
}

#[derive(Parser)]
#[command(name = "wim")]
#[command(author, version, long_about = None)]
#[command(about = "Inspect, modify and write partitioned disk images")]
struct Cli {
    /// Output debug information
    #[arg(short = 'D', long, global = true)]
    debug: bool,

    /// Look for partitioning and filesystem tools in this sysroot first
    #[arg(short = 'n', long, global = true)]
    native_sysroot: Option<PathBuf>,

    /// Logical sector size to assume when reading partition tables
    #[arg(long, global = true)]
    sector_size: Option<u32>,

    /// Directory for staging copies of partitions
    #[arg(long, global = true)]
    tmpdir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the partitions of an image, or a directory inside a partition
    Ls {
        /// <image>[:<partition>[<path>]]
        spec: String,
    },

    /// Copy a file or directory into or out of an image partition
    Cp {
        /// Source: local path or <image>:<partition><path>
        src: String,

        /// Destination: local path or <image>:<partition><path>
        dest: String,
    },

    /// Remove a file or directory from an image partition
    Rm {
        /// <image>:<partition><path>
        spec: String,

        /// Remove directories and their contents recursively
        #[arg(short, long)]
        recursive: bool,
    },

    /// Write an image to a file or block device, optionally growing its partitions
    Write {
        /// Source image
        image: PathBuf,

        /// Target file or block device
        target: PathBuf,

        /// Expand partitions: "auto" or <partition>:<size>[,...]
        #[arg(short, long)]
        expand: Option<ExpandPlan>,
    },

    /// Show detailed version and build information
    Version,
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn open_disk(image: &Path, config: ToolConfig, accepted: &'static [FsFamily]) -> Result<Disk> {
    Disk::open(image, config, accepted)
        .with_context(|| format!("Failed to read partition table of {}", image.display()))
}

fn mib(sectors: u64, sector_size: u64) -> f64 {
    (sectors * sector_size) as f64 / (1024.0 * 1024.0)
}

fn print_report(report: &WriteReport, sector_size: u64) {
    println!();
    println!("Write complete!");
    println!();
    println!("Operations performed:");
    for op in &report.operations {
        println!("  - {}", op);
    }

    if !report.partitions.is_empty() {
        println!();
        println!("Partitions:");
        for part in &report.partitions {
            if part.action == PartitionAction::Container {
                println!("  {:2}: {}", part.pnum, part.action);
                continue;
            }
            println!(
                "  {:2}: {:.2} MB -> {:.2} MB at sector {} ({})",
                part.pnum,
                mib(part.old_sectors, sector_size),
                mib(part.new_sectors, sector_size),
                part.start_sector,
                part.action
            );
        }
    }

    if let Some(calc) = &report.calculation {
        if calc.undistributed_sectors > 0 {
            println!();
            println!("  Unallocated sectors left: {}", calc.undistributed_sectors);
        }
    }

    if !report.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for w in &report.warnings {
            println!("  - {}", w);
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = ToolConfig {
        native_sysroot: cli.native_sysroot,
        sector_size: cli.sector_size,
        staging_dir: cli.tmpdir,
    };

    match cli.command {
        Commands::Version => {
            println!("wim {}", version_long());
        }

        Commands::Ls { spec } => {
            let spec = ImageSpec::parse(&spec)?;
            let mut disk = open_disk(&spec.image, config, FsFamily::FILE_ACCESS)?;
            match spec.partition {
                None => println!("{}", PartitionListing(disk.layout())),
                Some(pnum) => {
                    let listing = disk.list(pnum, &spec.path).with_context(|| {
                        format!("Failed to list {} on partition {}", spec.path, pnum)
                    })?;
                    println!("{}", listing);
                }
            }
        }

        Commands::Cp { src, dest } => {
            let transfer = Transfer::new(CopyEndpoint::parse(&src)?, CopyEndpoint::parse(&dest)?)?;
            let image = transfer.spec().image.clone();
            let mut disk = open_disk(&image, config, FsFamily::FILE_ACCESS)?;
            disk.copy(&transfer).with_context(|| format!("Failed to copy {} to {}", src, dest))?;
        }

        Commands::Rm { spec, recursive } => {
            let spec = ImageSpec::parse_partition(&spec)?;
            let pnum = spec.require_partition()?;
            let mut disk = open_disk(&spec.image, config, FsFamily::FILE_ACCESS)?;
            disk.remove(pnum, &spec.path, recursive).with_context(|| {
                format!("Failed to remove {} from partition {}", spec.path, pnum)
            })?;
        }

        Commands::Write {
            image,
            target,
            expand,
        } => {
            if is_block_device(&target) && !check_root() {
                warn!("Writing to a block device usually requires root privileges");
            }

            let mut disk = open_disk(&image, config, FsFamily::RESIZABLE)?;
            let report = disk.write(&target, expand.as_ref()).with_context(|| {
                format!("Failed to write {} to {}", image.display(), target.display())
            })?;
            print_report(&report, disk.logical_sector_size());
        }
    }

    Ok(())
}

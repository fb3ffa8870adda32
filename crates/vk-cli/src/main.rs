//! `vkcli`: host-side access to Valkyrie card BARs.
//!
//! ```text
//! USAGE:
//!   vkcli rb <node> <bar> <offset> [--width N]            Read one value
//!   vkcli wb <node> <bar> <offset> <value> [--width N]    Write one value
//!   vkcli rf <node> <bar> <offset> <len> <file>           BAR to file
//!   vkcli wf <node> <bar> <offset> <file>                 File to BAR
//!   vkcli spool <node>                                    Dump the log spool
//!   vkcli cmd <node> <text> [--sec N]                     Run a console command
//!   vkcli logdump (--file <dump> | --console <dump>)      Decode an offline dump
//! ```
//!
//! `<bar>` is the sysfs resource number (`resource<bar>`). Numbers take a
//! `0x` prefix for hex. Logging is controlled by `RUST_LOG`.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vk_chip::node::{resource_path, MAX_CARDS_PER_HOST, MAX_FILE_SIZE};
use vk_chip::vcon::{MIN_FOLLOW_DURATION, SPOOL_BAR2_OFFSET};
use vk_pcimem::vcon::{parse_console, parse_spool, VconChannel};
use vk_pcimem::{AccessWidth, MapConfig, PciMem, PciMemError};

#[derive(Parser)]
#[command(name = "vkcli", about = "Valkyrie PCIe BAR access", version)]
struct Cli {
    /// Map without page locking (for a small RLIMIT_MEMLOCK).
    #[arg(long, global = true)]
    no_lock: bool,

    #[command(subcommand)]
    command: Cmd,
}

/// Card and BAR resource a command works on.
#[derive(Args)]
struct Target {
    /// Card node number (0..11).
    #[arg(value_parser = parse_node)]
    node: u16,
    /// BAR resource number.
    #[arg(value_parser = parse_u16)]
    bar: u16,
}

#[derive(Subcommand)]
enum Cmd {
    /// Read one value from a BAR.
    Rb {
        #[command(flatten)]
        target: Target,
        /// Byte offset in the BAR.
        #[arg(value_parser = parse_u64)]
        offset: u64,
        /// Access width in bytes (1, 2, 4 or 8).
        #[arg(long, default_value_t = 4, value_parser = parse_width)]
        width: usize,
    },
    /// Write one value to a BAR.
    Wb {
        #[command(flatten)]
        target: Target,
        /// Byte offset in the BAR.
        #[arg(value_parser = parse_u64)]
        offset: u64,
        /// Value to write.
        #[arg(value_parser = parse_u64)]
        value: u64,
        /// Access width in bytes (1, 2, 4 or 8).
        #[arg(long, default_value_t = 4, value_parser = parse_width)]
        width: usize,
        /// Skip the read-back check.
        #[arg(long)]
        no_verify: bool,
    },
    /// Copy a BAR range into a file.
    Rf {
        #[command(flatten)]
        target: Target,
        /// Byte offset in the BAR.
        #[arg(value_parser = parse_u64)]
        offset: u64,
        /// Number of bytes.
        #[arg(value_parser = parse_u64)]
        len: u64,
        /// Output file.
        file: PathBuf,
    },
    /// Copy a file into a BAR.
    Wf {
        #[command(flatten)]
        target: Target,
        /// Byte offset in the BAR.
        #[arg(value_parser = parse_u64)]
        offset: u64,
        /// Input file (at most 64 MB).
        file: PathBuf,
    },
    /// Print the firmware log spool of a card.
    Spool {
        /// Card node number (0..11).
        #[arg(value_parser = parse_node)]
        node: u16,
    },
    /// Send a command to the firmware console.
    Cmd {
        /// Card node number (0..11).
        #[arg(value_parser = parse_node)]
        node: u16,
        /// Command text.
        text: String,
        /// Seconds to print console output for (at least 1).
        #[arg(short, long = "sec", value_parser = parse_secs, default_value = "1")]
        sec: Duration,
    },
    /// Decode a saved spool or console dump.
    Logdump(LogdumpArgs),
}

#[derive(Args)]
struct LogdumpArgs {
    /// BAR2 dump containing the log spool.
    #[arg(short, long, conflicts_with = "console", required_unless_present = "console")]
    file: Option<PathBuf>,
    /// Console ring dump.
    #[arg(short, long)]
    console: Option<PathBuf>,
    /// Spool header offset inside the BAR2 dump.
    #[arg(long, default_value_t = SPOOL_BAR2_OFFSET, value_parser = parse_u64, requires = "file")]
    offset: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let config = if cli.no_lock {
        MapConfig::default().with_locked(false)
    } else {
        MapConfig::default()
    };

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("vkcli: {e:#}");
            ExitCode::from(exit_status(&e))
        }
    }
}

/// Exit status: the errno behind a library failure, 1 for anything else.
fn exit_status(e: &anyhow::Error) -> u8 {
    e.downcast_ref::<PciMemError>()
        .and_then(|pe| u8::try_from(-pe.code()).ok())
        .filter(|&s| s != 0)
        .unwrap_or(1)
}

fn run(command: Cmd, config: MapConfig) -> Result<()> {
    match command {
        Cmd::Rb {
            target,
            offset,
            width,
        } => cmd_read_bar(&target, offset, width, config),
        Cmd::Wb {
            target,
            offset,
            value,
            width,
            no_verify,
        } => cmd_write_bar(&target, offset, value, width, config.with_verify(!no_verify)),
        Cmd::Rf {
            target,
            offset,
            len,
            file,
        } => cmd_read_file(&target, offset, len, &file, config),
        Cmd::Wf {
            target,
            offset,
            file,
        } => cmd_write_file(&target, offset, &file, config),
        Cmd::Spool { node } => cmd_spool(node, config),
        Cmd::Cmd { node, text, sec } => cmd_console(node, &text, sec, config),
        Cmd::Logdump(args) => cmd_logdump(&args),
    }
}

fn cmd_read_bar(target: &Target, offset: u64, width: usize, config: MapConfig) -> Result<()> {
    let width = AccessWidth::try_from(width).map_err(PciMemError::from)?;
    let path = resource_path(target.node, target.bar);
    tracing::debug!("rb {path} {offset:#x} ({width})");
    let mut mem = PciMem::with_config(config);
    let win = mem.window(&path, offset, width.bytes())?;
    let value = win.read(offset, width)?;
    win.release()?;
    println!("0x{offset:04X}: 0x{value:0digits$X}", digits = width.hex_digits());
    Ok(())
}

fn cmd_write_bar(
    target: &Target,
    offset: u64,
    value: u64,
    width: usize,
    config: MapConfig,
) -> Result<()> {
    let width = AccessWidth::try_from(width).map_err(PciMemError::from)?;
    let path = resource_path(target.node, target.bar);
    tracing::debug!(
        "wb {path} {offset:#x} <- {value:#x} ({width}, verify {})",
        config.verify_writes
    );
    let mut mem = PciMem::with_config(config);
    let mut win = mem.window(&path, offset, width.bytes())?;
    win.write(offset, value, width)?;
    win.release()?;
    Ok(())
}

fn cmd_read_file(
    target: &Target,
    offset: u64,
    len: u64,
    file: &Path,
    config: MapConfig,
) -> Result<()> {
    if len > MAX_FILE_SIZE {
        bail!("length {len:#x} exceeds {MAX_FILE_SIZE:#x}");
    }
    let path = resource_path(target.node, target.bar);
    let mut buf = vec![0u8; usize::try_from(len)?];
    let mut mem = PciMem::with_config(config);
    let win = mem.window(&path, offset, len)?;
    win.block_read(offset, &mut buf)?;
    win.release()?;
    std::fs::write(file, &buf).with_context(|| format!("writing {}", file.display()))?;
    println!("{len:#x} bytes from {path} @ {offset:#x} -> {}", file.display());
    Ok(())
}

fn cmd_write_file(target: &Target, offset: u64, file: &Path, config: MapConfig) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let len = data.len() as u64;
    if len > MAX_FILE_SIZE {
        bail!("{} is {len:#x} bytes, limit is {MAX_FILE_SIZE:#x}", file.display());
    }
    if len == 0 {
        bail!("{} is empty", file.display());
    }
    let path = resource_path(target.node, target.bar);
    let mut mem = PciMem::with_config(config);
    let mut win = mem.window(&path, offset, len)?;
    win.block_write(offset, &data)?;
    win.release()?;
    println!("{len:#x} bytes {} -> {path} @ {offset:#x}", file.display());
    Ok(())
}

fn cmd_spool(node: u16, config: MapConfig) -> Result<()> {
    let mut mem = PciMem::with_config(config);
    let chan = VconChannel::open(&mut mem, node)?;
    for line in chan.dump_all()? {
        print!("{line}");
    }
    chan.close()?;
    Ok(())
}

fn cmd_console(node: u16, text: &str, duration: Duration, config: MapConfig) -> Result<()> {
    let mut mem = PciMem::with_config(config);
    let mut chan = VconChannel::open(&mut mem, node)?;
    chan.run_command(text, duration, |line| print!("{}", line.text))?;
    chan.close()?;
    Ok(())
}

fn cmd_logdump(args: &LogdumpArgs) -> Result<()> {
    if let Some(file) = &args.console {
        let image = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        println!("{}", parse_console(&image)?);
    } else if let Some(file) = &args.file {
        let image = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        let start = usize::try_from(args.offset)?;
        tracing::debug!("spool header expected at {start:#x} of {} bytes", image.len());
        let Some(spool) = image.get(start..) else {
            bail!("{} has no data at {:#x}", file.display(), args.offset);
        };
        for line in parse_spool(spool)? {
            print!("{line}");
        }
    }
    Ok(())
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    let secs = parse_u64(s)?;
    Ok(Duration::from_secs(secs).max(MIN_FOLLOW_DURATION))
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("{s:?}: {e}"))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    u16::try_from(parse_u64(s)?).map_err(|_| format!("{s:?} does not fit in 16 bits"))
}

fn parse_node(s: &str) -> Result<u16, String> {
    let node = parse_u16(s)?;
    if node >= MAX_CARDS_PER_HOST {
        return Err(format!("node {node} out of range 0..{MAX_CARDS_PER_HOST}"));
    }
    Ok(node)
}

fn parse_width(s: &str) -> Result<usize, String> {
    let width = usize::try_from(parse_u64(s)?).map_err(|e| e.to_string())?;
    AccessWidth::try_from(width).map_err(|e| e.to_string())?;
    Ok(width)
}

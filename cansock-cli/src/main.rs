//! CAN Socket CLI Application
//!
//! Command-line front end for the cansock library:
//! - `dump` prints received frames using the background worker
//! - `send` transmits frames in polled mode
//! - `info` initialises an interface and reports what the kernel granted

use anyhow::{Context, Result};
use cansock::{
    CanFilter, CanFrame, CanInterface, ErrorHandlerRef, ErrorNotice, InterfaceConfig,
    RxHandlerRef, Timestamp,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

mod config;
mod parse;

use config::AppConfig;

/// CAN socket tool - dump and send frames on a SocketCAN interface
#[derive(Parser, Debug)]
#[command(name = "cansock-cli")]
#[command(about = "Dump and send frames on Linux CAN interfaces", long_about = None)]
#[command(version)]
struct Args {
    /// CAN interface name (default: from config, else vcan0)
    #[arg(short, long, value_name = "IFACE")]
    interface: Option<String>,

    /// Path to configuration file with an [interface] table
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print received frames until interrupted
    Dump {
        /// Receive filter as ID:MASK in hex (can be repeated, default: all)
        #[arg(short, long = "filter", value_name = "ID:MASK")]
        filters: Vec<String>,

        /// Stop after this many frames
        #[arg(short = 'n', long, value_name = "N")]
        count: Option<usize>,

        /// Print one JSON object per frame
        #[arg(long)]
        json: bool,
    },

    /// Transmit a frame (ID#DATA, ID#R or ID##FLAGS+DATA)
    Send {
        #[arg(value_name = "FRAME")]
        frame: String,

        /// Number of times to send the frame
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,

        /// Delay between repetitions in milliseconds
        #[arg(short, long, default_value_t = 0)]
        gap: u64,
    },

    /// Initialise the interface and print its settings
    Info,
}

/// One received frame, as printed by `dump --json`
#[derive(Debug, Serialize)]
struct FrameRecord {
    timestamp: String,
    id: u32,
    extended: bool,
    remote: bool,
    len: usize,
    data: String,
}

impl FrameRecord {
    fn new(frame: &CanFrame, timestamp: Timestamp) -> Self {
        Self {
            timestamp: timestamp.to_rfc3339(),
            id: frame.raw_id(),
            extended: frame.is_extended(),
            remote: frame.is_remote(),
            len: frame.len(),
            data: frame.data().iter().map(|b| format!("{:02X}", b)).collect(),
        }
    }
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("CAN Socket CLI v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using cansock library v{}", cansock::VERSION);

    let app_config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };

    let ifname = args
        .interface
        .clone()
        .or_else(|| app_config.interface.name.clone())
        .unwrap_or_else(|| "vcan0".to_string());

    match args.command {
        Command::Dump {
            filters,
            count,
            json,
        } => dump_mode(&ifname, &app_config, filters, count, json),
        Command::Send { frame, repeat, gap } => send_mode(&ifname, &app_config, &frame, repeat, gap),
        Command::Info => info_mode(&ifname, &app_config),
    }
}

/// Dump mode - worker-driven reception, frames forwarded over a channel
fn dump_mode(
    ifname: &str,
    app_config: &AppConfig,
    filters: Vec<String>,
    count: Option<usize>,
    json: bool,
) -> Result<()> {
    let filter_specs = if filters.is_empty() {
        app_config.dump.filters.clone()
    } else {
        filters
    };
    let filters = if filter_specs.is_empty() {
        vec![CanFilter::accept_all()]
    } else {
        filter_specs
            .iter()
            .map(|spec| parse::parse_filter(spec))
            .collect::<Result<Vec<_>>>()?
    };
    let json = json || app_config.dump.json;

    let settings = app_config.interface.settings.clone().with_polled_mode(false);
    let mut can = CanInterface::request_by_name(ifname);
    can.init(settings)
        .with_context(|| format!("Failed to initialise {}", ifname))?;

    let (tx, rx) = mpsc::channel::<FrameRecord>();
    let tx = Mutex::new(tx);
    let handler: RxHandlerRef = Arc::new(move |frame: &CanFrame, timestamp: Timestamp| {
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(FrameRecord::new(frame, timestamp));
        }
    });
    can.register_rx(handler, &filters)
        .with_context(|| format!("Failed to register receive handler on {}", ifname))?;

    let notices: ErrorHandlerRef = Arc::new(|notice: &ErrorNotice| {
        log::warn!("{}", notice);
    });
    can.register_error(notices)?;

    log::info!("Dumping {} with {} filter(s)", ifname, filters.len());

    let mut received = 0usize;
    while count.map_or(true, |n| received < n) {
        let record = rx.recv().context("Receive handler dropped")?;
        if json {
            println!("{}", serde_json::to_string(&record)?);
        } else {
            let id = if record.extended {
                format!("{:08X}", record.id)
            } else {
                format!("{:03X}", record.id)
            };
            println!(
                "{}  {}  {}  [{}]  {}",
                record.timestamp,
                ifname,
                id,
                record.len,
                if record.remote { "remote request".to_string() } else { record.data.clone() }
            );
        }
        received += 1;
    }

    if can.dropped_frames() > 0 {
        log::warn!("{} frames dropped by the kernel", can.dropped_frames());
    }
    can.free()?;
    Ok(())
}

/// Send mode - polled interface, retrying while the transmit queue is full
fn send_mode(
    ifname: &str,
    app_config: &AppConfig,
    frame_text: &str,
    repeat: u32,
    gap_ms: u64,
) -> Result<()> {
    let spec = parse::parse_frame(frame_text)?;

    let mut settings = app_config.interface.settings.clone().with_polled_mode(true);
    if spec.fd {
        settings = settings.with_canfd(true);
    }

    let mut can = CanInterface::request_by_name(ifname);
    can.init(settings)
        .with_context(|| format!("Failed to initialise {}", ifname))?;

    for i in 0..repeat {
        let mut attempts = 0u32;
        loop {
            match can.transmit(&spec.frame) {
                Ok(()) => break,
                Err(e) if e.is_retry_later() && attempts < 1000 => {
                    attempts += 1;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to send {}", frame_text));
                }
            }
        }
        log::debug!("Sent {} ({}/{})", spec.frame, i + 1, repeat);
        if gap_ms > 0 && i + 1 < repeat {
            thread::sleep(Duration::from_millis(gap_ms));
        }
    }

    can.free()?;
    Ok(())
}

/// Info mode - initialise in polled mode and print what was negotiated
fn info_mode(ifname: &str, app_config: &AppConfig) -> Result<()> {
    let settings: InterfaceConfig = app_config.interface.settings.clone().with_polled_mode(true);

    let mut can = CanInterface::request_by_name(ifname);
    can.init(settings)
        .with_context(|| format!("Failed to initialise {}", ifname))?;

    // a receive socket reports the negotiated receive buffer size
    let rx_fd = can.open_rx(&[])?;

    println!("Interface:      {}", can.name());
    println!("TX socket fd:   {}", can.tx_socket_fd()?);
    println!("TX buffer:      {}", can.tx_buf_len_actual());
    println!("RX buffer:      {}", can.rx_buf_len_actual());
    println!("Poll interval:  {:?}", can.poll_interval());
    println!("\n[interface]");
    print!("{}", toml::to_string_pretty(can.config())?);

    can.close_rx(rx_fd)?;
    can.free()?;
    Ok(())
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

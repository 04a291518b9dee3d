use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use waps_ies::{reader, Catalog, Config, Ingest, LogLevel};

#[derive(StructOpt, Debug)]
#[structopt(
    about = "WAPS image extraction software. Acquires CCSDS packets from a TCP stream, filters BIOLAB TM frames, extracts WAPS experiment images and reports missing packets. The server IP address and port must be specified inline or in the configuration file."
)]
struct Opt {
    /// Configuration file.
    #[structopt(long, default_value = "waps_ies_config.toml", parse(from_os_str))]
    config: PathBuf,

    /// IP address of the TCP server.
    #[structopt(short = "i", long = "ip")]
    ip_address: Option<String>,

    /// Port of the TCP server.
    #[structopt(short = "p", long = "port")]
    port: Option<u16>,

    /// TCP timeout in seconds after which inactivity is reported.
    #[structopt(long = "tcp-timeout")]
    tcp_timeout: Option<f64>,

    /// Output path where extracted images are saved.
    #[structopt(short = "o", long = "output-path", parse(from_os_str))]
    output_path: Option<PathBuf>,

    /// Directory receiving the process logs.
    #[structopt(short = "l", long = "log-path", parse(from_os_str))]
    log_path: Option<PathBuf>,

    /// Show only warnings and errors in the log. Overridden by --debug.
    #[structopt(long = "errors-only")]
    errors_only: bool,

    /// Enable debug logging.
    #[structopt(short = "d", long = "debug")]
    debug: bool,

    /// Image timeout in minutes after which an incomplete image is
    /// considered outdated. Zero disables the timeout.
    #[structopt(long = "image-timeout", name = "minutes")]
    image_timeout: Option<u64>,

    /// Enable memory slot change detection from general BIOLAB telemetry.
    #[structopt(long = "memory-slot-change")]
    memory_slot_change: bool,

    /// Process an archived telemetry file instead of connecting.
    #[structopt(long = "archive-file", parse(from_os_str))]
    archive_file: Option<PathBuf>,

    /// Process a test-bench dump instead of connecting.
    #[structopt(long = "test-bench-file", parse(from_os_str))]
    test_bench_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();

    // Input parameters in priority order: command line, configuration
    // file, defaults.
    let mut config = if opt.config.exists() {
        Config::load(&opt.config).context("failed to load the configuration file")?
    } else {
        Config::default()
    };

    if let Some(ip_address) = opt.ip_address {
        config.ip_address = Some(ip_address);
    }
    if let Some(port) = opt.port {
        config.port = Some(port);
    }
    if let Some(tcp_timeout) = opt.tcp_timeout {
        config.tcp_timeout = tcp_timeout;
    }
    if let Some(output_path) = opt.output_path {
        config.output_path = output_path;
    }
    if let Some(log_path) = opt.log_path {
        config.log_path = log_path;
    }
    if let Some(image_timeout) = opt.image_timeout {
        config.image_timeout = image_timeout;
    }
    if opt.memory_slot_change {
        config.memory_slot_change_detection = true;
    }
    if opt.debug {
        config.log_level = LogLevel::Debug;
    } else if opt.errors_only {
        config.log_level = LogLevel::Error;
    }

    config
        .validate()
        .context("example: waps-ies --ip localhost --port 12345")?;

    std::fs::create_dir_all(&config.log_path)
        .with_context(|| format!("could not create {}", config.log_path.display()))?;
    std::fs::create_dir_all(&config.output_path)
        .with_context(|| format!("could not create {}", config.output_path.display()))?;

    // Log to the console and to a daily-rotated file under log_path.
    let file_appender = tracing_appender::rolling::daily(&config.log_path, "waps_ies.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.directive()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    info!("##### WAPS Image Extraction Software #####");
    info!("# logging path: {}", config.log_path.display());
    info!("# output path: {}", config.output_path.display());
    info!("# image timeout: {} minute(s)", config.image_timeout);
    if config.memory_slot_change_detection {
        info!("# detecting memory slot change from BIOLAB telemetry");
    }
    if !config.ec_positions.is_empty() {
        info!("# configured EC address/position pairs:");
        for (address, position) in &config.ec_positions {
            info!("#   {} / {}", address, position);
        }
    }

    let catalog = Catalog::open(&config.catalog_file).context("could not open the catalog")?;
    let mut ingest = Ingest::new(&config, catalog)?;

    // Offline sources bypass the connection lifecycle entirely.
    if let Some(path) = opt.archive_file {
        let frames = reader::read_archive_file(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        ingest.apply_frames(frames);
        ingest.summary();
        return Ok(());
    }
    if let Some(path) = opt.test_bench_file {
        let frames = reader::read_test_bench_file(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        ingest.apply_frames(frames);
        ingest.summary();
        return Ok(());
    }

    let run = ingest.run_flag();
    ctrlc::set_handler(move || {
        run.store(false, Ordering::Relaxed);
    })
    .context("could not install the interrupt handler")?;

    ingest.run();
    Ok(())
}

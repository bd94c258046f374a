//! entropyd — hardware RNG aggregation daemon.

mod device;

use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;

use entropyd_core::error::{Error, Result};
use entropyd_core::{Daemon, SourceConfig};
use entropyd_server::{ControlAddr, ControlServer, SocketOptions};

use device::FileSource;

#[derive(Parser)]
#[command(name = "entropyd")]
#[command(about = "Aggregate, health-check and distribute hardware RNG entropy")]
#[command(version = entropyd_core::VERSION)]
struct Cli {
    /// Raw HWRNG character device to aggregate (repeatable)
    #[arg(long = "device", value_name = "PATH")]
    devices: Vec<PathBuf>,

    /// Assumed device bitrate in bits per second
    #[arg(long, default_value_t = 1_000_000)]
    bitrate: u64,

    /// XOR-fold passes applied to each raw device buffer
    #[arg(long, default_value_t = 1)]
    fold: u32,

    /// Group the devices vote into; 0 commits each device directly
    #[arg(long, default_value_t = 0)]
    group: u32,

    /// Bytes per group vote (power of two)
    #[arg(long, default_value_t = 65_536)]
    group_size: usize,

    /// Trust the devices and skip per-source health checks
    #[arg(long)]
    no_qa: bool,

    /// Entropy pool size in bytes
    #[arg(long, default_value_t = 65_536)]
    pool_size: usize,

    /// Feed validated entropy to the OS kernel pool (requires root)
    #[arg(long)]
    kernel: bool,

    /// Kernel refill wait in seconds when the OS gives no readiness signal
    #[arg(long, default_value_t = 60)]
    kernel_refill: u64,

    /// Stream pool bytes to this path
    #[arg(long, value_name = "PATH")]
    write_to: Option<PathBuf>,

    /// Stop the stream after this many bytes
    #[arg(long, value_name = "N")]
    write_bytes: Option<u64>,

    /// Run the health monitors over a device without using its bytes
    /// (repeatable)
    #[arg(long = "watch", value_name = "PATH")]
    watch: Vec<PathBuf>,

    /// Control socket address: tcp:host:port or an absolute UNIX path
    #[arg(long, value_name = "ADDR")]
    control: Option<String>,

    /// Create the UNIX control socket group-accessible (0660)
    #[arg(long)]
    control_group: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
    // SetLogVerbosity on the control socket adjusts this at runtime.
    log::set_max_level(level);

    if let Err(e) = run(cli) {
        log::error!(target: "entropyd", "{e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.devices.is_empty() && cli.watch.is_empty() {
        return Err(Error::Config(
            "nothing to do; pass --device or --watch".into(),
        ));
    }

    let mut daemon = Daemon::new(cli.pool_size)?;

    for path in &cli.devices {
        let dev = FileSource::open(path, cli.bitrate)?;
        let cfg = SourceConfig {
            group_id: cli.group,
            group_buffer_size: cli.group_size,
            fold_bits: cli.fold,
            skip_qa: cli.no_qa,
            ..SourceConfig::default()
        };
        daemon.add_source(Box::new(dev), cfg)?;
    }

    for path in &cli.watch {
        let dev = FileSource::open(path, cli.bitrate)?;
        daemon.add_qa_sink(Box::new(dev), 4096)?;
    }

    if cli.kernel {
        #[cfg(target_os = "linux")]
        {
            let sink = entropyd_core::kernel::DevRandom::open()?;
            daemon.add_kernel_feeder(
                Box::new(sink),
                Duration::from_secs(cli.kernel_refill),
            )?;
        }
        #[cfg(not(target_os = "linux"))]
        {
            return Err(Error::Config(
                "--kernel is only supported on Linux".into(),
            ));
        }
    }

    if let Some(path) = &cli.write_to {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Config(format!("cannot open {}: {e}", path.display())))?;
        daemon.add_fd_writer(
            path.display().to_string(),
            Box::new(file),
            cli.write_bytes,
            true,
        )?;
    }

    let _control = cli
        .control
        .as_deref()
        .map(|addr| {
            ControlServer::start(
                &ControlAddr::parse(addr)?,
                &SocketOptions {
                    shared_group: cli.control_group,
                },
            )
        })
        .transpose()?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| Error::Resource(format!("cannot install signal handler: {e}")))?;

    log::info!(
        target: "entropyd",
        "entropyd {} up: {} source(s), {} watch(es), pool {} bytes",
        entropyd_core::VERSION,
        cli.devices.len(),
        cli.watch.len(),
        cli.pool_size,
    );

    let _ = stop_rx.recv();
    log::info!(target: "entropyd", "signal received, shutting down");
    daemon.shutdown();
    Ok(())
}

//! Prism - passive HTTP capture at the traffic-control layer
//!
//! Taps an interface's ingress and egress hooks, copies the prefix of every
//! plausible HTTP-over-IPv4/TCP frame to userspace, and hands each one to the
//! parsing stage over a bounded queue.

use clap::{Parser, Subcommand};
use prism_capture_ebpf::capability;
use prism_core::config::{ConfigLoader, SensorConfig};
use prism_core::pipeline::DispatchReceiver;
use prism_core::SENSOR_VERSION;
use std::path::PathBuf;
use tracing::{debug, trace, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "prism")]
#[command(version)]
#[command(about = "Passive HTTP capture sensor", long_about = None)]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "PRISM_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    record: RecordArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Capture options; recording is the default command
#[derive(clap::Args, Debug, Default)]
struct RecordArgs {
    /// Network interface to tap [default: lo]
    #[arg(short = 'n', long)]
    interface: Option<String>,

    /// Data directory for the storage stage [default: ./db]
    #[arg(short = 'p', long)]
    data_path: Option<PathBuf>,

    /// Debug output, including payload previews
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture HTTP traffic (the default)
    Record,

    /// Show sensor status and kernel capabilities
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut sensor_config = ConfigLoader::new().with_cli_path(cli.config.clone()).load()?;
    merge_cli_args(&mut sensor_config, &cli.record, cli.verbose);
    ConfigLoader::new().validate(&sensor_config)?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level(&sensor_config, cli.verbose))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command.unwrap_or(Commands::Record) {
        Commands::Record => record_command(sensor_config).await,
        Commands::Status => status_command(&sensor_config),
    }
}

/// Apply CLI flags on top of file and environment settings
fn merge_cli_args(config: &mut SensorConfig, args: &RecordArgs, verbose: u8) {
    if let Some(interface) = &args.interface {
        config.capture.interface = interface.clone();
    }
    if let Some(path) = &args.data_path {
        config.storage.data_path = path.to_string_lossy().into_owned();
    }
    if args.debug {
        config.sensor.debug = true;
    }
    if verbose > 0 {
        config.sensor.verbose = true;
    }
}

/// CLI verbosity wins, then the debug flag, then the configured level
fn log_level(config: &SensorConfig, verbose: u8) -> Level {
    let verbose = if verbose == 0 && config.sensor.verbose {
        1
    } else {
        verbose
    };

    if verbose > 0 {
        match verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else if config.sensor.debug {
        Level::DEBUG
    } else {
        match config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

#[cfg(target_os = "linux")]
async fn record_command(config: SensorConfig) -> anyhow::Result<()> {
    use prism_capture_ebpf::{CaptureError, TcCaptureConfig, TcHttpCapture};
    use prism_core::pipeline::{Pipeline, PipelineConfig};
    use prism_core::shutdown::{Shutdown, TerminationSignals};
    use tracing::{error, info, warn};

    fn fatal(e: CaptureError) -> anyhow::Error {
        error!("{}", e);
        e.into()
    }

    info!("Starting Prism sensor...");
    if !capability::is_root() {
        warn!("Not running as root, loading the probe will likely fail");
    }

    // Before anything touches the interface, so an early signal still tears down
    let mut signals = TerminationSignals::install()?;

    let shutdown = Shutdown::new();
    let capture_config = TcCaptureConfig::from(&config.capture);

    // Dropping `capture` on any early return releases whatever was attached
    let mut capture = TcHttpCapture::open(&capture_config, &shutdown).map_err(fatal)?;
    capture.attach().map_err(fatal)?;

    print_banner(&capture);
    info!("Data path: {}", config.storage.data_path);

    let reader = capture
        .take_reader()
        .ok_or_else(|| anyhow::anyhow!("transport reader already taken"))?;

    let mut pipeline = Pipeline::new(PipelineConfig::from(&config.pipeline));
    let queue = pipeline.start(reader, &shutdown)?;
    let consumer = tokio::spawn(log_dispatch_tasks(queue, config.sensor.debug));

    info!("Listening for events...");
    match signals.recv().await {
        Ok(signal) => info!("Received {}, exiting TC program...", signal),
        Err(e) => error!("Failed to wait for termination signal: {}", e),
    }

    // Reader first, then the queue (closed by the read loop itself), then the binding
    shutdown.trigger();
    match pipeline.stop().await {
        Some(stats) => info!("Read loop finished: {}", stats),
        None => warn!("Read loop did not report statistics"),
    }
    capture.detach();

    match consumer.await {
        Ok(count) => debug!("Consumer drained {} tasks", count),
        Err(e) => warn!("Consumer task failed: {}", e),
    }

    info!("Sensor stopped");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn record_command(_config: SensorConfig) -> anyhow::Result<()> {
    anyhow::bail!("TC capture is only available on Linux")
}

#[cfg(target_os = "linux")]
fn print_banner(capture: &prism_capture_ebpf::TcHttpCapture) {
    println!();
    println!("  ____       _               ");
    println!(" |  _ \\ _ __(_)___ _ __ ___  ");
    println!(" | |_) | '__| / __| '_ ` _ \\ ");
    println!(" |  __/| |  | \\__ \\ | | | | |");
    println!(" |_|   |_|  |_|___/_| |_| |_|");
    println!();
    println!("  Version {}", SENSOR_VERSION);
    println!(
        "  Kernel {} ({} transport)",
        capture.kernel_version(),
        capture.mode()
    );
    println!(
        "  Attached TC programs to {:?} (index {})",
        capture.interface(),
        capture.ifindex()
    );
    println!();
    println!("  Press Ctrl-C to exit and remove the programs");
    println!();
}

/// Stand-in for the parsing stage: drains the queue and logs what arrives
async fn log_dispatch_tasks(mut queue: DispatchReceiver, preview: bool) -> u64 {
    let mut count = 0u64;
    while let Some(task) = queue.recv().await {
        count += 1;
        if preview {
            debug!(
                "{} {} bytes {}",
                task.direction.as_str(),
                task.len(),
                task.preview()
            );
        } else {
            trace!("{} {} bytes", task.direction.as_str(), task.len());
        }
    }
    count
}

fn status_command(config: &SensorConfig) -> anyhow::Result<()> {
    println!();
    println!("Prism Sensor v{}", SENSOR_VERSION);
    println!();

    println!(
        "Platform: {} {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    );

    println!();
    println!("Capabilities:");
    println!("  Running as root: {}", capability::is_root());
    println!("  BPF filesystem: {}", capability::bpf_fs_mounted());
    println!("  BTF available: {}", capability::btf_available());

    match capability::KernelVersion::current() {
        Ok(version) => {
            println!("  Kernel: {}", version);
            match capability::select_transport(version) {
                Ok(mode) => println!("  Transport: {}", mode),
                Err(e) => println!("  Transport: unsupported ({})", e),
            }
        }
        Err(e) => println!("  Kernel: unknown ({})", e),
    }

    #[cfg(target_os = "linux")]
    println!(
        "  Probe objects embedded: {}",
        prism_capture_ebpf::probe::is_embedded()
    );

    println!();
    println!("Effective configuration:");
    println!("{}", config.to_toml()?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_record() {
        let cli = Cli::parse_from(["prism"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 0);
        assert!(cli.record.interface.is_none());
    }

    #[test]
    fn test_cli_parses_record_flags() {
        let cli = Cli::parse_from(["prism", "-n", "eth0", "-p", "/tmp/db", "-d", "-vv"]);
        assert_eq!(cli.record.interface.as_deref(), Some("eth0"));
        assert_eq!(cli.record.data_path, Some(PathBuf::from("/tmp/db")));
        assert!(cli.record.debug);
        assert_eq!(cli.verbose, 2);
    }

    #[test]
    fn test_cli_status_subcommand() {
        let cli = Cli::parse_from(["prism", "status"]);
        assert!(matches!(cli.command, Some(Commands::Status)));
    }

    #[test]
    fn test_cli_flags_override_config() {
        let mut config = SensorConfig::default();
        config.capture.interface = "eth1".to_string();

        let args = RecordArgs {
            interface: Some("veth0".to_string()),
            data_path: Some(PathBuf::from("/var/lib/prism")),
            debug: true,
        };
        merge_cli_args(&mut config, &args, 0);

        assert_eq!(config.capture.interface, "veth0");
        assert_eq!(config.storage.data_path, "/var/lib/prism");
        assert!(config.sensor.debug);
        assert!(!config.sensor.verbose);
    }

    #[test]
    fn test_cli_interface_satisfies_validation() {
        let mut config = SensorConfig::default();
        config.capture.interface = String::new();
        assert!(ConfigLoader::new().validate(&config).is_err());

        let args = RecordArgs {
            interface: Some("eth0".to_string()),
            ..RecordArgs::default()
        };
        merge_cli_args(&mut config, &args, 0);
        assert!(ConfigLoader::new().validate(&config).is_ok());
    }

    #[test]
    fn test_missing_cli_flags_keep_config() {
        let mut config = SensorConfig::default();
        config.capture.interface = "eth1".to_string();
        merge_cli_args(&mut config, &RecordArgs::default(), 0);
        assert_eq!(config.capture.interface, "eth1");
        assert_eq!(config.storage.data_path, "./db");
    }

    #[test]
    fn test_log_level_precedence() {
        let mut config = SensorConfig::default();
        config.sensor.log_level = "warn".to_string();
        assert_eq!(log_level(&config, 0), Level::WARN);

        config.sensor.debug = true;
        assert_eq!(log_level(&config, 0), Level::DEBUG);

        assert_eq!(log_level(&config, 1), Level::INFO);
        assert_eq!(log_level(&config, 3), Level::TRACE);

        config.sensor.debug = false;
        config.sensor.verbose = true;
        assert_eq!(log_level(&config, 0), Level::INFO);
    }
}

//! rbus-daemon - message bus daemon
//!
//! Listens on one bus address, authenticates clients and routes messages
//! between them. Without `--listen` a fresh address is generated: a Unix
//! socket under the temporary directory, or a TCP port on localhost with
//! `--tcp`.
//!
//! Settings come from three places, later ones winning: built-in defaults,
//! the `[daemon]` table of `--config`, and command line flags.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rbus_core::address::BusAddress;
use rbus_core::config::BusConfig;
use rbus_daemon::{Daemon, DaemonSettings};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// rbus daemon - message bus
#[derive(Parser, Debug)]
#[command(name = "rbus-daemon")]
#[command(about, long_about = None, disable_version_flag = true)]
struct Args {
    /// Address to listen on, e.g. `unix:path=/run/rbus/socket`
    #[arg(short, long, value_name = "ADDRESS")]
    listen: Option<String>,

    /// Write the daemon PID to this file
    #[arg(short = 'p', long = "pidfile", value_name = "FILE")]
    pid_file: Option<PathBuf>,

    /// Write the bus address to this file
    #[arg(short = 'a', long = "addressfile", value_name = "FILE")]
    address_file: Option<PathBuf>,

    /// Print the bus address on stdout once listening
    #[arg(short = 'r', long)]
    print_address: bool,

    /// Generate a Unix socket address (default)
    #[arg(short, long, conflicts_with = "tcp")]
    unix: bool,

    /// Generate a TCP address on localhost
    #[arg(short, long)]
    tcp: bool,

    /// Print version information and exit
    #[arg(short = 'v', long)]
    version: bool,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

fn build_settings(args: &Args) -> Result<DaemonSettings> {
    let config = match &args.config {
        Some(path) => BusConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => BusConfig::default(),
    };

    let address = match args.listen.as_deref().or(config.daemon.listen.as_deref()) {
        Some(listen) => BusAddress::parse(listen).context("invalid listen address")?,
        None if args.tcp && !args.unix => BusAddress::dynamic_tcp(),
        None => BusAddress::dynamic_unix(std::env::temp_dir()),
    };

    let mut settings = DaemonSettings::from_config(&config.daemon, address)
        .context("invalid daemon configuration")?;
    if let Some(path) = &args.pid_file {
        settings = settings.with_pid_file(path);
    }
    if let Some(path) = &args.address_file {
        settings = settings.with_address_file(path);
    }
    Ok(settings)
}

fn main() -> Result<()> {
    let args = Args::parse();
    if args.version {
        println!("rbus-daemon {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    init_logging(&args)?;
    let settings = build_settings(&args)?;

    let daemon = Daemon::bind(settings)
        .await
        .context("failed to start bus daemon")?;
    if args.print_address {
        println!("{}", daemon.address());
    }
    info!(
        pid = std::process::id(),
        address = %daemon.address(),
        "rbus daemon started"
    );

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    let shutdown = daemon.shutdown_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        shutdown.cancel();
    });

    daemon.run().await.context("bus daemon failed")?;
    info!("rbus daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_and_tcp_conflict() {
        assert!(Args::try_parse_from(["rbus-daemon", "--unix", "--tcp"]).is_err());
        assert!(Args::try_parse_from(["rbus-daemon", "-t"]).is_ok());
    }

    #[test]
    fn test_short_flags() {
        let args = Args::try_parse_from([
            "rbus-daemon",
            "-l",
            "tcp:host=127.0.0.1,port=0",
            "-p",
            "/tmp/rbus.pid",
            "-a",
            "/tmp/rbus.address",
            "-r",
        ])
        .unwrap();
        assert_eq!(args.listen.as_deref(), Some("tcp:host=127.0.0.1,port=0"));
        assert!(args.print_address);

        let settings = build_settings(&args).unwrap();
        assert_eq!(settings.address.transport(), "tcp");
        assert_eq!(settings.pid_file, Some(PathBuf::from("/tmp/rbus.pid")));
        assert_eq!(
            settings.address_file,
            Some(PathBuf::from("/tmp/rbus.address"))
        );
    }

    #[test]
    fn test_dynamic_addresses() {
        let args = Args::try_parse_from(["rbus-daemon", "--tcp"]).unwrap();
        let settings = build_settings(&args).unwrap();
        assert_eq!(settings.address.transport(), "tcp");

        let args = Args::try_parse_from(["rbus-daemon"]).unwrap();
        let settings = build_settings(&args).unwrap();
        assert_eq!(settings.address.transport(), "unix");
        assert!(settings.address.get("path").is_some());
    }

    #[test]
    fn test_config_file_values_are_overridden_by_flags() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = tmp.path().join("rbus.toml");
        std::fs::write(
            &config,
            "[daemon]\nlisten = \"tcp:host=127.0.0.1,port=0\"\npid_file = \"/tmp/a.pid\"\nmax_connections = 8\n",
        )
        .unwrap();
        let args = Args::try_parse_from([
            "rbus-daemon",
            "-c",
            config.to_str().unwrap(),
            "-p",
            "/tmp/b.pid",
        ])
        .unwrap();
        let settings = build_settings(&args).unwrap();
        assert_eq!(settings.address.transport(), "tcp");
        assert_eq!(settings.listener.max_connections, 8);
        assert_eq!(settings.pid_file, Some(PathBuf::from("/tmp/b.pid")));
    }
}

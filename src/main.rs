//! Binary entrypoint for the meshgate CLI.
//!
//! Commands:
//! - `start [--port <path>] [--tcp <host:port>]` - run the gateway against a radio
//! - `init` - write a starter `config.toml`
//! - `status` - print stored device identity, table counts and counters as JSON
//! - `smoketest [--port <path>|--tcp <host:port>] [--timeout <s>]` - connect once and report
//!
//! See the library crate docs for module-level details: `meshgate::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::sync::Arc;

use meshgate::config::Config;
use meshgate::device::{CompanionConnector, DeviceManager};
use meshgate::gateway::{status_report, Gateway};
use meshgate::live::NullSink;
use meshgate::storage::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "Gateway between a MeshCore companion radio and its clients")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway
    Start {
        /// Serial device (e.g., /dev/ttyUSB0); "auto" probes USB serial ports
        #[arg(short, long)]
        port: Option<String>,

        /// Connect over TCP instead of serial
        #[arg(long, value_name = "HOST:PORT", conflicts_with = "port")]
        tcp: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Show stored device info and statistics
    Status,
    /// Connect once, print the device identity and exit
    #[command(name = "smoketest", alias = "smoke-test")]
    SmokeTest {
        #[arg(short, long)]
        port: Option<String>,

        #[arg(long, value_name = "HOST:PORT", conflicts_with = "port")]
        tcp: Option<String>,

        /// Seconds to wait before giving up
        #[arg(short, long, default_value_t = 20)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { port, tcp } => {
            let mut config = load_config(&cli.config).await?;
            apply_transport_args(&mut config, port, tcp)?;
            init_logging(&Some(config.clone()), cli.verbose);
            info!("Starting meshgate v{}", env!("CARGO_PKG_VERSION"));
            info!("Device transport: {}", config.device.transport());

            let gateway = Gateway::new(config)?;
            gateway.run().await?;
        }
        Commands::Init => {
            init_logging(&None, cli.verbose);
            if tokio::fs::try_exists(&cli.config).await.unwrap_or(false) {
                return Err(anyhow!("{} already exists; refusing to overwrite", cli.config));
            }
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = load_config(&cli.config).await?;
            init_logging(&Some(config.clone()), cli.verbose);
            let db_path = config.storage.database_path();
            let store = SqliteStore::open(&db_path)
                .map_err(|e| anyhow!("Failed to open database {}: {}", db_path.display(), e))?;
            println!("{}", serde_json::to_string_pretty(&status_report(&store, None)?)?);
        }
        Commands::SmokeTest { port, tcp, timeout } => {
            let mut config = load_config(&cli.config).await?;
            apply_transport_args(&mut config, port, tcp)?;
            init_logging(&Some(config.clone()), cli.verbose);
            let ok = smoke_test(config, timeout).await?;
            std::process::exit(if ok { 0 } else { 1 });
        }
    }

    Ok(())
}

/// Config file if present, defaults otherwise; `MC_*` variables on top.
async fn load_config(path: &str) -> Result<Config> {
    let mut config = if tokio::fs::try_exists(path).await.unwrap_or(false) {
        Config::load(path).await?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    Ok(config)
}

fn apply_transport_args(config: &mut Config, port: Option<String>, tcp: Option<String>) -> Result<()> {
    if let Some(addr) = tcp {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("--tcp expects HOST:PORT, got '{}'", addr))?;
        config.device.tcp_host = host.to_string();
        config.device.tcp_port = port
            .parse()
            .map_err(|e| anyhow!("invalid TCP port '{}': {}", port, e))?;
    } else if let Some(port) = port {
        config.device.serial_port = port;
        config.device.tcp_host.clear();
    }
    Ok(())
}

/// Connect with a throwaway in-memory store and print what the radio reports.
async fn smoke_test(mut config: Config, timeout: u64) -> Result<bool> {
    use tokio::time::{sleep, Duration, Instant};

    config.device.auto_reconnect = false;
    config.device.max_retries = 1;
    let connector = Arc::new(CompanionConnector::new(config.device.connect_timeout()));
    let store = Arc::new(SqliteStore::in_memory()?);
    let manager = DeviceManager::new(config.device.clone(), connector, store.clone(), Arc::new(NullSink));
    info!("Starting smoke test on {}", config.device.transport());
    manager.start();

    let deadline = Instant::now() + Duration::from_secs(timeout);
    while Instant::now() < deadline {
        let status = manager.status();
        if status.connected || status.unreachable {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    let status = manager.status();
    let battery = if status.connected {
        Some(manager.get_battery().await)
    } else {
        None
    };
    if !status.connected {
        error!(
            "Smoke test failed: {}",
            status.last_error.as_deref().unwrap_or("no connection within timeout")
        );
    }
    let payload = serde_json::json!({
        "status": if status.connected { "ok" } else { "failed" },
        "transport": status.transport,
        "device_name": status.device_name,
        "public_key": status.public_key,
        "self_info": status.self_info,
        "battery": battery,
        "contacts": store.get_stats()?.contacts,
        "timeout_seconds": timeout,
    });
    println!("{}", payload);
    manager.stop().await;
    Ok(status.connected)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    // -v / -vv win over the configured level
    let level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);
    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });
    if let Some(f) = log_file {
        let file = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when someone is watching it.
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}

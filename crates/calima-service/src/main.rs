//! Calima Service - background sync and command line control for PAX Calima fans.
//!
//! Run with: `cargo run -p calima-service`

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use calima_core::{BleDiscovery, Discovery, FanChannel, FanDevice, FanDriver, Pairable};
use calima_service::{Board, Collector, Config, ConfigStore, DeviceConfig, default_config_path};

/// Calima Service - keeps PAX Calima fans synced and controls them.
#[derive(Parser, Debug)]
#[command(name = "calima-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sync every configured fan until interrupted (default behavior).
    Run,

    /// Scan for PAX fans that are not configured yet.
    Scan {
        /// Print candidates as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Pair a discovered fan and add it to the configuration.
    Pair {
        /// Address of the fan, as printed by `scan`.
        address: String,
        /// The fan's four digit PIN.
        #[arg(long)]
        pin: String,
        /// Name to store instead of the one the fan reports.
        #[arg(long)]
        name: Option<String>,
    },

    /// Sync once and print what each fan reports.
    Status {
        /// Only this fan (name, address or id).
        device: Option<String>,
        /// Print the board as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Turn boost on or off.
    Boost {
        /// Fan name, address or id.
        device: String,
        #[arg(value_enum)]
        state: Switch,
        /// Boost duration in seconds (default 900).
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Set one channel's fan speed.
    Speed {
        /// Fan name, address or id.
        device: String,
        /// Channel: humidity, light or trickle.
        channel: FanChannel,
        /// Speed in RPM (multiple of 25).
        rpm: u16,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::new("calima_service=debug,calima_core=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("calima_service=info,calima_core=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;

    match args.command {
        Some(Command::Run) | None => run(config, config_path).await,
        Some(Command::Scan { json }) => scan(config, json).await,
        Some(Command::Pair { address, pin, name }) => {
            pair(config, &config_path, &address, &pin, name).await
        }
        Some(Command::Status { device, json }) => status(config, device.as_deref(), json).await,
        Some(Command::Boost {
            device,
            state,
            seconds,
        }) => {
            let on = matches!(state, Switch::On);
            let fan = open_device(&config, &device).await?;
            let result = fan
                .boost_on_off(on, seconds.map(Duration::from_secs))
                .await;
            fan.close().await;
            result?;
            println!("Boost {} on {}", if on { "started" } else { "stopped" }, fan.name());
            Ok(())
        }
        Some(Command::Speed {
            device,
            channel,
            rpm,
        }) => {
            let fan = open_device(&config, &device).await?;
            let result = fan.set_fan_speed(channel, rpm).await;
            fan.close().await;
            result?;
            println!("{} {} speed set to {} RPM", fan.name(), channel, rpm);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path.exists() {
        Ok(Config::load_validated(path)?)
    } else {
        info!("No configuration at {}, using defaults", path.display());
        Ok(Config::default())
    }
}

async fn ble_discovery(config: &Config) -> anyhow::Result<Arc<dyn Discovery>> {
    let discovery = BleDiscovery::new()
        .await
        .context("no Bluetooth adapter available")?
        .with_scan_options(config.discovery.scan_options())
        .with_connection_config(config.connection.link_config());
    Ok(Arc::new(discovery))
}

async fn run(config: Config, config_path: PathBuf) -> anyhow::Result<()> {
    let discovery = ble_discovery(&config).await?;
    let store = ConfigStore::new(config.clone(), config_path);
    let collector = Collector::new(discovery, Board::new(), store);

    let running = collector.start(&config).await;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");
    running.shutdown().await;
    Ok(())
}

async fn scan(config: Config, json: bool) -> anyhow::Result<()> {
    let driver = FanDriver::new(ble_discovery(&config).await?)
        .with_options(config.discovery.discovery_options(&config.connection));
    let candidates = driver.discover(&config.identities()).await;

    if json {
        let records: Vec<_> = candidates.iter().map(|c| c.to_record()).collect();
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    if candidates.is_empty() {
        println!("No new fans found");
        return Ok(());
    }
    for candidate in candidates {
        println!(
            "{:<20} {:<24} {}",
            candidate.advertisement.address, candidate.name, candidate.mode
        );
    }
    Ok(())
}

async fn pair(
    mut config: Config,
    config_path: &Path,
    address: &str,
    pin: &str,
    name: Option<String>,
) -> anyhow::Result<()> {
    let driver = FanDriver::new(ble_discovery(&config).await?)
        .with_options(config.discovery.discovery_options(&config.connection));
    let mut session = driver.pair(config.identities());
    session.list_devices().await?;
    session.select(address)?;
    let digits: Vec<String> = pin.chars().map(String::from).collect();
    session.pincode(&digits)?;
    let mut record = session.done()?;
    if let Some(name) = name {
        record.name = name;
    }

    config.upsert_device(&record);
    config.validate()?;
    config.save(config_path)?;
    println!(
        "Paired {} ({}), saved to {}",
        record.name,
        record.identity.address,
        config_path.display()
    );
    Ok(())
}

async fn status(config: Config, device: Option<&str>, json: bool) -> anyhow::Result<()> {
    let mut selected = config.clone();
    if let Some(key) = device {
        let Some(found) = config.find_device(key) else {
            bail!("no configured device matches '{key}'");
        };
        selected.devices = vec![found.clone()];
    }

    let board = Board::new();
    let collector = Collector::new(
        ble_discovery(&config).await?,
        Arc::clone(&board),
        ConfigStore::in_memory(config),
    );
    collector.sync_once(&selected).await;
    let devices = board.snapshot().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    for status in devices {
        println!("{} ({})", status.name, status.address);
        match &status.availability {
            calima_core::Availability::Unavailable(reason) => {
                println!("  unavailable: {reason}");
            }
            _ => {
                for (capability, value) in &status.values {
                    println!("  {capability:<20} {value}");
                }
            }
        }
    }
    Ok(())
}

/// Build a single device from the configuration for a one-off action.
async fn open_device(config: &Config, key: &str) -> anyhow::Result<FanDevice> {
    let Some(device) = config.find_device(key) else {
        bail!("no configured device matches '{key}'");
    };
    if device.pin.is_none() {
        bail!("device '{}' has no PIN configured", device.name);
    }
    let board = Board::new();
    let sink = board.register(&device.name, &device.address).await;
    Ok(FanDevice::new(
        DeviceConfig::to_record(device),
        ble_discovery(config).await?,
        config.connection.policy(),
        sink,
        Arc::new(ConfigStore::in_memory(config.clone())),
    ))
}

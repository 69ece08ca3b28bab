use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use netstatsd::config::Config;
use netstatsd::network::Network;
use netstatsd::platform::notify::JsonlNotifier;
use netstatsd::platform::procfs::ProcNetDev;
use netstatsd::platform::Collaborators;
use netstatsd::storage::{AlarmStore, SampleStore, SeriesOwner, StoreLock};
use netstatsd::NetworkStatsService;

#[derive(Parser)]
#[command(name = "netstatsd")]
#[command(about = "Per-network traffic accounting with quota alarms")]
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
    /// Start the accounting daemon
    Start,
    /// Write a default configuration file
    Init,
    /// Show stored networks, usage and alarms
    Status,
    /// Print daily samples of one network
    Samples {
        /// `wifi` or `mobile/<iccid>`
        network: Network,
        /// `default`, `app:<manifest>` or `service:<type>`
        #[arg(short, long, default_value = "default")]
        owner: SeriesOwner,
        /// Number of days back from today
        #[arg(short, long, default_value_t = 7)]
        days: i64,
        /// Print the sample set as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: u8, config: Option<&Config>) {
    let level = match verbose {
        0 => config.map(|c| c.logging.level.as_str()).unwrap_or("info"),
        1 => "debug",
        _ => "trace",
    };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));

    if let Some(path) = config.and_then(|c| c.logging.file.as_deref()) {
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Failed to open log file {}: {}; logging to stderr", path, e),
        }
    }
    builder.init();
}

async fn load_config(cli: &Cli) -> Result<Config> {
    let config = Config::load(&cli.config).await?;
    init_logging(cli.verbose, Some(&config));
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start => {
            let config = load_config(&cli).await?;
            run_daemon(config).await?;
        }
        Commands::Init => {
            init_logging(cli.verbose, None);
            info!("Initializing new netstatsd configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Status => {
            let config = load_config(&cli).await?;
            show_status(&config).await?;
        }
        Commands::Samples { network, owner, days, json } => {
            let config = load_config(&cli).await?;
            show_samples(&config, network, owner, *days, *json).await?;
        }
    }

    Ok(())
}

async fn run_daemon(config: Config) -> Result<()> {
    info!("Starting netstatsd v{}", env!("CARGO_PKG_VERSION"));
    let _lock = StoreLock::acquire(&config.storage.data_dir)?;

    let counters = Arc::new(ProcNetDev::new(&config.counters.proc_net_dev));
    let collaborators = Collaborators {
        counters: counters.clone(),
        notifier: Arc::new(JsonlNotifier::new(config.notifications.file.as_ref().map(PathBuf::from))),
        sims: Arc::new(config.radio.icc_ids.clone()),
    };

    let service = NetworkStatsService::open(config.stats_options(), collaborators).await?;
    let handle = service.spawn();

    for iface in &config.interfaces {
        info!("Announcing interface {} ({:?})", iface.name, iface.kind);
        handle.network_changed(iface.network_info());
    }

    let mut poll = tokio::time::interval(Duration::from_secs(config.stats.threshold_poll_secs));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                match counters.crossed().await {
                    Ok(crossed) => {
                        for interface in crossed {
                            info!("Quota reached on {}", interface);
                            handle.bandwidth_threshold_crossed(&interface);
                        }
                    }
                    Err(e) => warn!("Threshold poll failed: {}", e),
                }
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
        }
    }

    handle.shutdown().await?;
    info!("netstatsd stopped");
    Ok(())
}

async fn show_status(config: &Config) -> Result<()> {
    let dir = Path::new(&config.storage.data_dir);
    let samples = SampleStore::open(dir, config.time_basis(), config.stats.first_sample_policy).await?;
    let alarms = AlarmStore::open(dir).await?;

    println!("netstatsd v{}", env!("CARGO_PKG_VERSION"));
    println!("Data directory: {}", config.storage.data_dir);
    println!("Stored samples: {}", samples.len());

    println!("Networks:");
    for network in samples.available_networks() {
        let stats = samples.current_stats(&network, None);
        println!(
            "  {:<28} rx {:>14}  tx {:>14}",
            network.to_string(),
            stats.rx_bytes,
            stats.tx_bytes
        );
    }

    let service_types = samples.available_service_types();
    if !service_types.is_empty() {
        println!("Service types: {}", service_types.join(", "));
    }

    let all = alarms.all();
    println!("Alarms: {}", all.len());
    for alarm in all {
        println!(
            "  #{:<6} {:<28} at {:>14} bytes  {}",
            alarm.id,
            alarm.network.to_string(),
            alarm.absolute_threshold,
            alarm.origin.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn show_samples(config: &Config, network: &Network, owner: &SeriesOwner, days: i64, json: bool) -> Result<()> {
    let dir = Path::new(&config.storage.data_dir);
    let samples = SampleStore::open(dir, config.time_basis(), config.stats.first_sample_policy).await?;

    let end = Utc::now();
    let start = end - ChronoDuration::days(days.max(0));
    let set = samples.find(owner, network, start, end);

    if json {
        println!("{}", serde_json::to_string_pretty(&set)?);
        return Ok(());
    }

    println!("{} {} from {} to {}", set.network, set.owner, set.start.to_rfc3339(), set.end.to_rfc3339());
    for point in &set.data {
        let show = |v: Option<u64>| v.map(|b| b.to_string()).unwrap_or_else(|| "-".to_string());
        println!("  {}  rx {:>14}  tx {:>14}", point.date.format("%Y-%m-%d"), show(point.rx_bytes), show(point.tx_bytes));
    }
    Ok(())
}

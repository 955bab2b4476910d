use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use acqsrv::catalogue::{self, ImportMode};
use acqsrv::plugins::{cmbus, mbus};
use acqsrv::{config::AppConfig, env::HostEnv, manager::InstanceManager, store};
use common::SqliteClient;

#[derive(Parser, Debug)]
#[clap(author, version, about = "GridFlux device-acquisition service", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, value_parser, default_value = "acqsrv.yaml")]
    config: PathBuf,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the acquisition service (the default)
    Run,
    /// Import one device-type spec file into the catalogue
    ImportType {
        /// YAML or JSON spec file
        file: PathBuf,
        /// Disable points missing from the spec instead of soft-deleting
        #[clap(long)]
        disable_missing: bool,
    },
    /// Seed the catalogue and the serial channels, then exit
    InitData,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.to_str())
        .context("load configuration")?;

    common::logging::init_with_config(common::logging::LogConfig {
        service_name: "acqsrv".to_string(),
        log_dir: PathBuf::from(&config.log_path),
        console_level: if config.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        },
        file_level: tracing::Level::DEBUG,
    })
    .map_err(|e| anyhow::anyhow!("init logging: {e}"))?;

    let db = SqliteClient::new(config.db_path())
        .await
        .context("open database")?;
    store::migrate(&db).await.context("migrate schema")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, db).await,
        Command::ImportType {
            file,
            disable_missing,
        } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("read {}", file.display()))?;
            let mode = if disable_missing {
                ImportMode::DisableMissing
            } else {
                ImportMode::SoftDeleteMissing
            };
            let outcome = catalogue::import_spec_bytes(&db, &data, mode).await?;
            println!(
                "import ok: type_key={} points={} checksum={}{}",
                outcome.type_key,
                outcome.points_upserted,
                outcome.checksum,
                if outcome.unchanged { " (unchanged)" } else { "" }
            );
            Ok(())
        }
        Command::InitData => {
            seed(&config, &db).await?;
            println!("init-data ok");
            Ok(())
        }
    }
}

/// Seed catalogue types and configured serial channels
async fn seed(config: &AppConfig, db: &SqliteClient) -> anyhow::Result<()> {
    let imported = catalogue::seed_from_dir(db, &config.types_dir()).await?;
    if imported > 0 {
        info!(count = imported, "device types seeded");
    }
    for serial in &config.serial {
        if serial.device.is_empty() {
            continue;
        }
        store::ensure_serial_channel(db, &serial.device, &serial.device2).await?;
    }
    Ok(())
}

async fn run(config: AppConfig, db: SqliteClient) -> anyhow::Result<()> {
    info!("starting acquisition service");

    let pid_file = write_pid_file(&config)?;
    seed(&config, &db).await?;

    // Broker client; the event loop task must keep polling or publishes stall
    let root = CancellationToken::new();
    let mqtt = if config.mqtt.enabled() {
        let mut options =
            rumqttc::MqttOptions::new("gridflux-acqsrv", &config.mqtt.host, config.mqtt.port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        let (client, mut event_loop) = rumqttc::AsyncClient::new(options, 64);
        let cancel = root.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = event_loop.poll() => {
                        if let Err(e) = event {
                            warn!(error = %e, "mqtt event loop error");
                            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        });
        info!(host = %config.mqtt.host, port = config.mqtt.port, "broker client started");
        Some(client)
    } else {
        None
    };

    let env = Arc::new(HostEnv::new(
        Arc::new(config.clone()),
        db.clone(),
        mqtt,
        root.clone(),
    ));

    // Explicit plugin registration; duplicates and empty tags are refused
    mbus::register().context("register mbus")?;
    cmbus::register().context("register cmbus")?;
    info!(plugins = ?acqsrv::registry::registered_types(), "factories registered");

    let manager = InstanceManager::new(root.clone(), env.clone());

    for channel in store::list_channels(&db, true).await? {
        let plugin = channel.plugin.clone();
        let id = channel.id.clone();
        if plugin == "cmbus" && !config.simulator {
            info!(id = %id, "simulator disabled, skipping channel");
            continue;
        }
        if let Err(e) = manager.create(&plugin, &id, channel).await {
            error!(plugin = %plugin, id = %id, error = %e, "channel start failed");
        }
    }
    info!(count = manager.live_instances().len(), "channels started");

    common::shutdown::wait_for_shutdown().await;
    info!("shutdown signal received");

    root.cancel();
    manager.destroy_all().await;

    if let Some(path) = pid_file {
        let _ = std::fs::remove_file(path);
    }

    info!("bye");
    Ok(())
}

fn write_pid_file(config: &AppConfig) -> anyhow::Result<Option<PathBuf>> {
    if config.pid.is_empty() {
        return Ok(None);
    }
    let path = PathBuf::from(&config.pid);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("write pid file {}", path.display()))?;
    Ok(Some(path))
}

// src/main.rs - Host daemon entry point
use clap::Parser;
use gantry_host::config::{self, Config};
use gantry_host::dispatch::CommandDispatcher;
use gantry_host::files::{ChannelFileRegistry, VolumeResolver};
use gantry_host::firmware::serial::SerialFirmwareLink;
use gantry_host::firmware::FirmwareLink;
use gantry_host::handler::{run_file_feed, CommandHandler, HandlerServices};
use gantry_host::job::{JobController, MOTION_SYSTEMS};
use gantry_host::lifecycle::Lifecycle;
use gantry_host::model::{ObjectModel, ObjectModelStore, Volume};
use gantry_host::plugins::{PluginManager, ProcessPlugins};
use gantry_host::web;
use std::sync::Arc;
use std::time::Duration;

/// How long in-flight codes get to wind down before the process exits.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "gantry-host", version, about = "Code handling host for a motion-control board")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "gantry.toml")]
    config: String,

    /// Overrides `log.level` from the configuration
    #[arg(long)]
    log_level: Option<tracing::Level>,

    /// Run without opening the serial port
    #[arg(long)]
    offline: bool,
}

fn initial_model(config: &Config) -> ObjectModel {
    let hostname = config.host.hostname();
    let mut model = ObjectModel::default();
    model.network.name = hostname.clone();
    model.network.hostname = hostname;
    model.volumes.push(Volume {
        path: config.host.base_directory.display().to_string(),
        mounted: config.host.base_directory.is_dir(),
        capacity: None,
        free_space: None,
    });
    model
}

fn connect_firmware(config: &Config, offline: bool) -> SerialFirmwareLink {
    let timeout = Duration::from_millis(config.firmware.reply_timeout_ms);
    if offline || config.firmware.serial.is_empty() {
        tracing::warn!("No firmware connection, forwarded codes will fail");
        return SerialFirmwareLink::offline(timeout);
    }
    match SerialFirmwareLink::connect(&config.firmware.serial, config.firmware.baud, timeout) {
        Ok(link) => {
            tracing::info!("Firmware: {} @ {} baud", config.firmware.serial, config.firmware.baud);
            link
        }
        Err(e) => {
            tracing::error!("Failed to open {}: {}", config.firmware.serial, e);
            SerialFirmwareLink::offline(timeout)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();

    let config = match config::load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from '{}': {}", args.config, e);
            return Err(e.into());
        }
    };
    let level = match args.log_level {
        Some(level) => level,
        None => config.log.level.parse().unwrap_or(tracing::Level::INFO),
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting gantry-host {}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Volume 0: {}", config.host.base_directory.display());

    let files = Arc::new(ChannelFileRegistry::new(config.host.compatibility));
    let firmware = Arc::new(connect_firmware(&config, args.offline));
    firmware.request_full_update().await;
    let plugins = Arc::new(ProcessPlugins::new());
    plugins.start(&config.host.plugins).await;
    let lifecycle = Lifecycle::new();

    let handler = Arc::new(CommandHandler::new(
        config.host.clone(),
        HandlerServices {
            dispatcher: CommandDispatcher::new(files),
            job: Arc::new(JobController::new()),
            model: ObjectModelStore::new(initial_model(&config)),
            resolver: Arc::new(VolumeResolver::single(config.host.base_directory.clone())),
            firmware,
            plugins: plugins.clone(),
            lifecycle: lifecycle.clone(),
        },
    ));

    let shutdown = lifecycle.shutdown_token().child_token();
    let feeds: Vec<_> = (0..MOTION_SYSTEMS)
        .map(|system| tokio::spawn(run_file_feed(handler.clone(), system, shutdown.clone())))
        .collect();

    let app = web::api::create_router(handler.clone());
    let listener = tokio::net::TcpListener::bind(&config.api.bind).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    });
    let server = tokio::spawn(async move { server.await });

    let code = tokio::select! {
        termination = lifecycle.terminated() => {
            tracing::info!("{}", termination.reason);
            termination.code
        }
        _ = tokio::signal::ctrl_c() => {
            // cancels the codes still in flight
            lifecycle.schedule_termination(0, "Interrupted");
            0
        }
    };

    shutdown.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for result in futures_util::future::join_all(feeds).await {
            if let Err(e) = result {
                tracing::warn!("File feed ended abnormally: {}", e);
            }
        }
        match server.await {
            Ok(Err(e)) => tracing::warn!("Web API stopped with an error: {}", e),
            Err(e) => tracing::warn!("Web API task failed: {}", e),
            Ok(Ok(())) => {}
        }
    })
    .await;
    if drained.is_err() {
        tracing::error!("Shutdown did not complete within {:?}, exiting anyway", SHUTDOWN_GRACE);
    }
    plugins.stop_all().await;

    tracing::info!("Exiting with code {}", code);
    std::process::exit(code);
}

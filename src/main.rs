#[macro_use] extern crate log;

use std::sync::Arc;

use punish_api_rs::{
    config::{deserialize_punish_config, CleanupOptions},
    database,
    punishment::{PunishmentManager, hooks::{ChannelEnforcer, Enforcement}},
    util::webhook::WebhookUtils
};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle, time::Instant};

fn setup_logger(log_file: &Option<String>) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] [{}] {}",
                chrono::Local::now().format("[%Y-%m-%d] [%H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log::LevelFilter::Debug)
        .level_for("sqlx", log::LevelFilter::Warn)
        .chain(std::io::stdout());
    if let Some(path) = log_file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(())
}

// stands in for the session layer: reports what it would enforce
fn spawn_enforcement_consumer(mut receiver: UnboundedReceiver<Enforcement>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(enforcement) = receiver.recv().await {
            match enforcement {
                Enforcement::Disconnect(punishment) => info!(
                    "Disconnecting {} ({}, {})",
                    punishment.target_id,
                    punishment.kind,
                    punishment.formatted_duration()
                ),
                Enforcement::Mute(punishment) => info!(
                    "Muting {} ({})",
                    punishment.target_id,
                    punishment.formatted_duration()
                )
            }
        }
    })
}

fn spawn_sweeper(manager: Arc<PunishmentManager>, cleanup: &CleanupOptions) -> JoinHandle<()> {
    let start = Instant::now() + cleanup.initial_delay();
    let period = cleanup.interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(start, period);
        loop {
            interval.tick().await;
            manager.cleanup_expired_punishments().await;
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<(), String> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => return Err(format!("Signal Error: {}", e))
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map_err(|e| format!("Signal Error: {}", e)),
        _ = terminate.recv() => Ok(())
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<(), String> {
    tokio::signal::ctrl_c().await.map_err(|e| format!("Signal Error: {}", e))
}

#[tokio::main]
async fn main() -> Result<(), String> {
    // config
    let punish_config = match deserialize_punish_config().await {
        Ok(config) => config,
        Err(parse_error) => return Err(format!("Config Error: {}", parse_error))
    };
    let options = punish_config.options;

    // setup runtime global logger
    match setup_logger(&options.log_file) {
        Ok(_) => (),
        Err(e) => return Err(format!("Logger Setup Error: {}", e)),
    }

    // storage
    let backend = match database::connect(&options.database).await {
        Ok(backend) => backend,
        Err(db_err) => return Err(format!("Database Error: {}", db_err))
    };

    let (enforcer, enforcements) = ChannelEnforcer::channel();
    let manager = match PunishmentManager::builder(Arc::clone(&backend))
        .enforcer(Arc::new(enforcer))
        .webhooks(WebhookUtils::new(&options.punishments_webhook_url))
        .sweep_scope(options.cleanup.scope)
        .ip_hashing(options.enable_ip_hashing)
        .build()
        .await {
            Ok(manager) => Arc::new(manager),
            Err(db_err) => {
                backend.close().await;
                return Err(format!("Database Error: {}", db_err));
            }
        };

    let consumer = spawn_enforcement_consumer(enforcements);
    let sweeper = spawn_sweeper(Arc::clone(&manager), &options.cleanup);
    info!(
        "Sweeping expired punishments every {}s ({} scope)",
        options.cleanup.interval().as_secs(),
        options.cleanup.scope
    );

    let res = wait_for_shutdown().await;
    info!("Shutting down");
    sweeper.abort();
    consumer.abort();
    manager.shutdown().await;
    res
}

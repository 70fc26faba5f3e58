use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use replicant_core::config::Config;
use replicant_core::core_sync::{
    Connectivity, DecoderRegistry, FileStorage, HttpBackend, HttpTransport, LocalStorage,
    MemoryStorage, Session, StoreEvent, SyncBackend, SyncClient, SyncContext, ThrottleSettings,
};
use replicant_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use replicant_core::metrics;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "replicant")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file, REPLICANT_* variables still apply on top
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mirror the server into the local store until interrupted
    Run {
        /// Collection kept as schemaless records; repeatable
        #[arg(long = "collection")]
        collections: Vec<String>,

        /// Throttle window in seconds, replaces sync.autoupdate_delay
        #[arg(long)]
        delay: Option<f64>,

        /// Logged-in user; anonymous when omitted
        #[arg(long)]
        user: Option<u64>,
    },
    /// Ask the server whether it is healthy
    Health,
    /// Fetch one snapshot or replay and print a summary
    Fetch {
        /// Replay changes after this version instead of fetching a snapshot
        #[arg(long)]
        since: Option<u64>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => {
            let mut config = Config::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?;
            config.apply_env()?;
            config.validate()?;
            config
        }
        None => Config::from_env()?,
    };
    Ok(config)
}

async fn open_storage(config: &Config) -> Result<Arc<dyn LocalStorage>> {
    match &config.storage.cache_dir {
        Some(dir) => {
            let storage = FileStorage::open(dir)
                .await
                .with_context(|| format!("opening cache directory {}", dir.display()))?;
            Ok(Arc::new(storage))
        }
        None => Ok(Arc::new(MemoryStorage::new())),
    }
}

async fn run(
    config: Config,
    collections: Vec<String>,
    delay: Option<f64>,
    user: Option<u64>,
) -> Result<()> {
    if collections.is_empty() {
        warn!("no --collection given, every record will be dropped");
    }
    let mut registry = DecoderRegistry::new();
    for collection in &collections {
        registry.register_json(collection.as_str());
    }

    let throttle_delay = ThrottleSettings {
        autoupdate_delay: delay,
    }
    .delay(config.sync.autoupdate_delay);

    let transport = Arc::new(HttpTransport::from_config(&config.server)?);
    let backend = Arc::new(HttpBackend::new(config.server.clone())?);
    let storage = open_storage(&config).await?;
    let session = Arc::new(Session::new(user, config.sync.guests_enabled));

    let ctx = SyncContext::new(
        &config,
        transport,
        backend,
        storage,
        registry,
        session.clone(),
        throttle_delay,
    );
    let client = SyncClient::new(ctx);

    if config.storage.persist {
        let outcome = client.bootstrap(user).await?;
        info!(
            version = outcome.version,
            cache_cleared = outcome.cache_cleared,
            "bootstrapped"
        );
    } else {
        session.set_user(user);
    }

    let mut events = client.store().subscribe();
    let mut connectivity = client.connectivity().subscribe();
    client.start().await?;
    info!(
        server = %config.server.base_url,
        delay_ms = throttle_delay.as_millis() as u64,
        "mirroring server, press Ctrl-C to stop"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Ok(StoreEvent::Modified { version }) => {
                    let sizes: Vec<(String, usize)> = client
                        .store()
                        .collections()
                        .into_iter()
                        .map(|name| {
                            let len = client.store().len(&name);
                            (name, len)
                        })
                        .collect();
                    info!(version, collections = ?sizes, "store modified");
                }
                Ok(StoreEvent::Cleared) => info!("store cleared"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed store events"),
                Err(RecvError::Closed) => break,
            },
            changed = connectivity.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *connectivity.borrow_and_update();
                if let Connectivity::Offline(reason) = state {
                    warn!(reason = reason.as_str(), "client went offline");
                    break;
                }
            }
        }
    }

    client.stop();
    info!(version = client.store().version(), "stopped");
    Ok(())
}

async fn health(config: Config) -> Result<()> {
    let backend = HttpBackend::new(config.server.clone())?;
    match backend.is_healthy().await {
        Ok(healthy) => println!("{}: healthy={}", config.server.base_url, healthy),
        Err(e) => println!("{}: unreachable ({})", config.server.base_url, e),
    }
    Ok(())
}

async fn fetch(config: Config, since: Option<u64>) -> Result<()> {
    let backend = HttpBackend::new(config.server)?;
    let update = backend.get_elements(since).await?;

    let changed: serde_json::Map<String, serde_json::Value> = update
        .changed
        .iter()
        .map(|(name, records)| (name.clone(), json!(records.len())))
        .collect();
    let deleted: serde_json::Map<String, serde_json::Value> = update
        .deleted
        .iter()
        .map(|(name, ids)| (name.clone(), json!(ids.len())))
        .collect();
    let summary = json!({
        "from_change_id": update.from_version,
        "to_change_id": update.to_version,
        "all_data": update.full,
        "changed": changed,
        "deleted": deleted,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(args.config.as_ref())?;

    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    init_logging_with_config(LogConfig::from(&config.logging))?;
    metrics::init_metrics();

    match args.command {
        Command::Run {
            collections,
            delay,
            user,
        } => run(config, collections, delay, user).await?,
        Command::Health => health(config).await?,
        Command::Fetch { since } => fetch(config, since).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_run() {
        let args = Args::parse_from([
            "replicant",
            "--log-level",
            "warning",
            "run",
            "--collection",
            "users",
            "--collection",
            "groups",
            "--delay",
            "0.5",
        ]);
        assert_eq!(args.log_level, Some(LogLevel::Warn));
        match args.command {
            Command::Run {
                collections,
                delay,
                user,
            } => {
                assert_eq!(collections, vec!["users", "groups"]);
                assert_eq!(delay, Some(0.5));
                assert_eq!(user, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_fetch() {
        let args = Args::parse_from(["replicant", "fetch", "--since", "12"]);
        assert!(matches!(args.command, Command::Fetch { since: Some(12) }));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        assert!(Args::try_parse_from(["replicant", "-l", "loud", "health"]).is_err());
    }

    #[test]
    fn test_config_file_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replicant.toml");
        let mut config = Config::default();
        config.server.base_url = "https://sync.example.org".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = load_config(Some(&path)).unwrap();
        assert_eq!(loaded.server.base_url, "https://sync.example.org");
    }

    #[test]
    fn test_server_delay_wins() {
        let delay = ThrottleSettings {
            autoupdate_delay: Some(0.25),
        }
        .delay(Duration::ZERO);
        assert_eq!(delay, Duration::from_millis(250));
    }
}

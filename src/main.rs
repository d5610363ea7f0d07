use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use serenity::all::GatewayIntents;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use guardian_sync::bungie;
use guardian_sync::config;
use guardian_sync::db;
use guardian_sync::discord::Handler;
use guardian_sync::oauth::TokenRefresher;

#[derive(Parser, Debug)]
#[command(name = "guardian-sync", about = "Keeps Discord nicknames in sync with Destiny 2 display names")]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    cfg.ensure_dirs().context("creating data dir")?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/guardian.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await.context("opening database")?;
    db::run_migrations(&pool).await.context("running migrations")?;

    let destiny = Arc::new(bungie::Client::new(cfg.bungie.api_key.clone()));
    let tokens = Arc::new(TokenRefresher::new(
        cfg.bungie.client_id.clone(),
        cfg.bungie.client_secret.clone(),
    ));

    let cancel = CancellationToken::new();
    let scheduler_handle = Arc::new(Mutex::new(None));
    let handler = Handler::new(
        pool,
        destiny,
        tokens,
        Duration::from_secs(cfg.app.sync_interval_secs),
        cancel.clone(),
        scheduler_handle.clone(),
    );

    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_MEMBERS;
    let mut client = serenity::all::Client::builder(&cfg.discord.bot_token, intents)
        .event_handler(handler)
        .await
        .context("building discord client")?;

    let shard_manager = client.shard_manager.clone();
    let gateway = tokio::spawn(async move {
        if let Err(err) = client.start().await {
            error!(error = ?err, "discord client stopped");
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");

    cancel.cancel();
    shard_manager.shutdown_all().await;
    let _ = gateway.await;

    // Let in-flight sync work observe the cancellation and drain.
    let handle = scheduler_handle.lock().ok().and_then(|mut slot| slot.take());
    if let Some(handle) = handle {
        let _ = handle.await;
    }

    info!("bye");
    Ok(())
}

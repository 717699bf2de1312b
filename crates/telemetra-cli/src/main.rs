mod config;
mod heartbeat;
mod keys;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use telemetra_core::Uplink;
use telemetra_net::{
    AgentHandler, HttpAuthenticator, Session, SessionConfig, SessionState, WsConnector,
};
use telemetra_sched::{TransferMethod, TransferMethodsIndex};
use telemetra_store::LocalStore;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Settings};
use crate::keys::RsaKeys;

#[derive(Debug, Parser)]
#[command(name = "telemetrad", version, about = "telemetra agent daemon")]
struct Args {
    /// Agent configuration file.
    #[arg(short, long, default_value = "/etc/telemetra/agent.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let (settings, keys, heartbeat) = match startup(&args) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("telemetrad: {err:#}");
            return ExitCode::from(2);
        }
    };
    init_tracing(&settings.log_level);

    match run(settings, keys, heartbeat).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "telemetrad.failed");
            ExitCode::FAILURE
        }
    }
}

fn startup(args: &Args) -> Result<(Settings, RsaKeys, Option<TransferMethod>)> {
    let config = Config::load(&args.config)?;
    let settings = Settings::from_config(&config)?;
    let keys = RsaKeys::load(&settings.key_path)?;
    let heartbeat = settings
        .heartbeat
        .as_ref()
        .map(heartbeat::uptime_job)
        .transpose()
        .context("invalid heartbeat settings")?;
    Ok((settings, keys, heartbeat))
}

/// `RUST_LOG` overrides the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn run(settings: Settings, keys: RsaKeys, heartbeat: Option<TransferMethod>) -> Result<()> {
    let store = Arc::new(LocalStore::with_maintenance_interval(
        settings.username.clone(),
        settings.maintenance_interval,
    ));
    let authenticator = Arc::new(HttpAuthenticator::new(
        settings.login_url.clone(),
        settings.username.clone(),
        Arc::new(keys),
    ));
    let connector = Arc::new(WsConnector::new(settings.ws_url.clone()));
    let session = Session::new(
        SessionConfig {
            reconnect_delay: settings.reconnect_delay,
            workers: settings.workers,
            ..SessionConfig::default()
        },
        authenticator,
        connector,
    );

    let uplink: Arc<dyn Uplink> = session.clone();
    let index = TransferMethodsIndex::new(store.clone(), uplink);
    session.set_handler(Arc::new(AgentHandler::new(store, index.clone())));

    info!(
        username = %settings.username,
        server = %settings.login_url,
        "telemetrad.starting"
    );
    session.login().await.context("login failed")?;

    if let Some(job) = heartbeat {
        // hooking needs a live link
        wait_connected(&session, Duration::from_secs(30)).await;
        let name = job.name().to_string();
        if !index.add(job, true).await {
            warn!(job = %name, "telemetrad.heartbeat_pending");
        }
    }
    index.start_cron_loop();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("telemetrad.interrupted"),
        _ = session.join() => info!("telemetrad.session_ended"),
    }
    session.close().await;
    info!("telemetrad.stopped");
    Ok(())
}

async fn wait_connected(session: &Session, limit: Duration) {
    let connected = tokio::time::timeout(limit, session.wait_for(SessionState::Connected)).await;
    if connected.is_err() {
        info!(?limit, "telemetrad.still_connecting");
    }
}

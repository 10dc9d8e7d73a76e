//! Process entry point: parse CLI args, load configuration, wire up every
//! service, and run until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use broker::config::Config;
use broker::credentials::CredentialStore;
use broker::hypervisor::HypervisorAdapter;
use broker::invites::InviteStore;
use broker::session::SessionManager;
use broker::state::AppState;
use broker_api::auth::TokenSigner;
use broker_api::server::{self as api_server, LayerConfig};
use common::shutdown::ShutdownChannel;
use common::task::BrokerTask;
use tokio::sync::Mutex;
use tracing::info;

/// How long supervised tasks get to wind down after a shutdown signal
/// before the process gives up waiting and exits anyway.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Session reaper tick, per the session-TTL sweep contract.
const SESSION_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Invite-token reaper tick.
const INVITE_REAP_INTERVAL: Duration = Duration::from_secs(3600);

fn main() -> anyhow::Result<()> {
    let args: broker::cli::Args = argh::from_env();

    // SAFETY: called before the tokio runtime (and therefore any other
    // thread) starts, per `load_dotenv`'s safety contract.
    unsafe {
        common::env::load_dotenv(args.dotenv.as_deref())?;
    }

    common::logger::init();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let bind_addr = SocketAddr::new(config.bind_addr, config.bind_port);

    let credentials = Arc::new(CredentialStore::load(&config.credential_file_path)?);
    let invites = Arc::new(InviteStore::load(&config.invite_sidecar_path)?);
    let pending = Arc::new(Mutex::new(std::collections::HashMap::new()));
    let signer = Arc::new(TokenSigner::new(config.bearer_secret.as_bytes()));
    let hypervisor = Arc::new(HypervisorAdapter::new(
        config.hypervisor_host.clone(),
        config.hypervisor_api_token.clone(),
        config.hypervisor_tls_insecure,
    )?);

    let shutdown = ShutdownChannel::new();

    let sessions = Arc::new(SessionManager::new(
        config.bind_addr,
        config.ephemeral_port_min,
        config.ephemeral_port_max,
        config.session_timeout(),
        shutdown.clone(),
    ));

    let state = AppState {
        config: Arc::new(config),
        credentials,
        invites,
        pending,
        signer,
        sessions: sessions.clone(),
        hypervisor,
        shutdown: shutdown.clone(),
    };

    let listener = api_server::bind(bind_addr).await?;
    info!(%bind_addr, "listening");

    let router = broker::server::router(state.clone());
    let server_shutdown = shutdown.clone();
    let server_task = BrokerTask::spawn("http-gateway", async move {
        if let Err(e) = api_server::serve(router, listener, LayerConfig::default(), server_shutdown).await {
            tracing::error!("http gateway exited with error: {e:#}");
        }
    });

    let session_reaper = BrokerTask::spawn(
        "session-reaper",
        reap_sessions(sessions.clone(), shutdown.clone()),
    );
    let invite_reaper = BrokerTask::spawn(
        "invite-reaper",
        reap_invites(state.invites.clone(), shutdown.clone()),
    );

    tokio::spawn(wait_for_signal(shutdown.clone()));

    // No ephemeral tasks are registered through this channel today; the
    // sender is kept alive so the receiver never observes a spurious close.
    let (_eph_tx, eph_rx) = tokio::sync::mpsc::channel(1);

    common::task::try_join_tasks_and_shutdown(
        vec![server_task, session_reaper, invite_reaper],
        eph_rx,
        shutdown.clone(),
        SHUTDOWN_TIMEOUT,
    )
    .await?;

    sessions.stop_all().await;
    Ok(())
}

async fn wait_for_signal(shutdown: ShutdownChannel) {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    shutdown.send();
}

async fn reap_sessions(sessions: Arc<SessionManager>, shutdown: ShutdownChannel) {
    let mut ticker = tokio::time::interval(SESSION_REAP_INTERVAL);
    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            _ = ticker.tick() => {
                let reaped = sessions.reap_expired().await;
                if reaped > 0 {
                    info!(reaped, "session reaper swept expired sessions");
                }
            }
        }
    }
}

async fn reap_invites(invites: Arc<InviteStore>, shutdown: ShutdownChannel) {
    let mut ticker = tokio::time::interval(INVITE_REAP_INTERVAL);
    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            _ = ticker.tick() => {
                match invites.reap_expired().await {
                    Ok(reaped) if reaped > 0 => info!(reaped, "invite reaper swept expired invites"),
                    Ok(_) => {}
                    Err(e) => tracing::error!("invite reaper failed: {e:#}"),
                }
            }
        }
    }
}

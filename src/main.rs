//! PathLab binary entrypoint
//!
//! Wires together the proxy listener, the admin API and the receipt manager,
//! then runs until interrupted. Fatal listener or admin bind failures exit
//! non-zero; a signal-driven shutdown gives in-flight connections a bounded
//! grace window and exits zero.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};

use pathlab::admin::{self, AdminState};
use pathlab::config::Settings;
use pathlab::constants::{
    DEFAULT_READ_TIMEOUT_SECS, DEFAULT_WRITE_TIMEOUT_SECS, RECEIPT_RING_CAPACITY,
    SHUTDOWN_GRACE_SECS,
};
use pathlab::impair::ImpairState;
use pathlab::proxy::Engine;
use pathlab::receipts::ReceiptManager;
use pathlab::rules::SharedRules;
use pathlab::{keys, logging};

/// PathLab transparent impairment proxy
#[derive(Parser)]
#[command(name = "pathlab")]
#[command(about = "Transparent L4 proxy that reproduces handshake-phase network pathologies")]
struct Cli {
    /// TCP listen address for the proxy (clients connect here)
    #[arg(long, env = "PATHLAB_LISTEN", default_value = "0.0.0.0:10443")]
    listen: String,

    /// Upstream server address (host:port)
    #[arg(long, env = "PATHLAB_UPSTREAM", default_value = "127.0.0.1:8443")]
    upstream: String,

    /// Admin HTTP API address
    #[arg(long, env = "PATHLAB_ADMIN", default_value = "0.0.0.0:8080")]
    admin: String,

    /// I/O read timeout in seconds
    #[arg(long = "read-timeout", default_value_t = DEFAULT_READ_TIMEOUT_SECS)]
    read_timeout: u64,

    /// I/O write timeout in seconds
    #[arg(long = "write-timeout", default_value_t = DEFAULT_WRITE_TIMEOUT_SECS)]
    write_timeout: u64,

    /// Path to the Ed25519 seed file (created if missing)
    #[arg(long, env = "PATHLAB_KEYFILE", default_value = "pathlab-ed25519.key")]
    keyfile: PathBuf,

    /// Log level (trace|debug|info|warn|error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for daily-rolling log files (console only when unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init_logging(&cli.log_level, cli.log_dir.as_deref())?;

    let settings = Settings {
        listen: cli.listen,
        upstream: cli.upstream,
        admin: cli.admin,
        read_timeout: Duration::from_secs(cli.read_timeout),
        write_timeout: Duration::from_secs(cli.write_timeout),
        keyfile: cli.keyfile,
        receipt_capacity: RECEIPT_RING_CAPACITY,
    };

    let signing_key = keys::load_or_create(&settings.keyfile)?;
    let receipts = Arc::new(ReceiptManager::new(settings.receipt_capacity, signing_key));
    let impair = Arc::new(ImpairState::new());
    let rules = SharedRules::default();

    let listener = TcpListener::bind(&settings.listen)
        .await
        .with_context(|| format!("listen on {}", settings.listen))?;
    info!(
        listen = %settings.listen,
        upstream = %settings.upstream,
        admin = %settings.admin,
        pubkey = %receipts.public_key_hex(),
        "pathlab started"
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let admin_state = AdminState {
        impair: Arc::clone(&impair),
        rules: rules.clone(),
        receipts: Arc::clone(&receipts),
    };
    let mut admin_task = tokio::spawn(admin::serve(
        settings.admin.clone(),
        admin_state,
        shutdown_tx.subscribe(),
    ));

    let engine = Arc::new(Engine::new(settings, impair, rules, receipts));
    let mut proxy_task = tokio::spawn(Arc::clone(&engine).run(listener, shutdown_tx.subscribe()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        }
        joined = &mut proxy_task => {
            return flatten(joined, "proxy listener");
        }
        joined = &mut admin_task => {
            return flatten(joined, "admin server");
        }
    }

    // Give in-flight connections a bounded grace window before force-closing.
    let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
    let drained = tokio::time::timeout(grace, async {
        while engine.active_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            active = engine.active_connections(),
            "grace window elapsed, forcing close"
        );
    }
    let _ = proxy_task.await;
    let _ = admin_task.await;
    info!("pathlab stopped");
    Ok(())
}

/// A server task finishing on its own is fatal, whether it failed or not.
fn flatten(
    joined: Result<anyhow::Result<()>, tokio::task::JoinError>,
    what: &str,
) -> anyhow::Result<()> {
    match joined {
        Ok(Ok(())) => Err(anyhow::anyhow!("{what} exited unexpectedly")),
        Ok(Err(e)) => Err(e.context(format!("{what} failed"))),
        Err(e) => Err(anyhow::anyhow!("{what} task panicked: {e}")),
    }
}

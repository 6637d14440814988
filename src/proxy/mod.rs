//! Per-connection impairment engine
//!
//! State machine for one proxied connection:
//!
//! ```text
//! ACCEPT -> DIAL_UPSTREAM -> PEEK_HELLO -> SELECT_PROFILE -> SHAPE
//!        -> TEARDOWN -> EMIT_RECEIPT
//! ```
//!
//! The client's first flight is parsed through a buffered reader; the
//! handshake bytes plus anything else already buffered are replayed ahead of
//! the live socket into the selected shaping strategy. A hello parse failure
//! is logged and recorded on the receipt, and the connection falls through
//! to clean passthrough of whatever bytes remain under the global profile.

pub mod replay;
pub mod shaping;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use chrono::Utc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::config::Settings;
use crate::constants::DIAL_TIMEOUT_SECS;
use crate::impair::{ImpairState, Profile};
use crate::inspect::clienthello::parse_client_hello;
use crate::inspect::HelloResult;
use crate::receipts::{Receipt, ReceiptManager};
use crate::rules::SharedRules;

/// Shared connection engine: accepts clients, drives the per-connection
/// state machine, emits receipts.
pub struct Engine {
    settings: Settings,
    impair: Arc<ImpairState>,
    rules: SharedRules,
    receipts: Arc<ReceiptManager>,
    conn_counter: AtomicU64,
    active: AtomicUsize,
}

impl Engine {
    pub fn new(
        settings: Settings,
        impair: Arc<ImpairState>,
        rules: SharedRules,
        receipts: Arc<ReceiptManager>,
    ) -> Self {
        Self {
            settings,
            impair,
            rules,
            receipts,
            conn_counter: AtomicU64::new(0),
            active: AtomicUsize::new(0),
        }
    }

    /// Connections currently inside the state machine; consulted by the
    /// shutdown grace loop.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept loop. Runs until the shutdown channel fires; each connection
    /// gets its own task so a blocked connection never stalls another.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let engine = Arc::clone(&self);
                    engine.active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        if let Err(e) = engine.handle_connection(socket, peer).await {
                            warn!(client = %peer, error = %e, "connection aborted");
                        }
                        engine.active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                _ = shutdown.recv() => {
                    info!("proxy listener stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Drive one connection through the full state machine. Returns an error
    /// only for failures that precede shaping (upstream dial); those emit no
    /// receipt because the hello was never parsed.
    pub async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        // ACCEPT
        let conn_id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let global = self.impair.snapshot();

        // DIAL_UPSTREAM
        let upstream = timeout(
            Duration::from_secs(DIAL_TIMEOUT_SECS),
            TcpStream::connect(&self.settings.upstream),
        )
        .await
        .map_err(|_| anyhow::anyhow!("dial upstream {}: timed out", self.settings.upstream))?
        .with_context(|| format!("dial upstream {}", self.settings.upstream))?;
        let _ = client.set_nodelay(true);
        let _ = upstream.set_nodelay(true);

        // PEEK_HELLO under the initial read deadline. Whatever the buffered
        // reader pulled beyond the handshake is kept for replay.
        let mut raw = Vec::new();
        let mut hello = HelloResult::default();
        let mut parse_error = String::new();
        let leftover;
        {
            let mut reader = BufReader::new(&mut client);
            match timeout(self.settings.read_timeout, parse_client_hello(&mut reader)).await {
                Ok(Ok((bytes, res))) => {
                    raw = bytes;
                    hello = res;
                }
                Ok(Err(e)) => parse_error = e.to_string(),
                Err(_) => parse_error = "read clienthello: timed out".to_string(),
            }
            leftover = reader.buffer().to_vec();
        }

        // SELECT_PROFILE: rule hit overrides the profile only; all other
        // fields are inherited from the global snapshot.
        let mut applied = global.clone();
        let mut rule_matched = String::new();
        if parse_error.is_empty() {
            let ruleset = self
                .rules
                .read()
                .expect("ruleset lock poisoned")
                .clone();
            if let Some(profile) = ruleset.matches(&hello) {
                applied.profile = Profile::from_name(profile);
                rule_matched = profile.to_string();
                info!(
                    conn = conn_id,
                    profile = %applied.profile,
                    ch_bytes = hello.handshake_bytes,
                    pqc_hint = hello.pqc_hint,
                    "rule matched"
                );
            }
        } else {
            warn!(
                conn = conn_id,
                error = %parse_error,
                "clienthello parse failed, rules skipped"
            );
        }
        info!(
            conn = conn_id,
            client = %peer,
            upstream = %self.settings.upstream,
            profile = %applied.profile,
            "accepted"
        );

        // SHAPE. The handshake bytes go upstream exactly once, via the
        // strategy's prefix flush; a failed parse degrades to passthrough of
        // the surviving buffered bytes.
        let mut prefix = raw.clone();
        prefix.extend_from_slice(&leftover);
        let write_timeout = self.settings.write_timeout;
        let started = Instant::now();
        let shaped = if parse_error.is_empty() {
            match applied.profile {
                Profile::Clean => shaping::clean_passthrough(client, upstream, prefix).await,
                Profile::AbortAfterCh => {
                    shaping::abort_after_ch(client, upstream, prefix, write_timeout).await
                }
                Profile::MtuBlackhole => {
                    shaping::mtu_blackhole(client, upstream, &raw, &applied, write_timeout).await
                }
                Profile::LatencyJitter => {
                    shaping::latency_jitter(client, upstream, raw, leftover, &applied, write_timeout)
                        .await
                }
                Profile::BandwidthLimit => {
                    shaping::bandwidth_limit(client, upstream, prefix, &applied, write_timeout)
                        .await
                }
            }
        } else {
            shaping::clean_passthrough(client, upstream, prefix).await
        };

        // TEARDOWN: EOF is not an error.
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (outcome, error) = match shaped {
            Ok(()) => ("closed", parse_error),
            Err(e) => ("error", e.to_string()),
        };
        info!(conn = conn_id, outcome, elapsed_ms, "connection finished");

        // EMIT_RECEIPT
        let receipt = Receipt {
            conn_id,
            timestamp: Utc::now(),
            client_addr: peer.to_string(),
            upstream_addr: self.settings.upstream.clone(),
            applied_profile: applied.profile.as_str().to_string(),
            global_profile: global.profile.as_str().to_string(),
            rule_matched,
            handshake_bytes: hello.handshake_bytes,
            cipher_count: hello.cipher_suites,
            pqc_hint: hello.pqc_hint,
            sni: hello.sni,
            alpn: hello.alpn,
            ja3: hello.ja3,
            outcome: outcome.to_string(),
            error,
            hash: String::new(),
            sig: String::new(),
        };
        if let Err(e) = self.receipts.add(receipt) {
            warn!(conn = conn_id, error = %e, "receipt emission failed");
        }
        Ok(())
    }
}

//! End-to-end socket tests for the connection engine
//!
//! Each test spins up a throwaway upstream and a proxy engine on ephemeral
//! ports, drives a real client connection through a profile, and checks both
//! the wire behavior and the emitted receipt.

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Instant};

use pathlab::config::Settings;
use pathlab::impair::{ImpairConfig, ImpairState, Profile};
use pathlab::proxy::Engine;
use pathlab::receipts::{Receipt, ReceiptManager};
use pathlab::rules::SharedRules;

/// Minimal ClientHello with an SNI extension, optionally padded (via a
/// padding extension) so the full record is exactly `pad_to` bytes.
fn build_client_hello(sni: &str, pad_to: usize) -> Vec<u8> {
    let mut sni_list = Vec::new();
    sni_list.push(0u8);
    sni_list.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    sni_list.extend_from_slice(sni.as_bytes());
    let mut sni_body = Vec::new();
    sni_body.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
    sni_body.extend_from_slice(&sni_list);

    let mut exts = Vec::new();
    exts.extend_from_slice(&0x0000u16.to_be_bytes());
    exts.extend_from_slice(&(sni_body.len() as u16).to_be_bytes());
    exts.extend_from_slice(&sni_body);

    // Record total = 5 (record hdr) + 4 (handshake hdr) + 43 (fixed body)
    // + exts. Pad with a padding extension (type 21) to hit pad_to.
    let base_total = 5 + 4 + 43 + exts.len();
    if pad_to > base_total + 4 {
        let pad_body = pad_to - base_total - 4;
        exts.extend_from_slice(&0x0015u16.to_be_bytes());
        exts.extend_from_slice(&(pad_body as u16).to_be_bytes());
        exts.extend(std::iter::repeat(0u8).take(pad_body));
    }

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0x5A; 32]);
    body.push(0x00);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
    body.extend_from_slice(&exts);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Upstream that echoes everything back, per connection.
async fn start_echo_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("addr").to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if sock.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Upstream that records received byte counts on a channel and replies with
/// `ok` once `reply_after` bytes have arrived (never, if zero).
async fn start_recording_upstream(reply_after: usize) -> (String, mpsc::UnboundedReceiver<usize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("addr").to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut total = 0usize;
                let mut replied = false;
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            total += n;
                            let _ = tx.send(n);
                            if !replied && reply_after > 0 && total >= reply_after {
                                replied = true;
                                if sock.write_all(b"ok").await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            });
        }
    });
    (addr, rx)
}

struct Harness {
    addr: String,
    receipts: Arc<ReceiptManager>,
    rules: SharedRules,
    _shutdown: broadcast::Sender<()>,
}

async fn start_proxy(upstream: String, cfg: ImpairConfig) -> Harness {
    let impair = Arc::new(ImpairState::new());
    impair.apply(cfg);
    let rules = SharedRules::default();
    let receipts = Arc::new(ReceiptManager::new(64, SigningKey::from_bytes(&[1u8; 32])));

    let settings = Settings {
        upstream,
        read_timeout: Duration::from_secs(2),
        ..Settings::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("addr").to_string();
    let engine = Arc::new(Engine::new(
        settings,
        Arc::clone(&impair),
        rules.clone(),
        Arc::clone(&receipts),
    ));
    let (shutdown_tx, _) = broadcast::channel(1);
    tokio::spawn(engine.run(listener, shutdown_tx.subscribe()));

    Harness {
        addr,
        receipts,
        rules,
        _shutdown: shutdown_tx,
    }
}

async fn wait_receipt(receipts: &ReceiptManager, id: u64) -> Receipt {
    for _ in 0..200 {
        if let Ok(receipt) = receipts.get(id) {
            return receipt;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("receipt {id} never arrived");
}

#[tokio::test]
async fn test_clean_passthrough_round_trip() {
    let upstream = start_echo_upstream().await;
    let harness = start_proxy(upstream, ImpairConfig::default()).await;

    let hello = build_client_hello("echo.test", 0);
    let mut client = TcpStream::connect(&harness.addr).await.expect("connect");
    client.write_all(&hello).await.expect("write hello");

    // The proxy forwards the reassembled handshake bytes; TLS record
    // framing is not preserved.
    let forwarded = hello[5..].to_vec();
    let mut echoed = vec![0u8; forwarded.len()];
    timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
        .await
        .expect("echo deadline")
        .expect("echo read");
    assert_eq!(echoed, forwarded, "handshake must reach upstream byte-for-byte, once");

    client.shutdown().await.expect("shutdown");
    drop(client);

    let receipt = wait_receipt(&harness.receipts, 1).await;
    assert_eq!(receipt.outcome, "closed");
    assert_eq!(receipt.error, "");
    assert_eq!(receipt.applied_profile, "CLEAN");
    assert_eq!(receipt.global_profile, "CLEAN");
    assert_eq!(receipt.rule_matched, "");
    assert_eq!(receipt.sni, "echo.test");
    assert_eq!(receipt.cipher_count, 1);
    assert_eq!(receipt.handshake_bytes, forwarded.len());

    let v = harness.receipts.verify(&receipt);
    assert!(v.hash_ok && v.sig_ok);
}

#[tokio::test]
async fn test_abort_after_ch_fast_fail() {
    let (upstream, _rx) = start_recording_upstream(0).await;
    let harness = start_proxy(
        upstream,
        ImpairConfig {
            profile: Profile::AbortAfterCh,
            ..ImpairConfig::default()
        },
    )
    .await;

    let hello = build_client_hello("abort.test", 0);
    let mut client = TcpStream::connect(&harness.addr).await.expect("connect");
    client.write_all(&hello).await.expect("write hello");

    // The client must observe a close or reset well within 300ms.
    let mut buf = [0u8; 16];
    let observed = timeout(Duration::from_millis(300), client.read(&mut buf)).await;
    match observed {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("unexpected {n} bytes from aborted connection"),
        Err(_) => panic!("no close within 300ms"),
    }

    let receipt = wait_receipt(&harness.receipts, 1).await;
    assert_eq!(receipt.applied_profile, "ABORT_AFTER_CH");
    assert_eq!(receipt.outcome, "closed");
}

/// Upstream that acks with `a` once `first` bytes have arrived and with `b`
/// once `second` total bytes have arrived.
async fn start_two_phase_upstream(first: usize, second: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("addr").to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let mut total = 0usize;
                let mut acked = 0u8;
                loop {
                    match sock.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            total += n;
                            if acked == 0 && total >= first {
                                acked = 1;
                                if sock.write_all(b"a").await.is_err() {
                                    return;
                                }
                            }
                            if acked == 1 && total >= second {
                                acked = 2;
                                if sock.write_all(b"b").await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_bandwidth_limit_shapes_post_hello_bytes() {
    let hello = build_client_hello("bulk.test", 0);
    let handshake_len = hello.len() - 5;
    // The hello is flushed unthrottled; the second ack requires a further
    // 2048 payload bytes to squeeze through the bucket.
    let upstream = start_two_phase_upstream(handshake_len, handshake_len + 2048).await;
    let harness = start_proxy(
        upstream,
        ImpairConfig {
            profile: Profile::BandwidthLimit,
            bandwidth_kbps: 64, // 8 KB/s, 1.6 KB per refill
            ..ImpairConfig::default()
        },
    )
    .await;

    let mut client = TcpStream::connect(&harness.addr).await.expect("connect");
    client.write_all(&hello).await.expect("write hello");

    // Wait for the hello ack so the payload below can only travel through
    // the live throttled copy, never the replay prefix.
    let mut ack = [0u8; 1];
    timeout(Duration::from_secs(2), client.read_exact(&mut ack))
        .await
        .expect("hello ack deadline")
        .expect("hello ack");
    assert_eq!(&ack, b"a");

    let start = Instant::now();
    client.write_all(&[0x42; 2048]).await.expect("write payload");
    timeout(Duration::from_secs(3), client.read_exact(&mut ack))
        .await
        .expect("payload ack within 3s")
        .expect("payload ack");
    let elapsed = start.elapsed();
    assert_eq!(&ack, b"b");
    // 2048 bytes against a 1.6 KB bucket needs at least one 200 ms refill.
    assert!(
        elapsed >= Duration::from_millis(100),
        "bandwidth limit not applied; elapsed {elapsed:?}"
    );
}

#[tokio::test]
async fn test_mtu_blackhole_truncates_and_hangs() {
    let (upstream, mut rx) = start_recording_upstream(0).await;
    let harness = start_proxy(
        upstream,
        ImpairConfig {
            profile: Profile::MtuBlackhole,
            threshold_bytes: 100,
            blackhole_seconds: 1,
            ..ImpairConfig::default()
        },
    )
    .await;

    let hello = build_client_hello("hole.test", 300);
    let mut client = TcpStream::connect(&harness.addr).await.expect("connect");
    client.write_all(&hello).await.expect("write hello");
    // Bytes sent during the blackhole window are silently discarded.
    client.write_all(&[0xEE; 64]).await.expect("write extra");

    let mut forwarded = 0usize;
    let deadline = Instant::now() + Duration::from_millis(700);
    while let Ok(Some(n)) =
        timeout(deadline.saturating_duration_since(Instant::now()), rx.recv()).await
    {
        forwarded += n;
    }
    assert_eq!(forwarded, 100, "only the threshold prefix may be forwarded");

    // After the window elapses the proxy closes both sides.
    let mut buf = [0u8; 16];
    let closed = timeout(Duration::from_secs(3), client.read(&mut buf)).await;
    assert!(matches!(closed, Ok(Ok(0)) | Ok(Err(_))), "expected close");

    let receipt = wait_receipt(&harness.receipts, 1).await;
    assert_eq!(receipt.applied_profile, "MTU1300_BLACKHOLE");
    assert_eq!(receipt.outcome, "closed");
}

#[tokio::test]
async fn test_rule_override_and_receipt_fields() {
    let (upstream, _rx) = start_recording_upstream(0).await;
    let harness = start_proxy(upstream, ImpairConfig::default()).await;
    *harness.rules.write().expect("rules lock") = Arc::new(
        pathlab::rules::parse("when sni_contains example.com then ABORT_AFTER_CH")
            .expect("parse rules"),
    );

    let hello = build_client_hello("api.example.com", 0);
    let mut client = TcpStream::connect(&harness.addr).await.expect("connect");
    client.write_all(&hello).await.expect("write hello");

    let mut buf = [0u8; 16];
    let observed = timeout(Duration::from_millis(500), client.read(&mut buf)).await;
    assert!(matches!(observed, Ok(Ok(0)) | Ok(Err(_))), "expected abort");

    let receipt = wait_receipt(&harness.receipts, 1).await;
    assert_eq!(receipt.applied_profile, "ABORT_AFTER_CH");
    assert_eq!(receipt.global_profile, "CLEAN");
    assert_eq!(receipt.rule_matched, "ABORT_AFTER_CH");
    assert_eq!(receipt.sni, "api.example.com");
}

#[tokio::test]
async fn test_parse_failure_falls_back_to_clean() {
    let upstream = start_echo_upstream().await;
    let harness = start_proxy(upstream, ImpairConfig::default()).await;

    let mut client = TcpStream::connect(&harness.addr).await.expect("connect");
    // A complete non-handshake record: rejected by the inspector, consumed
    // from the stream.
    client
        .write_all(&[0x00, 0x00, 0x00, 0x00, 0x01, 0xFF])
        .await
        .expect("write garbage");
    // Later bytes still flow under clean passthrough.
    client.write_all(b"ping").await.expect("write ping");

    let mut echoed = [0u8; 4];
    timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
        .await
        .expect("echo deadline")
        .expect("echo read");
    assert_eq!(&echoed, b"ping");

    client.shutdown().await.expect("shutdown");
    let receipt = wait_receipt(&harness.receipts, 1).await;
    assert_eq!(receipt.outcome, "closed");
    assert!(
        receipt.error.contains("unexpected TLS content type"),
        "parse error must be recorded: {}",
        receipt.error
    );
    assert_eq!(receipt.handshake_bytes, 0);
    assert_eq!(receipt.rule_matched, "");
}

#[tokio::test]
async fn test_conn_ids_are_strictly_increasing() {
    let upstream = start_echo_upstream().await;
    let harness = start_proxy(upstream, ImpairConfig::default()).await;

    for expected in 1u64..=3 {
        let hello = build_client_hello("seq.test", 0);
        let mut client = TcpStream::connect(&harness.addr).await.expect("connect");
        client.write_all(&hello).await.expect("write hello");
        // Only the reassembled handshake (record header stripped) comes back.
        let mut echoed = vec![0u8; hello.len() - 5];
        timeout(Duration::from_secs(2), client.read_exact(&mut echoed))
            .await
            .expect("echo deadline")
            .expect("echo read");
        client.shutdown().await.expect("shutdown");
        drop(client);
        let receipt = wait_receipt(&harness.receipts, expected).await;
        assert_eq!(receipt.conn_id, expected);
    }
}

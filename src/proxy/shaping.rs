//! Traffic shaping strategies
//!
//! Each strategy owns both sockets for the rest of the connection. Bytes the
//! hello inspector already consumed are replayed ahead of the live client
//! stream, either through a [`PrependReader`] feeding the copy loop or as an
//! explicit first-flight write where the profile's semantics demand one. A
//! strategy returns `Ok` when the connection ended at EOF and `Err` for any
//! real I/O failure.

use std::io;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::debug;

use crate::constants::{
    ABORT_SETTLE_MS, BANDWIDTH_CHUNK_SIZE, BANDWIDTH_INTERVALS_PER_SEC,
    BANDWIDTH_REFILL_INTERVAL_MS, COPY_BUFFER_SIZE, DISCARD_BUFFER_SIZE,
};
use crate::impair::ImpairConfig;
use crate::proxy::replay::PrependReader;

/// Bidirectional passthrough. The replayed prefix reaches upstream ahead of
/// any live client bytes; the copy ends when either side reaches EOF or
/// fails.
pub async fn clean_passthrough(
    client: TcpStream,
    upstream: TcpStream,
    prefix: Vec<u8>,
) -> io::Result<()> {
    let (client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    let mut source = PrependReader::new(prefix, client_read);
    tokio::select! {
        res = tokio::io::copy(&mut source, &mut upstream_write) => res.map(|_| ()),
        res = tokio::io::copy(&mut upstream_read, &mut client_write) => res.map(|_| ()),
    }
}

/// Forward the first flight, give the upstream a moment to receive it, then
/// force-reset both sides. Zero linger makes the close send RST instead of a
/// graceful FIN where the platform honors it.
pub async fn abort_after_ch(
    client: TcpStream,
    mut upstream: TcpStream,
    prefix: Vec<u8>,
    write_timeout: Duration,
) -> io::Result<()> {
    flush_upstream(&mut upstream, &prefix, write_timeout).await?;
    sleep(Duration::from_millis(ABORT_SETTLE_MS)).await;
    let _ = client.set_linger(Some(Duration::ZERO));
    let _ = upstream.set_linger(Some(Duration::ZERO));
    // Dropping the streams closes them; with zero linger that is the reset.
    Ok(())
}

/// Forward only the first `threshold_bytes` of the hello, then read-and-drop
/// everything further from the client for the blackhole window while letting
/// upstream-to-client bytes flow. Bytes beyond the hello that were already
/// buffered are discarded outright.
pub async fn mtu_blackhole(
    client: TcpStream,
    mut upstream: TcpStream,
    hello: &[u8],
    cfg: &ImpairConfig,
    write_timeout: Duration,
) -> io::Result<()> {
    let threshold = cfg.threshold_bytes.min(hello.len());
    flush_upstream(&mut upstream, &hello[..threshold], write_timeout).await?;
    debug!(
        threshold,
        hello_len = hello.len(),
        "blackhole forwarded truncated hello"
    );

    let (mut client_read, mut client_write) = client.into_split();
    // The upstream write half stays open for the whole window; dropping it
    // early would send a FIN and cut the hang short.
    let (mut upstream_read, _upstream_write) = upstream.into_split();

    let discard = async {
        let mut buf = [0u8; DISCARD_BUFFER_SIZE];
        loop {
            match client_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };
    let downstream = async {
        let _ = tokio::io::copy(&mut upstream_read, &mut client_write).await;
    };

    tokio::select! {
        _ = sleep(Duration::from_secs(cfg.blackhole_seconds)) => {}
        _ = async { tokio::join!(discard, downstream); } => {}
    }
    Ok(())
}

/// Delay the hello by `latency ± jitter/2`, write it upstream, then copy
/// with an independent delay draw per client-to-upstream chunk. The
/// upstream-to-client direction flows unshaped.
pub async fn latency_jitter(
    client: TcpStream,
    mut upstream: TcpStream,
    hello: Vec<u8>,
    leftover: Vec<u8>,
    cfg: &ImpairConfig,
    write_timeout: Duration,
) -> io::Result<()> {
    sleep(jitter_delay(cfg.latency_ms, cfg.jitter_ms)).await;
    flush_upstream(&mut upstream, &hello, write_timeout).await?;

    let (client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();
    let mut source = PrependReader::new(leftover, client_read);
    let (latency_ms, jitter_ms) = (cfg.latency_ms, cfg.jitter_ms);

    let delayed_up = async {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Ok::<(), io::Error>(());
            }
            let delay = jitter_delay(latency_ms, jitter_ms);
            if !delay.is_zero() {
                sleep(delay).await;
            }
            upstream_write.write_all(&buf[..n]).await?;
        }
    };

    tokio::select! {
        res = delayed_up => res,
        res = tokio::io::copy(&mut upstream_read, &mut client_write) => res.map(|_| ()),
    }
}

/// Token-bucket throttle on the client-to-upstream direction. The first
/// flight goes upstream unthrottled; the bucket governs only bytes read
/// from the live socket afterward. Symmetric shaping on the return path
/// when `bandwidth_down_kbps` is set.
pub async fn bandwidth_limit(
    client: TcpStream,
    mut upstream: TcpStream,
    prefix: Vec<u8>,
    cfg: &ImpairConfig,
    write_timeout: Duration,
) -> io::Result<()> {
    flush_upstream(&mut upstream, &prefix, write_timeout).await?;

    let (client_read, mut client_write) = client.into_split();
    let (mut upstream_read, upstream_write) = upstream.into_split();

    let up = throttled_copy(client_read, upstream_write, cfg.bandwidth_kbps);

    if cfg.bandwidth_down_kbps > 0 {
        let down = throttled_copy(upstream_read, client_write, cfg.bandwidth_down_kbps);
        tokio::select! {
            res = up => res,
            res = down => res,
        }
    } else {
        tokio::select! {
            res = up => res,
            res = tokio::io::copy(&mut upstream_read, &mut client_write) => res.map(|_| ()),
        }
    }
}

/// Copy with a token bucket of `kbps * 125` bytes per second, refilled to
/// capacity on a fixed tick. A read larger than the remaining allowance is
/// written in fragments, awaiting a refill between them.
async fn throttled_copy<R, W>(mut reader: R, mut writer: W, kbps: u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let bytes_per_sec = (kbps as usize * 125).max(1);
    let chunk = BANDWIDTH_CHUNK_SIZE.min(bytes_per_sec);
    let bucket_cap = (bytes_per_sec / BANDWIDTH_INTERVALS_PER_SEC as usize).max(1);

    let mut ticker = interval(Duration::from_millis(BANDWIDTH_REFILL_INTERVAL_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Consume the immediate first tick so refills are evenly spaced.
    ticker.tick().await;

    let mut bucket = bucket_cap;
    let mut buf = vec![0u8; chunk];
    loop {
        if bucket == 0 {
            ticker.tick().await;
            bucket = bucket_cap;
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let mut sent = 0;
        while sent < n {
            if bucket == 0 {
                ticker.tick().await;
                bucket = bucket_cap;
            }
            let take = (n - sent).min(bucket);
            writer.write_all(&buf[sent..sent + take]).await?;
            bucket -= take;
            sent += take;
        }
    }
}

/// `latency ± jitter/2`, clamped at zero, one independent draw per call.
fn jitter_delay(latency_ms: u64, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(latency_ms);
    }
    // Draw before any await so the rng never crosses a suspension point.
    let draw = rand::thread_rng().gen_range(0..jitter_ms) as i64;
    let ms = latency_ms as i64 + draw - jitter_ms as i64 / 2;
    Duration::from_millis(ms.max(0) as u64)
}

async fn flush_upstream<W: AsyncWrite + Unpin>(
    writer: &mut W,
    first_flight: &[u8],
    write_timeout: Duration,
) -> io::Result<()> {
    if first_flight.is_empty() {
        return Ok(());
    }
    timeout(write_timeout, writer.write_all(first_flight))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write first flight to upstream"))?
}

//! Handshake-phase drill harness
//!
//! Exercises PathLab impairment scenarios from the client side. Workers open
//! concurrent TCP connections through the proxy, send a synthetic
//! ClientHello first flight, and wait for any server response. Each attempt
//! is classified as success, fast_fail (reset or early close), timeout or
//! other; the harness tracks an EWMA latency, simulates a circuit breaker
//! that opens after a run of consecutive fast-fails, and asserts scenario
//! expectations.
//!
//! Examples:
//!   drill --addr 127.0.0.1:10443 --attempts 100 --scenario fast-fail
//!   drill --addr 127.0.0.1:10443 --attempts 50 --scenario slow-timeout --timeout 3
//!
//! Before the fast-fail scenario:
//!   curl -XPOST 'http://localhost:8080/impair/apply?profile=ABORT_AFTER_CH'
//! Before the slow-timeout scenario:
//!   curl -XPOST 'http://localhost:8080/impair/apply?profile=MTU1300_BLACKHOLE'

use std::io;
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Expect resets: assert fast-fail median latency under the bound.
    FastFail,
    /// Expect hangs: assert the timeout rate meets the bound.
    SlowTimeout,
    /// No assertions, just the report.
    Mixed,
}

/// PathLab drill harness
#[derive(Parser)]
#[command(name = "drill")]
#[command(about = "Probe PathLab impairment behavior with synthetic first flights")]
struct Cli {
    /// Proxy address (host:port)
    #[arg(long, default_value = "127.0.0.1:10443")]
    addr: String,

    /// Total connection attempts
    #[arg(long, default_value_t = 100)]
    attempts: usize,

    /// Concurrent workers
    #[arg(long, default_value_t = 10)]
    concurrency: usize,

    /// Per-attempt timeout in seconds
    #[arg(long, default_value_t = 2)]
    timeout: u64,

    #[arg(long, value_enum, default_value_t = Scenario::FastFail)]
    scenario: Scenario,

    /// Simulated breaker opens after this many consecutive fast-fails
    #[arg(long = "open-after", default_value_t = 5)]
    open_after: usize,

    /// Assert fast-fail median latency below this bound (ms)
    #[arg(long = "max-fast-latency-ms", default_value_t = 200)]
    max_fast_latency_ms: u64,

    /// Assert at least this ratio of timeouts in the slow-timeout scenario
    #[arg(long = "expected-timeout-rate", default_value_t = 0.8)]
    expected_timeout_rate: f64,

    /// EWMA smoothing factor
    #[arg(long = "ewma-alpha", default_value_t = 0.2)]
    ewma_alpha: f64,

    /// server_name to advertise in the synthetic ClientHello
    #[arg(long, default_value = "drill.local")]
    sni: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
    Success,
    FastFail,
    Timeout,
    Other,
}

impl Class {
    fn label(self) -> &'static str {
        match self {
            Class::Success => "success",
            Class::FastFail => "fast_fail",
            Class::Timeout => "timeout",
            Class::Other => "other",
        }
    }
}

struct Ewma {
    alpha: f64,
    value: f64,
    set: bool,
}

impl Ewma {
    fn new(alpha: f64) -> Self {
        Self {
            alpha,
            value: 0.0,
            set: false,
        }
    }

    fn update(&mut self, v: f64) {
        if !self.set {
            self.value = v;
            self.set = true;
            return;
        }
        self.value = self.alpha * v + (1.0 - self.alpha) * self.value;
    }
}

struct Tally {
    results: Vec<(Class, Duration)>,
    ewma: Ewma,
    consecutive_fast_fails: usize,
    opened_at: Option<usize>,
}

/// Minimal TLS 1.2-style ClientHello advertising one suite and the given
/// server name, enough for the proxy's inspector to parse and match on.
fn build_client_hello(sni: &str) -> Vec<u8> {
    let mut ext_body = Vec::new();
    let mut list = Vec::new();
    list.push(0u8); // host_name
    list.extend_from_slice(&(sni.len() as u16).to_be_bytes());
    list.extend_from_slice(sni.as_bytes());
    ext_body.extend_from_slice(&(list.len() as u16).to_be_bytes());
    ext_body.extend_from_slice(&list);

    let mut exts = Vec::new();
    exts.extend_from_slice(&0x0000u16.to_be_bytes());
    exts.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
    exts.extend_from_slice(&ext_body);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]); // legacy_version
    body.extend_from_slice(&[0xAB; 32]); // random
    body.push(0x00); // session_id
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]); // TLS_AES_128_GCM_SHA256
    body.push(1); // compression methods
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

async fn attempt(addr: &str, hello: &[u8], deadline: Duration) -> (Class, Duration) {
    let start = Instant::now();
    let probe = async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(hello).await?;
        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "closed before any response",
            ));
        }
        Ok::<(), io::Error>(())
    };
    match timeout(deadline, probe).await {
        Ok(Ok(())) => (Class::Success, start.elapsed()),
        Ok(Err(e)) => {
            let class = match e.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => Class::FastFail,
                _ => Class::Other,
            };
            (class, start.elapsed())
        }
        Err(_) => (Class::Timeout, start.elapsed()),
    }
}

fn percentile(sorted_ms: &[u64], pct: f64) -> u64 {
    if sorted_ms.is_empty() {
        return 0;
    }
    let idx = ((sorted_ms.len() as f64 - 1.0) * pct).round() as usize;
    sorted_ms[idx.min(sorted_ms.len() - 1)]
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let hello = Arc::new(build_client_hello(&cli.sni));
    let deadline = Duration::from_secs(cli.timeout);
    let next = Arc::new(AtomicUsize::new(0));
    let tally = Arc::new(Mutex::new(Tally {
        results: Vec::with_capacity(cli.attempts),
        ewma: Ewma::new(cli.ewma_alpha),
        consecutive_fast_fails: 0,
        opened_at: None,
    }));

    let mut workers = Vec::new();
    for _ in 0..cli.concurrency.max(1) {
        let addr = cli.addr.clone();
        let hello = Arc::clone(&hello);
        let next = Arc::clone(&next);
        let tally = Arc::clone(&tally);
        let attempts = cli.attempts;
        let open_after = cli.open_after;
        workers.push(tokio::spawn(async move {
            loop {
                let my = next.fetch_add(1, Ordering::SeqCst);
                if my >= attempts {
                    return;
                }
                let (class, dur) = attempt(&addr, &hello, deadline).await;
                let mut t = tally.lock().expect("tally lock poisoned");
                t.results.push((class, dur));
                t.ewma.update(dur.as_secs_f64() * 1000.0);
                if class == Class::FastFail {
                    t.consecutive_fast_fails += 1;
                    if t.opened_at.is_none() && t.consecutive_fast_fails >= open_after {
                        t.opened_at = Some(my + 1);
                    }
                } else {
                    t.consecutive_fast_fails = 0;
                }
            }
        }));
    }
    for w in workers {
        let _ = w.await;
    }

    let t = tally.lock().expect("tally lock poisoned");
    let total = t.results.len().max(1);
    let count = |c: Class| t.results.iter().filter(|(class, _)| *class == c).count();
    let mut fast_ms: Vec<u64> = t
        .results
        .iter()
        .filter(|(class, _)| *class == Class::FastFail)
        .map(|(_, d)| d.as_millis() as u64)
        .collect();
    fast_ms.sort_unstable();

    println!("drill: {} attempts against {}", t.results.len(), cli.addr);
    for class in [Class::Success, Class::FastFail, Class::Timeout, Class::Other] {
        println!("  {:>9}: {}", class.label(), count(class));
    }
    println!("  ewma latency: {:.1}ms", t.ewma.value);
    if !fast_ms.is_empty() {
        println!(
            "  fast-fail median: {}ms p95: {}ms",
            percentile(&fast_ms, 0.5),
            percentile(&fast_ms, 0.95)
        );
    }
    match t.opened_at {
        Some(n) => println!("  breaker: would open at attempt {n}"),
        None => println!("  breaker: never opened"),
    }

    match cli.scenario {
        Scenario::FastFail => {
            let median = percentile(&fast_ms, 0.5);
            if fast_ms.is_empty() || median >= cli.max_fast_latency_ms {
                eprintln!(
                    "FAIL: fast-fail median {}ms (want < {}ms, {} fast-fails)",
                    median,
                    cli.max_fast_latency_ms,
                    fast_ms.len()
                );
                return ExitCode::FAILURE;
            }
        }
        Scenario::SlowTimeout => {
            let rate = count(Class::Timeout) as f64 / total as f64;
            if rate < cli.expected_timeout_rate {
                eprintln!(
                    "FAIL: timeout rate {:.2} (want >= {:.2})",
                    rate, cli.expected_timeout_rate
                );
                return ExitCode::FAILURE;
            }
        }
        Scenario::Mixed => {}
    }
    ExitCode::SUCCESS
}

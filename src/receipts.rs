//! Signed connection receipts
//!
//! Every completed connection yields a [`Receipt`] describing what was
//! inspected and which impairment was applied. The manager canonicalizes the
//! receipt to JSON with a fixed field order, hashes the canonical bytes with
//! SHA-256, signs the same bytes with the process Ed25519 key, keeps the
//! result in a bounded ring, and fans it out to live subscribers. A slow
//! subscriber loses receipts; it never backpressures `add`.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use futures::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;

/// One proxied connection's record.
///
/// Declaration order here is the canonical serialization order; reordering
/// fields breaks signature verification against previously issued receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub conn_id: u64,
    #[serde(with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,
    pub client_addr: String,
    pub upstream_addr: String,
    pub applied_profile: String,
    pub global_profile: String,
    /// Profile name of the matched rule, or empty if no rule matched.
    pub rule_matched: String,
    pub handshake_bytes: usize,
    pub cipher_count: usize,
    pub pqc_hint: bool,
    pub sni: String,
    pub alpn: Vec<String>,
    pub ja3: String,
    /// `closed` on clean teardown, `error` otherwise.
    pub outcome: String,
    pub error: String,
    /// Lowercase hex SHA-256 of the canonical bytes.
    pub hash: String,
    /// Lowercase hex Ed25519 signature over the same canonical bytes.
    pub sig: String,
}

impl Receipt {
    /// Canonical JSON bytes: fixed field order, `hash` and `sig` serialized
    /// as empty strings, RFC 3339 UTC timestamps with nanosecond precision,
    /// no pretty printing.
    pub fn canonical_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let mut stripped = self.clone();
        stripped.hash = String::new();
        stripped.sig = String::new();
        serde_json::to_vec(&stripped)
    }
}

/// RFC 3339 with exactly nine fractional digits and a `Z` suffix, so the
/// canonical byte sequence is identical across implementations.
mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("receipt {0} not found")]
    NotFound(u64),
    #[error("canonicalize receipt: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// Outcome of re-deriving a receipt's digest and signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub hash_ok: bool,
    pub sig_ok: bool,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Receipt>,
}

struct Shared {
    ring: VecDeque<Receipt>,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

/// Bounded ring of signed receipts plus live fan-out.
pub struct ReceiptManager {
    capacity: usize,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    shared: Arc<Mutex<Shared>>,
}

impl ReceiptManager {
    pub fn new(capacity: usize, signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            capacity: capacity.max(1),
            signing_key,
            verifying_key,
            shared: Arc::new(Mutex::new(Shared {
                ring: VecDeque::with_capacity(capacity.max(1)),
                subscribers: Vec::new(),
                next_subscriber_id: 1,
            })),
        }
    }

    /// Hex of the 32-byte Ed25519 public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    /// Sign and store a receipt, evicting the oldest entry on overflow, and
    /// publish it to every live subscriber. The caller's `conn_id` is kept
    /// verbatim. Returns the receipt as stored.
    pub fn add(&self, receipt: Receipt) -> Result<Receipt, ReceiptError> {
        let mut receipt = receipt;
        receipt.hash = String::new();
        receipt.sig = String::new();
        let canonical = receipt.canonical_bytes()?;
        receipt.hash = hex::encode(Sha256::digest(&canonical));
        receipt.sig = hex::encode(self.signing_key.sign(&canonical).to_bytes());

        let mut shared = self.shared.lock().expect("receipt ring lock poisoned");
        if shared.ring.len() == self.capacity {
            shared.ring.pop_front();
        }
        shared.ring.push_back(receipt.clone());
        // Non-blocking offer per subscriber: laggards lose this receipt,
        // closed subscribers are dropped from the set.
        shared.subscribers.retain(|sub| match sub.tx.try_send(receipt.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(receipt)
    }

    /// Fetch a resident receipt by connection id.
    pub fn get(&self, id: u64) -> Result<Receipt, ReceiptError> {
        let shared = self.shared.lock().expect("receipt ring lock poisoned");
        shared
            .ring
            .iter()
            .find(|r| r.conn_id == id)
            .cloned()
            .ok_or(ReceiptError::NotFound(id))
    }

    /// The most recent `limit` receipts in chronological order; zero returns
    /// all resident receipts.
    pub fn list(&self, limit: usize) -> Vec<Receipt> {
        let shared = self.shared.lock().expect("receipt ring lock poisoned");
        let resident = shared.ring.len();
        let n = if limit == 0 { resident } else { limit.min(resident) };
        shared.ring.iter().skip(resident - n).cloned().collect()
    }

    /// Recompute digest and signature from the stripped canonical bytes,
    /// trusting neither stored field.
    pub fn verify(&self, receipt: &Receipt) -> Verification {
        let Ok(canonical) = receipt.canonical_bytes() else {
            return Verification {
                hash_ok: false,
                sig_ok: false,
            };
        };
        let hash_ok = hex::encode(Sha256::digest(&canonical)) == receipt.hash;
        let sig_ok = hex::decode(&receipt.sig)
            .ok()
            .and_then(|bytes| Signature::from_slice(&bytes).ok())
            .is_some_and(|sig| self.verifying_key.verify(&canonical, &sig).is_ok());
        Verification { hash_ok, sig_ok }
    }

    /// Register a live subscriber. The stream yields every receipt added
    /// after this call; dropping it detaches the subscriber.
    pub fn subscribe(&self, buffer: usize) -> ReceiptStream {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut shared = self.shared.lock().expect("receipt ring lock poisoned");
        let id = shared.next_subscriber_id;
        shared.next_subscriber_id += 1;
        shared.subscribers.push(Subscriber { id, tx });
        ReceiptStream {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Live receipt subscription. Implements [`Stream`]; detaches on drop.
pub struct ReceiptStream {
    id: u64,
    rx: mpsc::Receiver<Receipt>,
    shared: Arc<Mutex<Shared>>,
}

impl ReceiptStream {
    /// Await the next published receipt.
    pub async fn recv(&mut self) -> Option<Receipt> {
        self.rx.recv().await
    }
}

impl Stream for ReceiptStream {
    type Item = Receipt;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Receipt>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ReceiptStream {
    fn drop(&mut self) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.subscribers.retain(|s| s.id != self.id);
        }
    }
}

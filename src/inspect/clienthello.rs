//! TLS ClientHello inspector
//!
//! Reassembles a complete ClientHello handshake message from one or more TLS
//! records read off the raw client stream, tolerating fragmentation, then
//! walks the message body for metadata: SNI, ALPN, cipher suite count, a
//! post-quantum key-share hint and the JA3 fingerprint. The walk is
//! best-effort: a truncated inner field stops deeper parsing but whatever was
//! already collected is still returned. Only a failure to assemble the outer
//! handshake message is fatal.

use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::{TLS_HANDSHAKE_HEADER_SIZE, TLS_MAX_RECORD_LEN, TLS_RECORD_HEADER_SIZE};
use crate::inspect::grease::is_grease;

/// Errors from ClientHello record reassembly.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Short read or EOF while a record was still incomplete.
    #[error("read TLS record: {0}")]
    RecordIo(#[from] std::io::Error),
    /// A non-handshake record arrived before the ClientHello completed.
    #[error("unexpected TLS content type 0x{0:02x}")]
    BadContentType(u8),
    /// Record length field of zero or beyond the TLS ceiling.
    #[error("invalid TLS record length {0}")]
    BadRecordLength(usize),
    /// First handshake message is not a ClientHello.
    #[error("not a ClientHello (type=0x{0:02x})")]
    NotClientHello(u8),
}

/// Parsed metadata from a ClientHello first flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelloResult {
    /// Total bytes of the handshake message, including its 4-byte header.
    pub handshake_bytes: usize,
    /// Total bytes of all TLS records spanned, including 5-byte record headers.
    pub records_bytes: usize,
    /// 24-bit length field from the handshake header.
    pub client_hello_len: usize,
    /// Byte pair 0x11 0xEC observed anywhere in the handshake bytes
    /// (heuristic for the X25519MLKEM768 hybrid group id).
    pub pqc_hint: bool,
    /// Lowercased host_name from the first server_name entry, or empty.
    pub sni: String,
    /// ALPN protocol tokens in advertised order.
    pub alpn: Vec<String>,
    /// Number of advertised cipher suites, GREASE included.
    pub cipher_suites: usize,
    /// Lowercase hex MD5 of the JA3 string, or empty if the extensions
    /// vector could not be located.
    pub ja3: String,
}

/// Read TLS records from `reader` until a full ClientHello handshake message
/// is assembled. Returns the raw handshake bytes alongside the extracted
/// metadata.
pub async fn parse_client_hello<R>(reader: &mut R) -> Result<(Vec<u8>, HelloResult), ParseError>
where
    R: AsyncRead + Unpin,
{
    let mut res = HelloResult::default();
    let mut buf: Vec<u8> = Vec::new();
    let mut records_bytes = 0usize;
    // Handshake bytes needed once the 4-byte header has been seen.
    let mut need: Option<usize> = None;

    loop {
        let mut hdr = [0u8; TLS_RECORD_HEADER_SIZE];
        reader.read_exact(&mut hdr).await?;
        let content_type = hdr[0];
        let length = usize::from(u16::from_be_bytes([hdr[3], hdr[4]]));
        if length == 0 || length > TLS_MAX_RECORD_LEN {
            return Err(ParseError::BadRecordLength(length));
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        records_bytes += TLS_RECORD_HEADER_SIZE + length;

        if content_type != 0x16 {
            return Err(ParseError::BadContentType(content_type));
        }
        buf.extend_from_slice(&body);

        if need.is_none() && buf.len() >= TLS_HANDSHAKE_HEADER_SIZE {
            if buf[0] != 0x01 {
                return Err(ParseError::NotClientHello(buf[0]));
            }
            let hl = usize::from(buf[1]) << 16 | usize::from(buf[2]) << 8 | usize::from(buf[3]);
            res.client_hello_len = hl;
            need = Some(hl + TLS_HANDSHAKE_HEADER_SIZE);
        }

        if let Some(n) = need {
            if buf.len() >= n {
                buf.truncate(n);
                break;
            }
        }
    }

    res.pqc_hint = buf.windows(2).any(|w| w == [0x11, 0xEC]);
    res.handshake_bytes = buf.len();
    res.records_bytes = records_bytes;
    inspect_body(&buf, &mut res);

    Ok((buf, res))
}

/// Best-effort walk of the ClientHello body. Bounds failures return early,
/// leaving the metadata collected so far in place.
fn inspect_body(raw: &[u8], res: &mut HelloResult) {
    if raw.len() < TLS_HANDSHAKE_HEADER_SIZE {
        return;
    }
    let body = &raw[TLS_HANDSHAKE_HEADER_SIZE..];

    // legacy_version (2) + random (32)
    if body.len() < 34 {
        return;
    }
    let legacy_version = u16::from_be_bytes([body[0], body[1]]);
    let mut off = 34usize;

    // session_id: u8 length + bytes
    let Some(&sid_len) = body.get(off) else {
        return;
    };
    let sid_len = usize::from(sid_len);
    if body.len() < off + 1 + sid_len {
        return;
    }
    off += 1 + sid_len;

    // cipher_suites: u16 length + bytes, length must be even
    let Some(cs_len) = read_u16(body, off) else {
        return;
    };
    let cs_len = usize::from(cs_len);
    off += 2;
    if cs_len % 2 != 0 || body.len() < off + cs_len {
        return;
    }
    let cipher_start = off;
    res.cipher_suites = cs_len / 2;
    off += cs_len;

    // compression_methods: u8 length + bytes
    let Some(&comp_len) = body.get(off) else {
        return;
    };
    let comp_len = usize::from(comp_len);
    if body.len() < off + 1 + comp_len {
        return;
    }
    off += 1 + comp_len;

    // extensions: u16 length + bytes
    let Some(ext_len) = read_u16(body, off) else {
        return;
    };
    let ext_len = usize::from(ext_len);
    off += 2;
    if body.len() < off + ext_len {
        return;
    }
    let ext_end = off + ext_len;

    let mut ja3_ciphers: Vec<String> = Vec::new();
    for pair in body[cipher_start..cipher_start + cs_len].chunks_exact(2) {
        let val = u16::from_be_bytes([pair[0], pair[1]]);
        if !is_grease(val) {
            ja3_ciphers.push(val.to_string());
        }
    }

    let mut ja3_exts: Vec<String> = Vec::new();
    let mut ja3_groups: Vec<String> = Vec::new();
    let mut ja3_points: Vec<String> = Vec::new();

    while off + 4 <= ext_end {
        let etype = u16::from_be_bytes([body[off], body[off + 1]]);
        let elen = usize::from(u16::from_be_bytes([body[off + 2], body[off + 3]]));
        off += 4;
        if off + elen > ext_end {
            break;
        }
        let edata = &body[off..off + elen];
        match etype {
            0x0000 => parse_server_name(edata, res),
            0x0010 => parse_alpn(edata, res),
            0x000A => parse_supported_groups(edata, &mut ja3_groups),
            0x000B => parse_point_formats(edata, &mut ja3_points),
            _ => {}
        }
        if !is_grease(etype) {
            ja3_exts.push(etype.to_string());
        }
        off += elen;
    }

    // version,ciphers,extensions,groups,points — decimal, dash-joined
    let ja3_str = format!(
        "{},{},{},{},{}",
        legacy_version,
        ja3_ciphers.join("-"),
        ja3_exts.join("-"),
        ja3_groups.join("-"),
        ja3_points.join("-")
    );
    let mut hasher = Md5::new();
    hasher.update(ja3_str.as_bytes());
    res.ja3 = format!("{:x}", hasher.finalize());
}

/// server_name extension: take the first host_name entry, lowercased.
fn parse_server_name(edata: &[u8], res: &mut HelloResult) {
    let Some(list_len) = read_u16(edata, 0) else {
        return;
    };
    let list_len = usize::from(list_len);
    if list_len + 2 > edata.len() {
        return;
    }
    let mut p = 2usize;
    while p + 3 <= 2 + list_len {
        let name_type = edata[p];
        let Some(name_len) = read_u16(edata, p + 1) else {
            return;
        };
        let name_len = usize::from(name_len);
        p += 3;
        if p + name_len > edata.len() {
            return;
        }
        if name_type == 0 {
            res.sni = String::from_utf8_lossy(&edata[p..p + name_len]).to_lowercase();
            return;
        }
        p += name_len;
    }
}

/// ALPN extension: collect protocol tokens in order, skipping empty entries.
fn parse_alpn(edata: &[u8], res: &mut HelloResult) {
    let Some(list_len) = read_u16(edata, 0) else {
        return;
    };
    let list_len = usize::from(list_len);
    if list_len + 2 > edata.len() {
        return;
    }
    let mut p = 2usize;
    while p < 2 + list_len && p < edata.len() {
        let l = usize::from(edata[p]);
        p += 1;
        if p + l > edata.len() {
            return;
        }
        if l > 0 {
            res.alpn
                .push(String::from_utf8_lossy(&edata[p..p + l]).into_owned());
        }
        p += l;
    }
}

/// supported_groups extension: collect non-GREASE group ids for JA3.
fn parse_supported_groups(edata: &[u8], groups: &mut Vec<String>) {
    let Some(glen) = read_u16(edata, 0) else {
        return;
    };
    let glen = usize::from(glen);
    if glen + 2 > edata.len() || glen % 2 != 0 {
        return;
    }
    for pair in edata[2..2 + glen].chunks_exact(2) {
        let gid = u16::from_be_bytes([pair[0], pair[1]]);
        if !is_grease(gid) {
            groups.push(gid.to_string());
        }
    }
}

/// ec_point_formats extension: collect format bytes for JA3.
fn parse_point_formats(edata: &[u8], points: &mut Vec<String>) {
    let Some(&plen) = edata.first() else {
        return;
    };
    let plen = usize::from(plen);
    if plen + 1 > edata.len() {
        return;
    }
    for b in &edata[1..1 + plen] {
        points.push(b.to_string());
    }
}

fn read_u16(b: &[u8], off: usize) -> Option<u16> {
    let hi = *b.get(off)?;
    let lo = *b.get(off + 1)?;
    Some(u16::from_be_bytes([hi, lo]))
}

//! Rule DSL for per-connection profile selection
//!
//! One rule per non-blank, non-`#` line, evaluated first-match-wins against
//! the parsed ClientHello metadata:
//!
//! ```text
//! when ch_bytes > 1400 then MTU1300_BLACKHOLE
//! when pqc_hint == true then ABORT_AFTER_CH
//! when cipher_count >= 30 then BANDWIDTH_1MBPS
//! when sni_contains example.com then LATENCY_50MS_JITTER_10
//! when alpn_contains h2 then LATENCY_50MS_JITTER_10
//! when ja3 == 0123456789abcdef0123456789abcdef then ABORT_AFTER_CH
//! ```
//!
//! Keywords and field names are case-insensitive. Numeric values are decimal
//! or `0x`-prefixed even-length hex. `sni_contains` is a case-insensitive
//! substring match; `alpn_contains` is a case-insensitive exact token match.

use thiserror::Error;

use crate::inspect::HelloResult;

type Predicate = Box<dyn Fn(&HelloResult) -> bool + Send + Sync>;

/// A compiled rule: the preserved source line, a pure predicate over
/// [`HelloResult`], and the uppercased profile name it selects.
pub struct Rule {
    pub raw: String,
    predicate: Predicate,
    pub profile: String,
}

impl Rule {
    /// Evaluate this rule's predicate.
    pub fn matches(&self, res: &HelloResult) -> bool {
        (self.predicate)(res)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("raw", &self.raw)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// Ordered rule list. An empty set never matches.
#[derive(Debug, Default)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
}

/// Process-wide ruleset handle. The inner `Arc` is swapped wholesale on
/// load; readers clone it once per connection and evaluate against that
/// snapshot.
pub type SharedRules = std::sync::Arc<std::sync::RwLock<std::sync::Arc<RuleSet>>>;

impl RuleSet {
    /// Return the profile of the first matching rule.
    pub fn matches(&self, res: &HelloResult) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.matches(res))
            .map(|r| r.profile.as_str())
    }
}

/// Rule parse failure, pinned to its 1-based source line.
#[derive(Debug, Error)]
#[error("line {line}: {kind}")]
pub struct RuleError {
    pub line: usize,
    pub kind: RuleErrorKind,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleErrorKind {
    #[error("missing 'when'")]
    MissingWhen,
    #[error("missing 'then'")]
    MissingThen,
    #[error("invalid condition format")]
    BadCondition,
    #[error("invalid profile")]
    EmptyProfile,
    #[error("unsupported field {0}")]
    UnknownField(String),
    #[error("unsupported operator {0}")]
    BadOperator(String),
    #[error("bad integer {0}")]
    BadInt(String),
    #[error("bad boolean {0}")]
    BadBool(String),
    #[error("expected 32 hex chars for ja3")]
    BadJa3,
    #[error("empty substring")]
    EmptySubstring,
}

/// Parse a full ruleset. Any bad line rejects the whole input.
pub fn parse(input: &str) -> Result<RuleSet, RuleError> {
    let mut rules = Vec::new();
    for (idx, raw_line) in input.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let rule = parse_line(line).map_err(|kind| RuleError {
            line: idx + 1,
            kind,
        })?;
        rules.push(rule);
    }
    Ok(RuleSet { rules })
}

fn parse_line(line: &str) -> Result<Rule, RuleErrorKind> {
    let lower = line.to_lowercase();
    let rest = lower
        .strip_prefix("when ")
        .ok_or(RuleErrorKind::MissingWhen)?;
    let (cond, action) = rest
        .split_once(" then ")
        .ok_or(RuleErrorKind::MissingThen)?;
    let action = action.trim();
    if action.is_empty() {
        return Err(RuleErrorKind::EmptyProfile);
    }
    let profile = action.to_uppercase();

    let fields: Vec<&str> = cond.split_whitespace().collect();
    let (field, op, val) = match fields.as_slice() {
        [field, op, val] => (*field, *op, *val),
        // Two-token substring form: sni_contains / alpn_contains.
        [field, val] => (*field, "contains", *val),
        _ => return Err(RuleErrorKind::BadCondition),
    };

    let predicate: Predicate = match field {
        "ch_bytes" => {
            let n = parse_int(val)?;
            numeric_predicate(op, n, |r: &HelloResult| r.handshake_bytes)?
        }
        "cipher_count" => {
            let n = parse_int(val)?;
            numeric_predicate(op, n, |r: &HelloResult| r.cipher_suites)?
        }
        "pqc_hint" => {
            if op != "==" {
                return Err(RuleErrorKind::BadOperator(op.to_string()));
            }
            let want = match val {
                "true" => true,
                "false" => false,
                other => return Err(RuleErrorKind::BadBool(other.to_string())),
            };
            Box::new(move |r: &HelloResult| r.pqc_hint == want)
        }
        "ja3" => {
            if op != "==" {
                return Err(RuleErrorKind::BadOperator(op.to_string()));
            }
            if val.len() != 32 || !val.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
            {
                return Err(RuleErrorKind::BadJa3);
            }
            let want = val.to_string();
            Box::new(move |r: &HelloResult| r.ja3 == want)
        }
        "sni_contains" => {
            if val.is_empty() {
                return Err(RuleErrorKind::EmptySubstring);
            }
            // The line was lowercased, so the needle is too.
            let needle = val.to_string();
            Box::new(move |r: &HelloResult| {
                !r.sni.is_empty() && r.sni.to_lowercase().contains(&needle)
            })
        }
        "alpn_contains" => {
            if val.is_empty() {
                return Err(RuleErrorKind::EmptySubstring);
            }
            let needle = val.to_string();
            Box::new(move |r: &HelloResult| {
                r.alpn.iter().any(|p| p.eq_ignore_ascii_case(&needle))
            })
        }
        other => return Err(RuleErrorKind::UnknownField(other.to_string())),
    };

    Ok(Rule {
        raw: line.to_string(),
        predicate,
        profile,
    })
}

fn numeric_predicate<F>(op: &str, n: usize, get: F) -> Result<Predicate, RuleErrorKind>
where
    F: Fn(&HelloResult) -> usize + Send + Sync + 'static,
{
    let cmp: fn(usize, usize) -> bool = match op {
        ">" => |a, b| a > b,
        ">=" => |a, b| a >= b,
        "<" => |a, b| a < b,
        "<=" => |a, b| a <= b,
        "==" => |a, b| a == b,
        _ => return Err(RuleErrorKind::BadOperator(op.to_string())),
    };
    Ok(Box::new(move |r| cmp(get(r), n)))
}

/// Decimal, or `0x`-prefixed hex accumulated MSB-first. Hex must have an
/// even number of digits.
fn parse_int(val: &str) -> Result<usize, RuleErrorKind> {
    if let Some(hex_digits) = val.strip_prefix("0x") {
        let bytes =
            hex::decode(hex_digits).map_err(|_| RuleErrorKind::BadInt(val.to_string()))?;
        if bytes.is_empty() {
            return Err(RuleErrorKind::BadInt(val.to_string()));
        }
        Ok(bytes.iter().fold(0usize, |acc, b| acc * 256 + usize::from(*b)))
    } else {
        val.parse()
            .map_err(|_| RuleErrorKind::BadInt(val.to_string()))
    }
}

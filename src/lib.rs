//! PathLab transparent impairment proxy library
//!
//! PathLab sits between a TLS client and its upstream as a plain L4 proxy,
//! inspects the first flight (TLS ClientHello, optionally QUIC Initial
//! metadata via the admin API), and deforms the connection according to an
//! impairment profile selected globally or per-connection through a small
//! rule DSL. Every completed connection produces an Ed25519-signed receipt.

pub mod admin;
pub mod config;
pub mod constants;
pub mod impair;
pub mod inspect;
pub mod keys;
pub mod logging;
pub mod proxy;
pub mod receipts;
pub mod rules;

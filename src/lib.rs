//! Kerberos network authentication for Rust.
//!
//! This crate implements the core of the Kerberos protocol (RFC 4120) on both
//! sides of the wire:
//!
//! * a client state machine that acquires and caches ticket-granting tickets,
//!   requests service tickets (including S4U2Self/S4U2Proxy constrained
//!   delegation), renews tickets nearing expiry, and changes passwords
//!   (RFC 3244);
//! * a KDC request pipeline with pluggable pre-authentication mechanisms
//!   (encrypted timestamp, PKINIT, PA-FOR-USER) behind a staged
//!   decode/validate/execute state machine;
//! * a transport layer with ordered failover across UDP, TCP, and an HTTPS
//!   KDC proxy (MS-KKDCP), DNS SRV endpoint discovery, and a bounded TCP
//!   connection pool.
//!
//! Wire structures are encoded and decoded with `picky-asn1-der` using the
//! message definitions from `picky-krb`; this crate owns everything above the
//! codec.

#[macro_use]
extern crate tracing;

pub mod cache;
pub mod client;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod flags;
pub mod kdc;
pub mod pkinit;
pub mod principal;
pub mod s4u;
pub mod secret;
pub mod transport;

pub use crate::errors::{Error, ErrorClass, ErrorKind, KrbErrorCode, Result};
pub use crate::secret::Secret;

/// Protocol version number carried in the `pvno` field of every message.
pub const KERBEROS_VERSION: u8 = 0x05;

/// First component of the ticket-granting service principal name.
pub const TGT_SERVICE_NAME: &str = "krbtgt";

/// IANA-assigned port of the ticket-granting service.
pub const DEFAULT_KDC_PORT: u16 = 88;

/// Port of the change-password service (RFC 3244).
pub const DEFAULT_KPASSWD_PORT: u16 = 464;

pub(crate) const KADMIN: &str = "kadmin";
pub(crate) const CHANGE_PASSWORD_SERVICE_NAME: &str = "changepw";

/// Pre-authentication type of PA-FOR-USER (S4U2Self), DER-encoded as the
/// two-byte unsigned INTEGER 129 ([MS-SFU] 2.2.1).
pub(crate) const PA_FOR_USER_TYPE: [u8; 2] = [0x00, 0x81];

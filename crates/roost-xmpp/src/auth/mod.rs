//! SASL authentication.
//!
//! Only SASL PLAIN (RFC 4616) is offered. Credentials are checked against a
//! single configured admin secret, or accepted unconditionally in bypass
//! mode.

pub mod plain;

use std::fmt;

pub use plain::{decode_plain, PlainCredentials};

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    /// PLAIN mechanism (RFC 4616)
    Plain,
}

impl SaslMechanism {
    /// Parse a mechanism name string into a SaslMechanism.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PLAIN" => Some(SaslMechanism::Plain),
            _ => None,
        }
    }
}

impl fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaslMechanism::Plain => write!(f, "PLAIN"),
        }
    }
}

/// How `Authenticate` decides.
#[derive(Clone)]
pub enum AuthPolicy {
    /// Every credential is accepted.
    Bypass,
    /// The password must equal the admin secret. Devices share this secret,
    /// so the username is not compared.
    AdminSecret(String),
}

impl AuthPolicy {
    /// Check a username/password pair. Fails closed on mismatch.
    pub fn check(&self, _username: &str, password: &str) -> bool {
        match self {
            AuthPolicy::Bypass => true,
            AuthPolicy::AdminSecret(secret) => {
                !secret.is_empty() && constant_time_eq(secret.as_bytes(), password.as_bytes())
            }
        }
    }
}

impl fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPolicy::Bypass => write!(f, "Bypass"),
            AuthPolicy::AdminSecret(_) => write!(f, "AdminSecret(****)"),
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

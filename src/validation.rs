use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::types::SocksProxy;

/// A full 40 hex character OpenPGP fingerprint, normalized to uppercase.
///
/// Construction always goes through [`Fingerprint::parse`], so a value of
/// this type is known to match `^[0-9A-F]{40}$`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Normalizes and validates `input`.
    ///
    /// Whitespace anywhere in the input is removed, so fingerprints written
    /// in groups of four (`ABCD 1234 ...`) are accepted.
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let normalized = normalize_fingerprint(input);

        if normalized.is_empty() {
            return Err(ParseError::InvalidFingerprint {
                input: input.to_string(),
                reason: "fingerprint cannot be empty".to_string(),
            });
        }

        if !normalized.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ParseError::InvalidFingerprint {
                input: input.to_string(),
                reason: "fingerprint must contain only hexadecimal characters".to_string(),
            });
        }

        if normalized.len() != 40 {
            return Err(ParseError::InvalidFingerprint {
                input: input.to_string(),
                reason: format!(
                    "fingerprint must be 40 hex characters (got {})",
                    normalized.len()
                ),
            });
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The `0x`-prefixed long key ID (last 16 hex characters).
    pub fn to_keyid(&self) -> String {
        format!("0x{}", &self.0[24..])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

impl std::str::FromStr for Fingerprint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Strips all whitespace and uppercases. Idempotent.
pub fn normalize_fingerprint(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase()
}

/// Trims a keyserver address and prefixes `hkp://` when it has no scheme.
pub fn normalize_keyserver(input: &str) -> Result<String, ParseError> {
    let trimmed = input.trim();

    if trimmed.is_empty() {
        return Err(ParseError::InvalidKeyserver {
            input: input.to_string(),
            reason: "keyserver cannot be empty".to_string(),
        });
    }

    if trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ParseError::InvalidKeyserver {
            input: input.to_string(),
            reason: "keyserver must not contain whitespace".to_string(),
        });
    }

    if trimmed.contains("://") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("hkp://{trimmed}"))
    }
}

/// Validates a SOCKS5 proxy host and port.
pub fn validate_proxy(host: &str, port: u16) -> Result<SocksProxy, ParseError> {
    let host = host.trim();

    if host.is_empty() {
        return Err(ParseError::InvalidProxy("host cannot be empty".to_string()));
    }

    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'))
    {
        return Err(ParseError::InvalidProxy(format!(
            "host '{host}' contains invalid characters"
        )));
    }

    if port == 0 {
        return Err(ParseError::InvalidProxy(
            "port must be between 1 and 65535".to_string(),
        ));
    }

    Ok(SocksProxy {
        host: host.to_string(),
        port,
    })
}

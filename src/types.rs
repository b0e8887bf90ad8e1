use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::endpoint::EndpointId;

/// A GPG key as reported by `gpg --with-colons`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    pub fingerprint: String,
    pub uid: String,
    pub created: Option<NaiveDate>,
    pub expires: Option<NaiveDate>,
    pub validity: KeyValidity,
    pub key_type: KeyType,
}

/// The cryptographic algorithm and key size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyType {
    pub algorithm: String,
    pub bits: u32,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.algorithm.to_lowercase(), self.bits)
    }
}

/// GPG key validity level.
///
/// Values correspond to GPG's validity field in `--with-colons` output.
/// Informational only: signer expiry and revocation are taken from the
/// verification status, not from this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[non_exhaustive]
pub enum KeyValidity {
    #[default]
    Unknown,
    Undefined,
    Never,
    Marginal,
    Full,
    Ultimate,
    Expired,
    Revoked,
}

impl KeyValidity {
    pub fn from_gpg_char(c: char) -> Self {
        match c {
            'o' => Self::Unknown,
            'q' => Self::Undefined,
            'n' => Self::Never,
            'm' => Self::Marginal,
            'f' => Self::Full,
            'u' => Self::Ultimate,
            'e' => Self::Expired,
            'r' => Self::Revoked,
            _ => Self::Unknown,
        }
    }
}

/// Proxy settings as stored on an endpoint.
///
/// The host and port are kept even while disabled so that toggling the
/// proxy back on does not lose them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 9050,
        }
    }
}

/// A validated SOCKS5 proxy that all traffic for an endpoint must use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocksProxy {
    pub host: String,
    pub port: u16,
}

impl SocksProxy {
    /// Proxy URL for the HTTP client. `socks5h` so hostnames are resolved
    /// by the proxy rather than leaking through local DNS.
    pub fn url(&self) -> String {
        format!("socks5h://{}:{}", self.host, self.port)
    }
}

/// Stages of a single sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VerifierState {
    /// Reported once when a run begins, before any request is made.
    Idle,
    FetchingKeylist,
    VerifyingKeylistSignature,
    ParsingFingerprints,
    FetchingMemberKeys,
    Done,
    Failed,
}

impl fmt::Display for VerifierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::FetchingKeylist => "fetching keylist",
            Self::VerifyingKeylistSignature => "verifying keylist signature",
            Self::ParsingFingerprints => "parsing fingerprints",
            Self::FetchingMemberKeys => "fetching member keys",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress updates emitted by a running verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerifyProgress {
    State(VerifierState),
    MemberKey {
        current: usize,
        total: usize,
        fingerprint: String,
    },
}

/// Coarse run state reported to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RunState {
    Started,
    Progress(VerifierState),
    Succeeded,
    Failed,
    Cancelled,
    /// The run was skipped because the network is unavailable.
    Deferred,
}

/// A status update for one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub endpoint_id: EndpointId,
    pub state: RunState,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(endpoint_id: EndpointId, state: RunState, message: impl Into<String>) -> Self {
        Self {
            endpoint_id,
            state,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

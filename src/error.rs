use std::io;

/// Errors from setting up the engine and managing endpoints.
///
/// Failures of an individual sync run are not reported through this type;
/// a run always completes with a [`VerificationResult`].
///
/// [`VerificationResult`]: crate::VerificationResult
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("command execution failed: {0}")]
    Command(#[from] io::Error),

    #[error("gpg exited with status {status}: {stderr}")]
    Gpg { status: i32, stderr: String },

    #[error("GnuPG 2.x is not available")]
    ToolUnavailable,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),

    #[error("endpoint already exists for authority {0}")]
    DuplicateEndpoint(String),

    #[error("the authority fingerprint of a saved endpoint cannot be changed")]
    FingerprintImmutable,

    #[error("endpoint verification failed: {0}")]
    VerificationFailed(String),

    #[error("a sync is already running for endpoint {0}")]
    SyncInProgress(String),

    #[error("endpoint {0} was changed by another edit")]
    EditConflict(String),

    #[error("failed to persist endpoints: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Transport failures while retrieving a URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed")]
    ConnectionFailed,

    #[error("server responded with HTTP {0}")]
    HttpStatus(u16),

    #[error("response exceeded {limit} bytes")]
    TooLarge { limit: usize },

    #[error("could not connect through the SOCKS5 proxy")]
    ProxyUnreachable,

    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
}

/// Cryptographic trust failures on a detached signature.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum VerifyError {
    #[error("signature is not valid")]
    SignatureInvalid,

    #[error("signed by {actual}, expected {expected}")]
    SignerMismatch { expected: String, actual: String },

    #[error("signing key is not in the keyring")]
    SignerKeyUnknown,

    #[error("signing key has expired")]
    SignerKeyExpired,

    #[error("signing key has been revoked")]
    SignerKeyRevoked,

    #[error("gpg exited with status {status}: {stderr}")]
    Gpg { status: i32, stderr: String },
}

/// Failure to fetch or import a single key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ImportError {
    #[error("key fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("keyserver returned a key that is not {requested}")]
    FingerprintMismatch { requested: String },

    #[error("no key material returned")]
    NoKeyMaterial,

    #[error("key {0} is not in the local key cache")]
    NotCached(String),

    #[error("gpg exited with status {status}: {stderr}")]
    Gpg { status: i32, stderr: String },

    #[error("i/o error: {0}")]
    Io(String),
}

impl From<io::Error> for ImportError {
    fn from(err: io::Error) -> Self {
        ImportError::Io(err.to_string())
    }
}

/// Malformed user or keylist input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid fingerprint '{input}': {reason}")]
    InvalidFingerprint { input: String, reason: String },

    #[error("invalid keyserver '{input}': {reason}")]
    InvalidKeyserver { input: String, reason: String },

    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
}

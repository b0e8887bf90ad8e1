//! One sync pass for a single endpoint.
//!
//! ```text
//! Idle -> FetchingKeylist -> VerifyingKeylistSignature -> ParsingFingerprints
//!      -> FetchingMemberKeys -> Done | Failed
//! ```
//!
//! The keylist is never parsed before its detached signature has been
//! verified and attributed to the endpoint's authority key. Failures up to
//! and including that step fail the run; failures after it (malformed
//! lines, individual member keys) are recorded and the run still succeeds.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{StreamExt, future, stream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crypto::Crypto;
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::{FetchError, ImportError, ParseError, VerifyError};
use crate::fetch::Fetch;
use crate::keylist::{RejectedLine, parse_keylist};
use crate::types::{SocksProxy, VerifierState, VerifyProgress};
use crate::validation::Fingerprint;

/// Options for a [`Verifier`].
#[derive(Debug, Clone)]
pub struct VerifierOptions {
    /// Timeout for each individual network request.
    pub fetch_timeout: Duration,
    /// Wall-clock budget for a whole run.
    pub run_timeout: Duration,
    /// Member keys fetched and imported concurrently.
    pub max_parallel_imports: usize,
}

impl Default for VerifierOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(600),
            max_parallel_imports: 4,
        }
    }
}

/// Which of the two keylist resources a fetch failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTarget {
    Keylist,
    Signature,
}

impl fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keylist => f.write_str("keylist"),
            Self::Signature => f.write_str("signature"),
        }
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RunFailure {
    #[error("fetching {target} failed: {error}")]
    Fetch { target: FetchTarget, error: FetchError },

    #[error("keylist verification failed: {0}")]
    Verify(VerifyError),

    #[error("run timed out")]
    Timeout,

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(ParseError),
}

impl RunFailure {
    fn fetch(target: FetchTarget, error: FetchError) -> Self {
        match error {
            FetchError::Timeout => Self::Timeout,
            error => Self::Fetch { target, error },
        }
    }

    /// A fixed, user-facing description of the failure kind.
    pub fn classification(&self) -> String {
        match self {
            Self::Fetch { target, error } => match error {
                FetchError::Timeout => format!("Timed out fetching the {target}"),
                FetchError::ConnectionFailed => format!("Could not connect to the {target} server"),
                FetchError::HttpStatus(code) => format!("The {target} server responded with HTTP {code}"),
                FetchError::TooLarge { .. } => format!("The {target} is too large"),
                FetchError::ProxyUnreachable => "Could not connect through the SOCKS5 proxy".to_string(),
                FetchError::InvalidUrl(_) => format!("The {target} URL is invalid"),
            },
            Self::Verify(error) => match error {
                VerifyError::SignatureInvalid => "The keylist signature is not valid".to_string(),
                VerifyError::SignerMismatch { .. } => {
                    "The keylist was not signed by the authority key".to_string()
                }
                VerifyError::SignerKeyUnknown => "The authority key could not be found".to_string(),
                VerifyError::SignerKeyExpired => "The authority key has expired".to_string(),
                VerifyError::SignerKeyRevoked => "The authority key has been revoked".to_string(),
                VerifyError::Gpg { .. } => "GnuPG failed to verify the keylist signature".to_string(),
            },
            Self::Timeout => "Timed out while syncing".to_string(),
            Self::Cancelled => "Sync was cancelled".to_string(),
            Self::InvalidEndpoint(_) => "The endpoint configuration is invalid".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(RunFailure),
}

/// The outcome of one run.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub endpoint_id: EndpointId,
    /// The authority and URL the run was performed against.
    pub authority_fingerprint: Fingerprint,
    pub keylist_url: String,
    pub outcome: Outcome,
    pub imported: BTreeSet<Fingerprint>,
    pub failed: BTreeMap<Fingerprint, ImportError>,
    pub rejected_lines: Vec<RejectedLine>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl VerificationResult {
    pub fn new(endpoint: &Endpoint) -> Self {
        let now = Utc::now();
        Self {
            endpoint_id: endpoint.id(),
            authority_fingerprint: endpoint.authority_fingerprint().clone(),
            keylist_url: endpoint.keylist_url().to_string(),
            outcome: Outcome::Success,
            imported: BTreeSet::new(),
            failed: BTreeMap::new(),
            rejected_lines: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == Outcome::Failure(RunFailure::Cancelled)
    }

    pub fn failure(&self) -> Option<&RunFailure> {
        match &self.outcome {
            Outcome::Success => None,
            Outcome::Failure(failure) => Some(failure),
        }
    }

    /// Non-fatal problems: rejected keylist lines plus failed member keys.
    pub fn error_count(&self) -> usize {
        self.rejected_lines.len() + self.failed.len()
    }

    pub fn status_message(&self) -> String {
        match &self.outcome {
            Outcome::Failure(failure) => failure.classification(),
            Outcome::Success => {
                let mut msg = format!("Synced {} keys", self.imported.len());
                if !self.failed.is_empty() {
                    msg.push_str(&format!(", {} failed", self.failed.len()));
                }
                if !self.rejected_lines.is_empty() {
                    msg.push_str(&format!(
                        ", {} invalid keylist lines skipped",
                        self.rejected_lines.len()
                    ));
                }
                msg
            }
        }
    }
}

/// Runs sync passes using a [`Crypto`] engine and a [`Fetch`] transport.
pub struct Verifier {
    crypto: Arc<dyn Crypto>,
    fetcher: Arc<dyn Fetch>,
    options: VerifierOptions,
}

impl Verifier {
    pub fn new(crypto: Arc<dyn Crypto>, fetcher: Arc<dyn Fetch>) -> Self {
        Self::with_options(crypto, fetcher, VerifierOptions::default())
    }

    pub fn with_options(
        crypto: Arc<dyn Crypto>,
        fetcher: Arc<dyn Fetch>,
        options: VerifierOptions,
    ) -> Self {
        Self {
            crypto,
            fetcher,
            options,
        }
    }

    pub fn crypto(&self) -> &Arc<dyn Crypto> {
        &self.crypto
    }

    /// Performs one sync pass for `endpoint`.
    ///
    /// Cancelling `cancel` stops the run as soon as possible and the run
    /// reports [`RunFailure::Cancelled`]. In-flight member key downloads are
    /// abandoned. Imports that have already reached the keyring are allowed
    /// to finish and are recorded, so nothing is imported without appearing
    /// in the result.
    pub async fn run<F>(
        &self,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
        progress: F,
    ) -> VerificationResult
    where
        F: Fn(VerifyProgress) + Send + Sync,
    {
        let mut result = VerificationResult::new(endpoint);
        let deadline = Instant::now() + self.options.run_timeout;
        info!(endpoint = %endpoint.id(), url = endpoint.keylist_url(), "starting sync");
        progress(VerifyProgress::State(VerifierState::Idle));

        let outcome = self
            .run_inner(endpoint, &mut result, cancel, deadline, &progress)
            .await;

        result.finished_at = Utc::now();
        match outcome {
            Ok(()) => {
                progress(VerifyProgress::State(VerifierState::Done));
                info!(
                    endpoint = %endpoint.id(),
                    imported = result.imported.len(),
                    failed = result.failed.len(),
                    rejected = result.rejected_lines.len(),
                    "sync finished"
                );
            }
            Err(failure) => {
                progress(VerifyProgress::State(VerifierState::Failed));
                warn!(endpoint = %endpoint.id(), %failure, "sync failed");
                result.outcome = Outcome::Failure(failure);
            }
        }
        result
    }

    async fn run_inner<F>(
        &self,
        endpoint: &Endpoint,
        result: &mut VerificationResult,
        cancel: &CancellationToken,
        deadline: Instant,
        progress: &F,
    ) -> Result<(), RunFailure>
    where
        F: Fn(VerifyProgress) + Send + Sync,
    {
        let proxy = endpoint.socks_proxy().map_err(RunFailure::InvalidEndpoint)?;
        let proxy = proxy.as_ref();

        progress(VerifyProgress::State(VerifierState::FetchingKeylist));
        let signature_url = endpoint.signature_url();
        let (keylist, signature) = guard(cancel, deadline, async {
            tokio::try_join!(
                self.fetch(endpoint.keylist_url(), proxy, FetchTarget::Keylist),
                self.fetch(&signature_url, proxy, FetchTarget::Signature),
            )
        })
        .await?;

        progress(VerifyProgress::State(VerifierState::VerifyingKeylistSignature));
        guard(
            cancel,
            deadline,
            self.verify_keylist(endpoint, &keylist, &signature, proxy),
        )
        .await?;

        progress(VerifyProgress::State(VerifierState::ParsingFingerprints));
        let parsed = parse_keylist(&keylist);
        debug!(
            endpoint = %endpoint.id(),
            fingerprints = parsed.len(),
            rejected = parsed.rejected.len(),
            "parsed keylist"
        );
        result.rejected_lines = parsed.rejected;

        progress(VerifyProgress::State(VerifierState::FetchingMemberKeys));
        let total = parsed.fingerprints.len();
        let crypto = self.crypto.as_ref();
        let fetcher = self.fetcher.as_ref();
        let keyserver = endpoint.keyserver();
        let timeout = self.options.fetch_timeout;

        let mut imports = stream::iter(parsed.fingerprints)
            .take_while(|_| future::ready(!cancel.is_cancelled() && Instant::now() < deadline))
            .map(|fp| async move {
                let timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
                let material = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (fp, None),
                    material = crypto.fetch_key_from_keyserver(fetcher, &fp, keyserver, proxy, timeout) => material,
                };
                let imported = match material {
                    Ok(material) => crypto.import_key_material(&material, &fp).await,
                    Err(error) => Err(error),
                };
                (fp, Some(imported))
            })
            .buffer_unordered(self.options.max_parallel_imports.max(1));

        let mut current = 0;
        while let Some((fp, imported)) = imports.next().await {
            let Some(imported) = imported else {
                debug!(fingerprint = %fp, "member key download abandoned");
                continue;
            };
            current += 1;
            progress(VerifyProgress::MemberKey {
                current,
                total,
                fingerprint: fp.to_string(),
            });
            match imported {
                Ok(key) => {
                    debug!(fingerprint = %fp, uid = %key.uid, "imported member key");
                    result.imported.insert(fp);
                }
                Err(error) => {
                    warn!(fingerprint = %fp, %error, "member key import failed");
                    result.failed.insert(fp, error);
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(RunFailure::Cancelled);
        }
        if current < total || Instant::now() >= deadline {
            return Err(RunFailure::Timeout);
        }

        Ok(())
    }

    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&SocksProxy>,
        target: FetchTarget,
    ) -> Result<Vec<u8>, RunFailure> {
        self.fetcher
            .fetch(url, proxy, self.options.fetch_timeout)
            .await
            .map_err(|error| RunFailure::fetch(target, error))
    }

    /// Verifies the keylist signature, bootstrapping the authority key
    /// from the local cache or the keyserver if it is not yet known.
    async fn verify_keylist(
        &self,
        endpoint: &Endpoint,
        keylist: &[u8],
        signature: &[u8],
        proxy: Option<&SocksProxy>,
    ) -> Result<(), RunFailure> {
        let authority = endpoint.authority_fingerprint();

        match self
            .crypto
            .verify_detached_signature(keylist, signature, authority)
            .await
        {
            Err(VerifyError::SignerKeyUnknown) => {}
            other => return other.map_err(RunFailure::Verify),
        }

        info!(fingerprint = %authority, "authority key not in keyring, fetching it");
        if let Err(cached) = self.crypto.import_key(authority).await {
            debug!(fingerprint = %authority, error = %cached, "authority key not cached");
            self.crypto
                .import_key_from_keyserver(
                    self.fetcher.as_ref(),
                    authority,
                    endpoint.keyserver(),
                    proxy,
                    self.options.fetch_timeout,
                )
                .await
                .map_err(|error| {
                    warn!(fingerprint = %authority, %error, "could not fetch authority key");
                    RunFailure::Verify(VerifyError::SignerKeyUnknown)
                })?;
        }

        self.crypto
            .verify_detached_signature(keylist, signature, authority)
            .await
            .map_err(RunFailure::Verify)
    }
}

/// Races `fut` against cancellation and the run deadline.
async fn guard<T>(
    cancel: &CancellationToken,
    deadline: Instant,
    fut: impl Future<Output = Result<T, RunFailure>>,
) -> Result<T, RunFailure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RunFailure::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Err(RunFailure::Timeout),
        res = fut => res,
    }
}

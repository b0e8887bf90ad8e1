//! The OpenPGP capability the sync engine depends on.
//!
//! [`Crypto`] is deliberately narrow: it covers only what a sync run needs
//! from an OpenPGP engine. [`Gpg`](crate::Gpg) implements it on top of the
//! `gpg` binary.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, warn};

use crate::error::{FetchError, ImportError, VerifyError};
use crate::fetch::Fetch;
use crate::types::SocksProxy;
use crate::validation::Fingerprint;

const HKP_PORT: u16 = 11371;

/// A key that is now present in the keyring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedKey {
    pub fingerprint: Fingerprint,
    pub uid: String,
}

#[async_trait]
pub trait Crypto: Send + Sync {
    /// Whether a supported OpenPGP engine is installed.
    async fn is_available(&self) -> bool;

    /// Imports a previously saved copy of `fingerprint` from local storage.
    async fn import_key(&self, fingerprint: &Fingerprint) -> Result<ImportedKey, ImportError>;

    /// Saves the keyring's copy of `fingerprint` to local storage so that
    /// [`Crypto::import_key`] can restore it later.
    async fn save_key(&self, _fingerprint: &Fingerprint) -> Result<(), ImportError> {
        Ok(())
    }

    async fn export_key(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>, ImportError>;

    /// Verifies `signature` over exactly `data`, and that it was made by
    /// the key with fingerprint `expected_signer`.
    async fn verify_detached_signature(
        &self,
        data: &[u8],
        signature: &[u8],
        expected_signer: &Fingerprint,
    ) -> Result<(), VerifyError>;

    /// True if `key_material` contains exactly one key and its fingerprint
    /// is `expected`.
    async fn fingerprint_matches(&self, key_material: &[u8], expected: &Fingerprint) -> bool;

    /// Imports `key_material`, which must be the key `expected`.
    async fn import_key_material(
        &self,
        key_material: &[u8],
        expected: &Fingerprint,
    ) -> Result<ImportedKey, ImportError>;

    /// Best-effort display name for a key. Empty if unknown.
    async fn get_uid(&self, fingerprint: &Fingerprint) -> String;

    /// Fetches `fingerprint` from an HKP keyserver without importing it.
    ///
    /// The request honours `proxy` exactly as keylist fetches do. The
    /// fetched material is rejected unless it is the requested key and
    /// nothing else. Nothing is written, so the returned future may be
    /// dropped at any point.
    async fn fetch_key_from_keyserver(
        &self,
        fetcher: &dyn Fetch,
        fingerprint: &Fingerprint,
        keyserver: &str,
        proxy: Option<&SocksProxy>,
        timeout: Duration,
    ) -> Result<Vec<u8>, ImportError> {
        let url = keyserver_lookup_url(keyserver, fingerprint)?;
        debug!(%fingerprint, %url, "fetching key from keyserver");

        let material = fetcher.fetch(&url, proxy, timeout).await?;
        if material.iter().all(u8::is_ascii_whitespace) {
            return Err(ImportError::NoKeyMaterial);
        }

        if !self.fingerprint_matches(&material, fingerprint).await {
            warn!(%fingerprint, "keyserver returned a different key than requested");
            return Err(ImportError::FingerprintMismatch {
                requested: fingerprint.to_string(),
            });
        }

        Ok(material)
    }

    /// Fetches `fingerprint` from an HKP keyserver and imports it.
    async fn import_key_from_keyserver(
        &self,
        fetcher: &dyn Fetch,
        fingerprint: &Fingerprint,
        keyserver: &str,
        proxy: Option<&SocksProxy>,
        timeout: Duration,
    ) -> Result<ImportedKey, ImportError> {
        let material = self
            .fetch_key_from_keyserver(fetcher, fingerprint, keyserver, proxy, timeout)
            .await?;
        self.import_key_material(&material, fingerprint).await
    }
}

/// Builds the HKP `op=get` URL for `fingerprint` on `keyserver`.
///
/// `hkp://` maps to plain HTTP on port 11371 and `hkps://` to HTTPS on 443
/// unless a port is given. `http://` and `https://` keyservers are used as-is.
pub fn keyserver_lookup_url(keyserver: &str, fingerprint: &Fingerprint) -> Result<String, FetchError> {
    let invalid = || FetchError::InvalidUrl(keyserver.to_string());
    let parsed = Url::parse(keyserver).map_err(|_| invalid())?;
    let host = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;

    let (scheme, port) = match parsed.scheme() {
        "hkp" => ("http", parsed.port().unwrap_or(HKP_PORT)),
        "hkps" => ("https", parsed.port().unwrap_or(443)),
        "http" => ("http", parsed.port_or_known_default().unwrap_or(80)),
        "https" => ("https", parsed.port_or_known_default().unwrap_or(443)),
        _ => return Err(invalid()),
    };

    Ok(format!(
        "{scheme}://{host}:{port}/pks/lookup?op=get&options=mr&search=0x{fingerprint}"
    ))
}

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, ParseError, Result};
use crate::fetch::parse_http_url;
use crate::types::{ProxyConfig, SocksProxy};
use crate::validation::{Fingerprint, normalize_keyserver, validate_proxy};
use crate::verifier::VerificationResult;

const DEFAULT_KEYSERVER: &str = "hkps://keys.openpgp.org";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(Uuid);

impl EndpointId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A remote authority whose signed keylist is kept in sync.
///
/// Identity fields are validated on construction, including when loaded
/// from storage. Bookkeeping fields are only changed by recording a
/// finished [`VerificationResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EndpointRecord")]
pub struct Endpoint {
    id: EndpointId,
    authority_fingerprint: Fingerprint,
    keylist_url: String,
    keyserver: String,
    proxy: Option<ProxyConfig>,
    last_checked: Option<DateTime<Utc>>,
    last_synced: Option<DateTime<Utc>>,
    last_failed: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// An endpoint as stored, before validation.
#[derive(Deserialize)]
struct EndpointRecord {
    id: EndpointId,
    authority_fingerprint: String,
    keylist_url: String,
    #[serde(default)]
    keyserver: String,
    #[serde(default)]
    proxy: Option<ProxyConfig>,
    #[serde(default)]
    last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    last_synced: Option<DateTime<Utc>>,
    #[serde(default)]
    last_failed: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error: Option<String>,
}

impl TryFrom<EndpointRecord> for Endpoint {
    type Error = ParseError;

    fn try_from(record: EndpointRecord) -> std::result::Result<Self, ParseError> {
        let mut endpoint = Self::validated(
            record.id,
            &record.authority_fingerprint,
            &record.keylist_url,
            &record.keyserver,
            record.proxy,
        )?;
        endpoint.last_checked = record.last_checked;
        endpoint.last_synced = record.last_synced;
        endpoint.last_failed = record.last_failed;
        endpoint.last_error = record.last_error;
        Ok(endpoint)
    }
}

impl Endpoint {
    /// Validates and normalizes user input into a new endpoint.
    ///
    /// An empty `keyserver` selects the default keyserver.
    pub fn new(
        authority_fingerprint: &str,
        keylist_url: &str,
        keyserver: &str,
        proxy: Option<ProxyConfig>,
    ) -> std::result::Result<Self, ParseError> {
        Self::validated(EndpointId::new(), authority_fingerprint, keylist_url, keyserver, proxy)
    }

    fn validated(
        id: EndpointId,
        authority_fingerprint: &str,
        keylist_url: &str,
        keyserver: &str,
        proxy: Option<ProxyConfig>,
    ) -> std::result::Result<Self, ParseError> {
        let keyserver = if keyserver.trim().is_empty() {
            DEFAULT_KEYSERVER.to_string()
        } else {
            normalize_keyserver(keyserver)?
        };

        let endpoint = Self {
            id,
            authority_fingerprint: Fingerprint::parse(authority_fingerprint)?,
            keylist_url: validate_keylist_url(keylist_url)?,
            keyserver,
            proxy,
            last_checked: None,
            last_synced: None,
            last_failed: None,
            last_error: None,
        };
        endpoint.socks_proxy()?;
        Ok(endpoint)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn authority_fingerprint(&self) -> &Fingerprint {
        &self.authority_fingerprint
    }

    pub fn keylist_url(&self) -> &str {
        &self.keylist_url
    }

    /// Always the keylist URL with `.sig` appended.
    pub fn signature_url(&self) -> String {
        format!("{}.sig", self.keylist_url)
    }

    pub fn keyserver(&self) -> &str {
        &self.keyserver
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// The proxy all traffic for this endpoint must use, if enabled.
    pub fn socks_proxy(&self) -> std::result::Result<Option<SocksProxy>, ParseError> {
        match &self.proxy {
            Some(proxy) if proxy.enabled => validate_proxy(&proxy.host, proxy.port).map(Some),
            _ => Ok(None),
        }
    }

    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        self.last_checked
    }

    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        self.last_synced
    }

    pub fn last_failed(&self) -> Option<DateTime<Utc>> {
        self.last_failed
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Short human-readable status for display.
    pub fn status(&self) -> String {
        if let Some(error) = &self.last_error {
            return format!("Error: {error}");
        }
        match self.last_synced {
            Some(at) => format!("Synced {}", at.format("%Y-%m-%d %H:%M UTC")),
            None => "Never synced".to_string(),
        }
    }

    /// Updates bookkeeping from a finished run. Cancelled runs leave the
    /// endpoint untouched. Returns whether anything changed.
    pub fn record(&mut self, result: &VerificationResult) -> bool {
        if result.is_cancelled() {
            return false;
        }

        self.last_checked = Some(result.finished_at);
        if result.is_success() {
            self.last_synced = Some(result.finished_at);
            self.last_error = None;
        } else {
            self.last_failed = Some(result.finished_at);
            self.last_error = result.failure().map(|f| f.classification());
        }
        true
    }

    /// Applies `edit`, returning the edited copy and whether the change
    /// requires a fresh verification before it may be saved.
    pub fn apply_edit(&self, edit: &EndpointEdit) -> Result<(Endpoint, bool)> {
        let mut updated = self.clone();
        let mut needs_verify = false;

        if let Some(fp) = &edit.authority_fingerprint
            && Fingerprint::parse(fp)? != self.authority_fingerprint
        {
            return Err(Error::FingerprintImmutable);
        }

        if let Some(url) = &edit.keylist_url {
            let url = validate_keylist_url(url)?;
            if url != self.keylist_url {
                updated.keylist_url = url;
                needs_verify = true;
            }
        }

        if let Some(keyserver) = &edit.keyserver {
            updated.keyserver = normalize_keyserver(keyserver)?;
        }

        if let Some(proxy) = &edit.proxy {
            updated.proxy = proxy.clone();
            updated.socks_proxy()?;
        }

        Ok((updated, needs_verify))
    }
}

fn validate_keylist_url(url: &str) -> std::result::Result<String, ParseError> {
    let url = url.trim();
    parse_http_url(url).map_err(|_| ParseError::InvalidUrl(url.to_string()))?;
    Ok(url.to_string())
}

/// A user edit to an existing endpoint. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct EndpointEdit {
    pub authority_fingerprint: Option<String>,
    pub keylist_url: Option<String>,
    pub keyserver: Option<String>,
    pub proxy: Option<Option<ProxyConfig>>,
}

/// Load/save boundary for the owner of the endpoint settings.
pub trait Persistence: Send + Sync {
    fn load(&self) -> Result<Vec<Endpoint>>;
    fn save(&self, endpoints: &[Endpoint]) -> Result<()>;
}

/// An immutable view of all endpoints at one version.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    version: u64,
    endpoints: Vec<Endpoint>,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| e.id == id)
    }
}

/// The collection of configured endpoints.
///
/// Readers get an `Arc<Snapshot>` that never changes under them. Writers
/// build a new snapshot, persist it, then swap it in, so a reader sees
/// either the old or the new record but never a partial one. A write that
/// changes nothing is neither persisted nor versioned.
pub struct EndpointStore {
    current: RwLock<Arc<Snapshot>>,
    persistence: Option<Box<dyn Persistence>>,
}

impl Default for EndpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointStore {
    /// An in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            persistence: None,
        }
    }

    /// A store loaded from, and saved back to, `persistence`.
    pub fn with_persistence(persistence: Box<dyn Persistence>) -> Result<Self> {
        let endpoints = persistence.load()?;
        debug!(count = endpoints.len(), "loaded endpoints");
        Ok(Self {
            current: RwLock::new(Arc::new(Snapshot {
                version: 0,
                endpoints,
            })),
            persistence: Some(persistence),
        })
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn get(&self, id: EndpointId) -> Option<Endpoint> {
        self.snapshot().get(id).cloned()
    }

    pub fn insert(&self, endpoint: Endpoint) -> Result<()> {
        self.update(|endpoints| {
            if endpoints
                .iter()
                .any(|e| e.authority_fingerprint == endpoint.authority_fingerprint)
            {
                return Err(Error::DuplicateEndpoint(
                    endpoint.authority_fingerprint.to_string(),
                ));
            }
            info!(endpoint = %endpoint.id, fingerprint = %endpoint.authority_fingerprint, "adding endpoint");
            endpoints.push(endpoint);
            Ok(())
        })
    }

    /// Replaces the endpoint with the same id.
    pub fn replace(&self, endpoint: Endpoint) -> Result<()> {
        self.update(|endpoints| {
            let slot = endpoints
                .iter_mut()
                .find(|e| e.id == endpoint.id)
                .ok_or_else(|| Error::UnknownEndpoint(endpoint.id.to_string()))?;
            *slot = endpoint;
            Ok(())
        })
    }

    /// Rewrites the endpoint `id` from its current version.
    ///
    /// `f` runs under the store's write lock and sees the record as of this
    /// write, so bookkeeping recorded by a concurrent run is kept.
    pub fn edit(
        &self,
        id: EndpointId,
        f: impl FnOnce(&Endpoint) -> Result<Endpoint>,
    ) -> Result<Endpoint> {
        self.update(|endpoints| {
            let slot = endpoints
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| Error::UnknownEndpoint(id.to_string()))?;
            let mut updated = f(slot)?;
            updated.id = id;
            *slot = updated.clone();
            Ok(updated)
        })
    }

    pub fn remove(&self, id: EndpointId) -> Result<Endpoint> {
        self.update(|endpoints| {
            let idx = endpoints
                .iter()
                .position(|e| e.id == id)
                .ok_or_else(|| Error::UnknownEndpoint(id.to_string()))?;
            info!(endpoint = %id, "deleting endpoint");
            Ok(endpoints.remove(idx))
        })
    }

    /// Records a finished run against the current version of its endpoint.
    ///
    /// Nothing is written if the endpoint was deleted, or its authority or
    /// keylist URL was edited, while the run was in flight. Returns whether
    /// the result was applied.
    pub fn record_result(&self, result: &VerificationResult) -> Result<bool> {
        if result.is_cancelled() {
            return Ok(false);
        }

        self.update(|endpoints| {
            let Some(endpoint) = endpoints.iter_mut().find(|e| e.id == result.endpoint_id) else {
                debug!(endpoint = %result.endpoint_id, "endpoint deleted during run");
                return Ok(false);
            };
            if endpoint.authority_fingerprint != result.authority_fingerprint
                || endpoint.keylist_url != result.keylist_url
            {
                debug!(endpoint = %result.endpoint_id, "endpoint edited during run, discarding result");
                return Ok(false);
            }
            Ok(endpoint.record(result))
        })
    }

    fn update<T>(&self, f: impl FnOnce(&mut Vec<Endpoint>) -> Result<T>) -> Result<T> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut endpoints = current.endpoints.clone();
        let value = f(&mut endpoints)?;
        if endpoints == current.endpoints {
            return Ok(value);
        }

        if let Some(persistence) = &self.persistence {
            persistence.save(&endpoints)?;
        }

        *current = Arc::new(Snapshot {
            version: current.version + 1,
            endpoints,
        });
        Ok(value)
    }
}

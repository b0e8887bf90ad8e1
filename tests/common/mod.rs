//! In-memory fakes of the crypto engine and the HTTP transport.
//!
//! Key material is modelled as text with one `KEY:<fingerprint>` line per
//! key, and a detached signature as `SIG:<signer>:<data>`.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use gpgsync::{
    Crypto, Endpoint, Fetch, FetchError, Fingerprint, ImportError, ImportedKey, SocksProxy,
    VerifyError, keyserver_lookup_url,
};

pub const AUTHORITY: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
pub const MEMBER_1: &str = "1111111111111111111111111111111111111111";
pub const MEMBER_2: &str = "2222222222222222222222222222222222222222";
pub const MEMBER_3: &str = "3333333333333333333333333333333333333333";
pub const OTHER: &str = "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB";

pub const KEYLIST_URL: &str = "https://keylist.test/keylist.txt";
pub const KEYSERVER: &str = "hkp://keys.test";

pub fn fp(s: &str) -> Fingerprint {
    Fingerprint::parse(s).unwrap()
}

pub fn endpoint() -> Endpoint {
    Endpoint::new(AUTHORITY, KEYLIST_URL, KEYSERVER, None).unwrap()
}

pub fn key_material(fingerprints: &[&str]) -> Vec<u8> {
    fingerprints
        .iter()
        .map(|f| format!("KEY:{f}\n"))
        .collect::<String>()
        .into_bytes()
}

pub fn sign(signer: &str, data: &[u8]) -> Vec<u8> {
    let mut sig = format!("SIG:{signer}:").into_bytes();
    sig.extend_from_slice(data);
    sig
}

pub fn key_url(fingerprint: &str) -> String {
    keyserver_lookup_url(KEYSERVER, &fp(fingerprint)).unwrap()
}

fn keys_in(material: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(material)
        .lines()
        .filter_map(|l| l.strip_prefix("KEY:"))
        .map(str::to_string)
        .collect()
}

#[derive(Default)]
pub struct FakeCrypto {
    pub keyring: Mutex<HashSet<String>>,
    pub cache: Mutex<HashMap<String, Vec<u8>>>,
    pub saved: Mutex<Vec<String>>,
    pub import_delay: Option<Duration>,
}

impl FakeCrypto {
    pub fn with_keys(keys: &[&str]) -> Self {
        let crypto = Self::default();
        crypto
            .keyring
            .lock()
            .unwrap()
            .extend(keys.iter().map(|k| k.to_string()));
        crypto
    }

    pub fn has_key(&self, fingerprint: &str) -> bool {
        self.keyring.lock().unwrap().contains(fingerprint)
    }

    pub fn key_count(&self) -> usize {
        self.keyring.lock().unwrap().len()
    }
}

#[async_trait]
impl Crypto for FakeCrypto {
    async fn is_available(&self) -> bool {
        true
    }

    async fn import_key(&self, fingerprint: &Fingerprint) -> Result<ImportedKey, ImportError> {
        let material = self
            .cache
            .lock()
            .unwrap()
            .get(fingerprint.as_str())
            .cloned()
            .ok_or_else(|| ImportError::NotCached(fingerprint.to_string()))?;
        self.import_key_material(&material, fingerprint).await
    }

    async fn save_key(&self, fingerprint: &Fingerprint) -> Result<(), ImportError> {
        let material = self.export_key(fingerprint).await?;
        self.cache
            .lock()
            .unwrap()
            .insert(fingerprint.to_string(), material);
        self.saved.lock().unwrap().push(fingerprint.to_string());
        Ok(())
    }

    async fn export_key(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>, ImportError> {
        if self.has_key(fingerprint.as_str()) {
            Ok(key_material(&[fingerprint.as_str()]))
        } else {
            Err(ImportError::NoKeyMaterial)
        }
    }

    async fn verify_detached_signature(
        &self,
        data: &[u8],
        signature: &[u8],
        expected_signer: &Fingerprint,
    ) -> Result<(), VerifyError> {
        let sig = String::from_utf8_lossy(signature);
        let Some((signer, signed)) = sig
            .strip_prefix("SIG:")
            .and_then(|rest| rest.split_once(':'))
        else {
            return Err(VerifyError::SignatureInvalid);
        };
        if signed.as_bytes() != data {
            return Err(VerifyError::SignatureInvalid);
        }
        if !self.has_key(signer) {
            return Err(VerifyError::SignerKeyUnknown);
        }
        if signer != expected_signer.as_str() {
            return Err(VerifyError::SignerMismatch {
                expected: expected_signer.to_string(),
                actual: signer.to_string(),
            });
        }
        Ok(())
    }

    async fn fingerprint_matches(&self, key_material: &[u8], expected: &Fingerprint) -> bool {
        keys_in(key_material) == [expected.to_string()]
    }

    async fn import_key_material(
        &self,
        key_material: &[u8],
        expected: &Fingerprint,
    ) -> Result<ImportedKey, ImportError> {
        if let Some(delay) = self.import_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.fingerprint_matches(key_material, expected).await {
            return Err(ImportError::FingerprintMismatch {
                requested: expected.to_string(),
            });
        }
        self.keyring.lock().unwrap().insert(expected.to_string());
        Ok(ImportedKey {
            fingerprint: expected.clone(),
            uid: format!("Member {}", expected.to_keyid()),
        })
    }

    async fn get_uid(&self, fingerprint: &Fingerprint) -> String {
        format!("Member {}", fingerprint.to_keyid())
    }
}

enum Response {
    Body(Vec<u8>),
    Error(FetchError),
    Hang,
}

#[derive(Default)]
pub struct FakeFetch {
    responses: Mutex<HashMap<String, Response>>,
    pub requests: Mutex<Vec<(String, Option<SocksProxy>)>>,
}

impl FakeFetch {
    pub fn serve(&self, url: &str, body: impl Into<Vec<u8>>) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Response::Body(body.into()));
        self
    }

    pub fn fail(&self, url: &str, error: FetchError) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Response::Error(error));
        self
    }

    /// Never responds; the caller's timeout decides.
    pub fn hang(&self, url: &str) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), Response::Hang);
        self
    }

    /// Serves a keylist and its signature by `signer`.
    pub fn serve_keylist(&self, url: &str, keylist: &str, signer: &str) -> &Self {
        self.serve(url, keylist.as_bytes().to_vec());
        self.serve(&format!("{url}.sig"), sign(signer, keylist.as_bytes()))
    }

    /// Serves `fingerprint` from the keyserver.
    pub fn serve_key(&self, fingerprint: &str) -> &Self {
        self.serve(&key_url(fingerprint), key_material(&[fingerprint]))
    }

    pub fn requested(&self, url: &str) -> bool {
        self.requests.lock().unwrap().iter().any(|(u, _)| u == url)
    }
}

#[async_trait]
impl Fetch for FakeFetch {
    async fn fetch(
        &self,
        url: &str,
        proxy: Option<&SocksProxy>,
        timeout: Duration,
    ) -> Result<Vec<u8>, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), proxy.cloned()));

        let response = match self.responses.lock().unwrap().get(url) {
            Some(Response::Body(body)) => Ok(body.clone()),
            Some(Response::Error(error)) => Err(Some(error.clone())),
            Some(Response::Hang) => Err(None),
            None => Err(Some(FetchError::HttpStatus(404))),
        };

        match response {
            Ok(body) => Ok(body),
            Err(Some(error)) => Err(error),
            Err(None) => {
                tokio::time::sleep(timeout).await;
                Err(FetchError::Timeout)
            }
        }
    }
}

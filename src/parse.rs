use chrono::NaiveDate;
use tracing::debug;

use crate::error::VerifyError;
use crate::types::{Key, KeyType, KeyValidity};
use crate::validation::Fingerprint;

/// Parses `gpg --with-colons` key listings (also the output of
/// `--import-options show-only --import`).
pub fn parse_keys(output: &str) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut current_key: Option<KeyBuilder> = None;

    for line in output.lines() {
        let fields: Vec<&str> = line.split(':').collect();

        match fields[0] {
            "pub" => {
                if let Some(builder) = current_key.take() {
                    if let Some(key) = builder.build() {
                        keys.push(key);
                    } else {
                        debug!("skipping key: missing required fields (fingerprint or key_type)");
                    }
                }
                current_key = Some(KeyBuilder::from_pub_fields(&fields));
            }
            "fpr" if current_key.is_some() => {
                if let Some(ref mut builder) = current_key
                    && builder.fingerprint.is_none()
                    && fields.len() > 9
                {
                    builder.fingerprint = Some(fields[9].to_string());
                }
            }
            "uid" if current_key.is_some() => {
                if let Some(ref mut builder) = current_key
                    && builder.uid.is_none()
                    && fields.len() > 9
                {
                    builder.uid = Some(fields[9].to_string());
                }
            }
            "sub" | "ssb" | "uat" | "rev" | "tru" | "sig" | "grp" | "fp2" => {
                debug!(
                    record_type = fields[0],
                    "skipping unhandled GPG record type"
                );
            }
            _ if !fields[0].is_empty() => {
                debug!(record_type = fields[0], "skipping unknown GPG record type");
            }
            _ => {}
        }
    }

    if let Some(builder) = current_key {
        if let Some(key) = builder.build() {
            keys.push(key);
        } else {
            debug!("skipping final key: missing required fields (fingerprint or key_type)");
        }
    }

    keys
}

/// True when `keys` holds exactly one primary key and it is `expected`.
///
/// Extra keys in a keyserver response are treated as a mismatch, so a
/// response can never smuggle additional keys into the keyring.
pub fn only_fingerprint_is(keys: &[Key], expected: &Fingerprint) -> bool {
    match keys {
        [key] => key.fingerprint.eq_ignore_ascii_case(expected.as_str()),
        _ => false,
    }
}

/// What `gpg --status-fd` reported about a detached signature.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VerifyStatus {
    /// Primary key fingerprints from `VALIDSIG` lines.
    pub valid_signers: Vec<String>,
    pub bad_signature: bool,
    pub missing_key: bool,
    pub expired_key: bool,
    pub revoked_key: bool,
    pub error: bool,
}

pub fn parse_verify_status(output: &str) -> VerifyStatus {
    let mut status = VerifyStatus::default();

    for line in output.lines() {
        let Some(rest) = line.strip_prefix("[GNUPG:] ") else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let Some(&keyword) = fields.first() else {
            continue;
        };

        match keyword {
            "VALIDSIG" => {
                // The primary key fingerprint is field 10; older versions
                // omit it, in which case the signing key is the primary.
                if let Some(fpr) = fields.get(10).or_else(|| fields.get(1)) {
                    status.valid_signers.push(fpr.to_uppercase());
                }
            }
            "BADSIG" => status.bad_signature = true,
            "EXPKEYSIG" => status.expired_key = true,
            "REVKEYSIG" => status.revoked_key = true,
            "NO_PUBKEY" => status.missing_key = true,
            "ERRSIG" => {
                if fields.get(6) == Some(&"9") {
                    status.missing_key = true;
                } else {
                    status.error = true;
                }
            }
            _ => {}
        }
    }

    status
}

/// Decides whether a parsed verification attributes a good signature to
/// `expected`.
pub fn classify_verification(
    status: &VerifyStatus,
    expected: &Fingerprint,
) -> Result<(), VerifyError> {
    if status.bad_signature || status.error {
        return Err(VerifyError::SignatureInvalid);
    }
    if status.revoked_key {
        return Err(VerifyError::SignerKeyRevoked);
    }
    if status.expired_key {
        return Err(VerifyError::SignerKeyExpired);
    }
    if status
        .valid_signers
        .iter()
        .any(|fpr| fpr == expected.as_str())
    {
        return Ok(());
    }
    if let Some(actual) = status.valid_signers.first() {
        return Err(VerifyError::SignerMismatch {
            expected: expected.to_string(),
            actual: actual.clone(),
        });
    }
    if status.missing_key {
        return Err(VerifyError::SignerKeyUnknown);
    }
    Err(VerifyError::SignatureInvalid)
}

/// Fingerprints reported by `IMPORT_OK` status lines, uppercased.
pub fn parse_import_status(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("[GNUPG:] IMPORT_OK "))
        .filter_map(|rest| rest.split_whitespace().nth(1))
        .map(str::to_uppercase)
        .collect()
}

/// Extracts the major version from `gpg --version` output.
pub fn parse_gpg_version(output: &str) -> Option<u32> {
    let first = output.lines().next()?;
    if !first.contains("GnuPG") {
        return None;
    }
    first
        .split_whitespace()
        .last()?
        .split('.')
        .next()?
        .parse()
        .ok()
}

fn parse_timestamp(s: &str) -> Option<NaiveDate> {
    if s.is_empty() {
        return None;
    }
    s.parse::<i64>()
        .ok()
        .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
        .map(|dt| dt.date_naive())
}

fn parse_algorithm(code: &str) -> String {
    match code {
        "1" | "2" | "3" => "RSA".to_string(),
        "16" | "20" => "Elgamal".to_string(),
        "17" => "DSA".to_string(),
        "18" => "ECDH".to_string(),
        "19" => "ECDSA".to_string(),
        "22" => "EdDSA".to_string(),
        _ => format!("ALG{}", code),
    }
}

#[derive(Default)]
struct KeyBuilder {
    fingerprint: Option<String>,
    uid: Option<String>,
    created: Option<NaiveDate>,
    expires: Option<NaiveDate>,
    validity: KeyValidity,
    key_type: Option<KeyType>,
}

impl KeyBuilder {
    fn from_pub_fields(fields: &[&str]) -> Self {
        let mut builder = Self::default();

        if fields.len() > 1 {
            builder.validity = fields[1]
                .chars()
                .next()
                .map(KeyValidity::from_gpg_char)
                .unwrap_or_default();
        }

        if fields.len() > 2 {
            let bits = fields[2].parse().unwrap_or(0);
            let algorithm = fields
                .get(3)
                .map(|s| parse_algorithm(s))
                .unwrap_or_default();
            builder.key_type = Some(KeyType { algorithm, bits });
        }

        if fields.len() > 5 {
            builder.created = parse_timestamp(fields[5]);
        }

        if fields.len() > 6 {
            builder.expires = parse_timestamp(fields[6]);
        }

        builder
    }

    fn build(self) -> Option<Key> {
        Some(Key {
            fingerprint: self.fingerprint?,
            uid: self.uid.unwrap_or_default(),
            created: self.created,
            expires: self.expires,
            validity: self.validity,
            key_type: self.key_type?,
        })
    }
}

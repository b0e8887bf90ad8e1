//! Keep an organization's trusted OpenPGP keys in sync from a signed keylist.
//!
//! An [`Endpoint`] names an authority key and the URL of a keylist: one
//! member fingerprint per line, with a detached signature at the same URL
//! plus `.sig`. A [`Verifier`] run fetches both, checks that the keylist was
//! signed by the authority, and imports every member key from the
//! endpoint's keyserver. The [`Scheduler`] repeats this for every endpoint
//! in an [`EndpointStore`] and publishes [`StatusEvent`]s.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use gpgsync::{Endpoint, EndpointStore, Gpg, HttpFetcher, Scheduler, Verifier};
//!
//! #[tokio::main]
//! async fn main() -> gpgsync::Result<()> {
//!     let gpg = Arc::new(Gpg::new());
//!     gpgsync::ensure_available(gpg.as_ref()).await?;
//!
//!     let verifier = Arc::new(Verifier::new(gpg, Arc::new(HttpFetcher::new())));
//!     let scheduler = Scheduler::new(verifier, Arc::new(EndpointStore::new()));
//!
//!     let endpoint = Endpoint::new(
//!         "ABAF 11C6 5A29 70B1 30AB  E3C4 79BE 3E43 0041 1886",
//!         "https://example.org/keylist.txt",
//!         "hkps://keys.openpgp.org",
//!         None,
//!     )?;
//!     let result = scheduler.add_endpoint(endpoint).await?;
//!     println!("{}", result.status_message());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Requirements
//!
//! - GnuPG 2.x available as `gpg` (or configured with [`Gpg::program`])
//! - Write access to the GnuPG home directory for imports

mod crypto;
mod endpoint;
mod error;
mod fetch;
mod gpg;
mod keylist;
mod parse;
mod scheduler;
mod types;
mod validation;
mod verifier;

pub use crypto::{Crypto, ImportedKey, keyserver_lookup_url};
pub use endpoint::{Endpoint, EndpointEdit, EndpointId, EndpointStore, Persistence, Snapshot};
pub use error::{Error, FetchError, ImportError, ParseError, Result, VerifyError};
pub use fetch::{ConnectivityCheck, Fetch, FetchOptions, HttpFetcher, internet_available};
pub use gpg::Gpg;
pub use keylist::{Keylist, RejectedLine, parse_keylist};
pub use scheduler::{
    Scheduler, SchedulerOptions, TriggerOutcome, WarmCacheReport, ensure_available, warm_cache,
};
pub use types::{
    Key, KeyType, KeyValidity, ProxyConfig, RunState, SocksProxy, StatusEvent, VerifierState,
    VerifyProgress,
};
pub use validation::{Fingerprint, normalize_fingerprint, normalize_keyserver, validate_proxy};
pub use verifier::{
    FetchTarget, Outcome, RunFailure, VerificationResult, Verifier, VerifierOptions,
};

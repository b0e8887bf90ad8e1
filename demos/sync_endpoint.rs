//! Example: Sync one endpoint into the default GnuPG keyring
//!
//! Run with: cargo run --example sync_endpoint -- <FINGERPRINT> <KEYLIST_URL> [KEYSERVER]

use std::sync::Arc;

use gpgsync::{
    Endpoint, EndpointStore, Gpg, HttpFetcher, KeyValidity, Scheduler, Verifier, ensure_available,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> gpgsync::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [fingerprint, keylist_url, rest @ ..] = args.as_slice() else {
        eprintln!("usage: sync_endpoint <FINGERPRINT> <KEYLIST_URL> [KEYSERVER]");
        std::process::exit(2);
    };
    let keyserver = rest.first().map(String::as_str).unwrap_or_default();

    let gpg = Arc::new(Gpg::new());
    ensure_available(gpg.as_ref()).await?;

    let verifier = Arc::new(Verifier::new(gpg.clone(), Arc::new(HttpFetcher::new())));
    let scheduler = Scheduler::new(verifier, Arc::new(EndpointStore::new()));

    let mut events = scheduler.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("[{:?}] {}", event.state, event.message);
        }
    });

    let endpoint = Endpoint::new(fingerprint, keylist_url, keyserver, None)?;
    let result = scheduler.add_endpoint(endpoint).await?;
    println!("\n{}\n", result.status_message());

    for rejected in &result.rejected_lines {
        println!("line {}: {}", rejected.line, rejected.error);
    }
    for (fp, error) in &result.failed {
        println!("{}: {}", fp.to_keyid(), error);
    }

    for fp in &result.imported {
        for key in gpg.list_keys(Some(fp)).await? {
            println!("{}", format_key_output(&key));
        }
    }

    Ok(())
}

fn format_key_output(key: &gpgsync::Key) -> String {
    let validity_marker = match key.validity {
        KeyValidity::Ultimate => "[U]",
        KeyValidity::Full => "[F]",
        KeyValidity::Marginal => "[M]",
        KeyValidity::Never => "[N]",
        KeyValidity::Undefined => "[?]",
        KeyValidity::Unknown => "[-]",
        KeyValidity::Expired => "[E]",
        KeyValidity::Revoked => "[R]",
        _ => "[?]",
    };

    format!(
        "{} {} {}\n    {}",
        validity_marker,
        &key.fingerprint[..16],
        key.key_type,
        key.uid,
    )
}

//! Scheduler behaviour against in-memory crypto and transport fakes.

mod common;

use std::sync::Arc;

use common::*;
use gpgsync::{
    ConnectivityCheck, EndpointEdit, EndpointStore, Error, ImportError, RunState, Scheduler,
    SchedulerOptions, StatusEvent, TriggerOutcome, Verifier, VerifierState, ensure_available,
    warm_cache,
};
use tokio::sync::broadcast;

const NEW_URL: &str = "https://keylist.test/v2/keylist.txt";

struct Harness {
    crypto: Arc<FakeCrypto>,
    fetch: Arc<FakeFetch>,
    store: Arc<EndpointStore>,
    scheduler: Arc<Scheduler>,
}

fn harness(options: SchedulerOptions) -> Harness {
    let crypto = Arc::new(FakeCrypto::with_keys(&[AUTHORITY]));
    let fetch = Arc::new(FakeFetch::default());
    fetch
        .serve_keylist(KEYLIST_URL, &format!("{MEMBER_1}\n"), AUTHORITY)
        .serve_key(MEMBER_1);

    let store = Arc::new(EndpointStore::new());
    let verifier = Arc::new(Verifier::new(crypto.clone(), fetch.clone()));
    let scheduler = Scheduler::with_options(verifier, store.clone(), options);
    Harness {
        crypto,
        fetch,
        store,
        scheduler,
    }
}

fn offline_check_disabled() -> SchedulerOptions {
    SchedulerOptions {
        connectivity_check: None,
        ..SchedulerOptions::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_second_trigger_is_coalesced() {
    let h = harness(offline_check_disabled());
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();

    let TriggerOutcome::Started(handle) = h.scheduler.trigger(id) else {
        panic!("first trigger should start a run");
    };
    assert!(h.scheduler.is_running(id));
    assert!(matches!(
        h.scheduler.trigger(id),
        TriggerOutcome::AlreadyRunning
    ));
    assert!(h.scheduler.sync_now(id).await.unwrap().is_none());

    let result = handle.await.unwrap();
    assert!(result.is_success());
    assert!(!h.scheduler.is_running(id));
    assert!(matches!(h.scheduler.trigger(id), TriggerOutcome::Started(_)));
}

#[tokio::test]
async fn test_trigger_unknown_endpoint() {
    let h = harness(offline_check_disabled());
    let id = endpoint().id();
    assert!(matches!(
        h.scheduler.trigger(id),
        TriggerOutcome::UnknownEndpoint
    ));
    assert!(matches!(
        h.scheduler.sync_now(id).await,
        Err(Error::UnknownEndpoint(_))
    ));
}

#[tokio::test]
async fn test_sync_now_records_result_and_emits_events() {
    let h = harness(offline_check_disabled());
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();
    let mut rx = h.scheduler.subscribe();

    let result = h.scheduler.sync_now(id).await.unwrap().unwrap();
    assert!(result.is_success());

    let stored = h.store.get(id).unwrap();
    assert_eq!(stored.last_synced(), Some(result.finished_at));
    assert!(stored.last_error().is_none());

    let events = drain(&mut rx);
    assert!(events.iter().all(|e| e.endpoint_id == id));
    assert_eq!(events.first().map(|e| &e.state), Some(&RunState::Started));
    let last = events.last().unwrap();
    assert_eq!(last.state, RunState::Succeeded);
    assert_eq!(last.message, "Synced 1 keys");
    assert!(events.iter().any(|e| {
        e.state == RunState::Progress(VerifierState::FetchingMemberKeys)
            && e.message == "Fetching key 1 of 1"
    }));
}

#[tokio::test]
async fn test_failed_run_emits_classification() {
    let h = harness(offline_check_disabled());
    h.fetch
        .serve_keylist(KEYLIST_URL, &format!("{MEMBER_1}\n"), OTHER);
    h.crypto.keyring.lock().unwrap().insert(OTHER.to_string());
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();
    let mut rx = h.scheduler.subscribe();

    let result = h.scheduler.sync_now(id).await.unwrap().unwrap();
    assert!(!result.is_success());

    let last = drain(&mut rx).pop().unwrap();
    assert_eq!(last.state, RunState::Failed);
    assert_eq!(last.message, "The keylist was not signed by the authority key");
    assert_eq!(
        h.store.get(id).unwrap().last_error(),
        Some("The keylist was not signed by the authority key")
    );
}

#[tokio::test]
async fn test_add_endpoint_verifies_before_saving() {
    let h = harness(offline_check_disabled());

    let result = h.scheduler.add_endpoint(endpoint()).await.unwrap();
    assert!(result.is_success());

    let snapshot = h.store.snapshot();
    assert_eq!(snapshot.endpoints().len(), 1);
    assert!(snapshot.endpoints()[0].last_synced().is_some());
    assert_eq!(*h.crypto.saved.lock().unwrap(), [AUTHORITY.to_string()]);
}

#[tokio::test]
async fn test_add_endpoint_failure_saves_nothing() {
    let h = harness(offline_check_disabled());
    h.fetch.fail(KEYLIST_URL, gpgsync::FetchError::ConnectionFailed);

    let result = h.scheduler.add_endpoint(endpoint()).await;
    assert!(matches!(result, Err(Error::VerificationFailed(_))));
    assert!(h.store.snapshot().endpoints().is_empty());
    assert!(h.crypto.saved.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_add_duplicate_authority_is_rejected() {
    let h = harness(offline_check_disabled());
    h.scheduler.add_endpoint(endpoint()).await.unwrap();

    assert!(matches!(
        h.scheduler.add_endpoint(endpoint()).await,
        Err(Error::DuplicateEndpoint(_))
    ));
}

#[tokio::test]
async fn test_edit_keyserver_saves_without_verifying() {
    let h = harness(offline_check_disabled());
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();

    let edit = EndpointEdit {
        keyserver: Some("hkps://keys.example.org".to_string()),
        ..EndpointEdit::default()
    };
    assert!(h.scheduler.edit_endpoint(id, &edit).await.unwrap().is_none());
    assert_eq!(h.store.get(id).unwrap().keyserver(), "hkps://keys.example.org");
    assert!(h.fetch.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_edit_url_must_verify() {
    let h = harness(offline_check_disabled());
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();

    let edit = EndpointEdit {
        keylist_url: Some(NEW_URL.to_string()),
        ..EndpointEdit::default()
    };
    assert!(matches!(
        h.scheduler.edit_endpoint(id, &edit).await,
        Err(Error::VerificationFailed(_))
    ));
    assert_eq!(h.store.get(id).unwrap().keylist_url(), KEYLIST_URL);

    h.fetch
        .serve_keylist(NEW_URL, &format!("{MEMBER_1}\n"), AUTHORITY);
    let result = h.scheduler.edit_endpoint(id, &edit).await.unwrap();
    assert!(result.is_some_and(|r| r.is_success()));
    let stored = h.store.get(id).unwrap();
    assert_eq!(stored.keylist_url(), NEW_URL);
    assert!(stored.last_synced().is_some());
}

#[tokio::test]
async fn test_edit_fingerprint_is_refused() {
    let h = harness(offline_check_disabled());
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();

    let edit = EndpointEdit {
        authority_fingerprint: Some(OTHER.to_string()),
        ..EndpointEdit::default()
    };
    assert!(matches!(
        h.scheduler.edit_endpoint(id, &edit).await,
        Err(Error::FingerprintImmutable)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_edit_url_while_running_is_refused() {
    let h = harness(offline_check_disabled());
    h.fetch.hang(KEYLIST_URL);
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();

    let TriggerOutcome::Started(handle) = h.scheduler.trigger(id) else {
        panic!("run should start");
    };
    let edit = EndpointEdit {
        keylist_url: Some(NEW_URL.to_string()),
        ..EndpointEdit::default()
    };
    assert!(matches!(
        h.scheduler.edit_endpoint(id, &edit).await,
        Err(Error::SyncInProgress(_))
    ));

    assert!(h.scheduler.cancel(id));
    assert!(handle.await.unwrap().is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_keyserver_edit_during_sync_keeps_both_writes() {
    let h = harness(offline_check_disabled());
    h.fetch.hang(&key_url(MEMBER_1));
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();

    let TriggerOutcome::Started(handle) = h.scheduler.trigger(id) else {
        panic!("run should start");
    };
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    let edit = EndpointEdit {
        keyserver: Some("hkps://keys.example.org".to_string()),
        ..EndpointEdit::default()
    };
    assert!(h.scheduler.edit_endpoint(id, &edit).await.unwrap().is_none());
    assert!(handle.await.unwrap().is_success());

    let stored = h.store.get(id).unwrap();
    assert_eq!(stored.keyserver(), "hkps://keys.example.org");
    assert!(stored.last_synced().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_url_edit_conflicting_with_concurrent_edit_is_refused() {
    let h = harness(offline_check_disabled());
    h.fetch
        .serve_keylist(NEW_URL, &format!("{MEMBER_2}\n"), AUTHORITY)
        .hang(&key_url(MEMBER_2));
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();

    let scheduler = Arc::clone(&h.scheduler);
    let url_edit = EndpointEdit {
        keylist_url: Some(NEW_URL.to_string()),
        ..EndpointEdit::default()
    };
    let pending = tokio::spawn(async move { scheduler.edit_endpoint(id, &url_edit).await });
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;

    let keyserver_edit = EndpointEdit {
        keyserver: Some("hkps://keys.example.org".to_string()),
        ..EndpointEdit::default()
    };
    h.scheduler.edit_endpoint(id, &keyserver_edit).await.unwrap();

    assert!(matches!(pending.await.unwrap(), Err(Error::EditConflict(_))));
    let stored = h.store.get(id).unwrap();
    assert_eq!(stored.keylist_url(), KEYLIST_URL);
    assert_eq!(stored.keyserver(), "hkps://keys.example.org");
}

#[tokio::test(start_paused = true)]
async fn test_delete_cancels_running_sync() {
    let h = harness(offline_check_disabled());
    h.fetch.hang(KEYLIST_URL);
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();
    let mut rx = h.scheduler.subscribe();

    let TriggerOutcome::Started(handle) = h.scheduler.trigger(id) else {
        panic!("run should start");
    };
    let deleted = h.scheduler.delete_endpoint(id).unwrap();
    assert_eq!(deleted.id(), id);

    let result = handle.await.unwrap();
    assert!(result.is_cancelled());
    assert!(h.store.snapshot().endpoints().is_empty());
    assert!(!h.scheduler.cancel(id));

    let last = drain(&mut rx).pop().unwrap();
    assert_eq!(last.state, RunState::Cancelled);
    assert_eq!(last.message, "Sync was cancelled");
}

#[tokio::test]
async fn test_tick_runs_due_endpoints_once() {
    let h = harness(offline_check_disabled());
    h.store.insert(endpoint()).unwrap();

    let handles = h.scheduler.tick().await;
    assert_eq!(handles.len(), 1);
    for handle in handles {
        assert!(handle.await.unwrap().is_success());
    }

    assert!(h.scheduler.tick().await.is_empty(), "nothing is due yet");
}

#[tokio::test]
async fn test_tick_defers_when_offline() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let h = harness(SchedulerOptions {
        connectivity_check: Some(ConnectivityCheck {
            host: "127.0.0.1".to_string(),
            port,
            timeout: std::time::Duration::from_secs(1),
        }),
        ..SchedulerOptions::default()
    });
    let ep = endpoint();
    let id = ep.id();
    h.store.insert(ep).unwrap();
    let mut rx = h.scheduler.subscribe();

    assert!(h.scheduler.tick().await.is_empty());

    let events = drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].endpoint_id, id);
    assert_eq!(events[0].state, RunState::Deferred);

    let stored = h.store.get(id).unwrap();
    assert!(stored.last_failed().is_none());
    assert!(stored.last_checked().is_none());
    assert!(h.fetch.requests.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_background_loop_stops_on_shutdown() {
    let h = harness(offline_check_disabled());
    h.store.insert(endpoint()).unwrap();

    let handle = h.scheduler.spawn();
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    h.scheduler.shutdown();
    handle.await.unwrap();

    assert!(h.store.snapshot().endpoints()[0].last_checked().is_some());
}

#[tokio::test]
async fn test_warm_cache_reports_each_key() {
    let crypto = FakeCrypto::default();
    crypto
        .cache
        .lock()
        .unwrap()
        .insert(AUTHORITY.to_string(), key_material(&[AUTHORITY]));
    let other = gpgsync::Endpoint::new(OTHER, KEYLIST_URL, "", None).unwrap();

    let report = warm_cache(&crypto, &[endpoint(), other]).await;

    assert_eq!(report.imported, [fp(AUTHORITY)]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, fp(OTHER));
    assert!(matches!(report.failed[0].1, ImportError::NotCached(_)));
    assert!(crypto.has_key(AUTHORITY));
}

#[tokio::test]
async fn test_ensure_available() {
    assert!(ensure_available(&FakeCrypto::default()).await.is_ok());
}

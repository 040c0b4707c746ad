mod support;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use tokio::task::JoinHandle;

use fleetstore::concurrency::shutdown::{create_shutdown_channel, ShutdownTx};
use fleetstore::error::{ErrorKind, FleetError};
use fleetstore::informer::lister_watcher::WatchEvent;
use fleetstore::informer::pager::DEFAULT_PAGE_SIZE;
use fleetstore::informer::reflector::{Reflector, ReflectorOptions, WatchErrorHandler};
use fleetstore::informer::store::{Store, StoreItem};

use support::*;

fn spawn_reflector<S: Store>(
    api: &Arc<FakeClusterApi>,
    store: &Arc<S>,
    options: ReflectorOptions,
) -> (Arc<Reflector<FakeClusterApi, S>>, ShutdownTx, JoinHandle<()>) {
    let reflector = Arc::new(Reflector::new(
        "test-reflector",
        api.clone(),
        store.clone(),
        options,
    ));
    spawn(reflector)
}

fn spawn<S: Store>(
    reflector: Arc<Reflector<FakeClusterApi, S>>,
) -> (Arc<Reflector<FakeClusterApi, S>>, ShutdownTx, JoinHandle<()>) {
    let (tx, rx) = create_shutdown_channel();
    let handle = tokio::spawn({
        let reflector = reflector.clone();
        async move { reflector.run(rx).await }
    });
    (reflector, tx, handle)
}

fn names(entries: &[&str]) -> HashSet<String> {
    entries.iter().map(|s| s.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_list_then_watch_applies_events() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(
        vec![
            deployment("default", "a", "uid-a", "8"),
            deployment("default", "b", "uid-b", "9"),
            deployment("default", "x", "uid-x", "10"),
        ],
        "10",
        None,
    )));
    api.push_watch(WatchScript::EventsThenPend(vec![
        Ok(WatchEvent::Added(deployment("default", "x", "uid-x", "12"))),
        Ok(WatchEvent::Modified(deployment("default", "x", "uid-x", "14"))),
        Ok(WatchEvent::Deleted(deployment("default", "x", "uid-x", "15"))),
    ]));

    let store = Arc::new(RecordingStore::new());
    let (reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    wait_until(|| reflector.last_sync_resource_version() == "15").await;
    assert!(reflector.has_initialized_synced());

    // One replace carrying exactly the listed set, then the deltas one by one.
    assert_eq!(store.replace_count(), 1);
    {
        let replaces = store.replaces.lock().unwrap();
        assert_eq!(replaces[0].0.len(), 3);
        assert_eq!(replaces[0].1, "10");
        assert!(replaces[0]
            .0
            .iter()
            .all(|item| matches!(item, StoreItem::Object(_))));
    }
    assert_eq!(store.object_names(), names(&["default/a", "default/b"]));

    // The initial list opted into cached data.
    assert_eq!(api.list_requests()[0].resource_version, "0");
    assert_eq!(api.list_requests()[0].limit, DEFAULT_PAGE_SIZE);

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expired_watch_relists_from_last_resource_version() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::Events(vec![Ok(WatchEvent::Error(Status {
        code: Some(410),
        reason: Some("Expired".to_string()),
        ..Default::default()
    }))]));
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "11")], "11", None)));

    let store = Arc::new(RecordingStore::new());
    let (reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    wait_until(|| reflector.last_sync_resource_version() == "11").await;

    let requests = api.list_requests();
    assert_eq!(requests.len(), 2);
    // The expired watch does not invalidate the last version: the relist starts there,
    // and with a known version the chunking is turned off.
    assert_eq!(requests[1].resource_version, "10");
    assert_eq!(requests[1].limit, 0);

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_expired_list_retries_from_empty_version() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::Events(vec![Err(error_of_kind(ErrorKind::Expired))]));
    api.push_list(Err(error_of_kind(ErrorKind::Expired)));
    api.push_list(Ok(page(
        vec![
            deployment("default", "a", "uid-a", "19"),
            deployment("default", "b", "uid-b", "20"),
        ],
        "20",
        None,
    )));

    let store = Arc::new(RecordingStore::new());
    let (reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    wait_until(|| reflector.last_sync_resource_version() == "20").await;

    let requests = api.list_requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].resource_version, "10");
    // The expired relist immediately falls back to a consistent read.
    assert_eq!(requests[2].resource_version, "");

    assert_eq!(store.replace_count(), 2);
    assert_eq!(store.object_names(), names(&["default/a", "default/b"]));

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_very_short_empty_watch_ends_the_cycle() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    // Closes immediately with zero events.
    api.push_watch(WatchScript::Events(vec![]));
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "11", None)));

    let store = Arc::new(RecordingStore::new());
    let (reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    // The cycle ended and a fresh list happened after backoff.
    wait_until(|| api.list_requests().len() == 2).await;
    wait_until(|| reflector.last_sync_resource_version() == "11").await;

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_clean_watch_close_with_events_rewatches_without_relist() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::Events(vec![Ok(WatchEvent::Modified(deployment(
        "default", "a", "uid-a", "12",
    )))]));

    let store = Arc::new(RecordingStore::new());
    let (reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    wait_until(|| api.watch_requests().len() == 2).await;
    assert_eq!(api.list_requests().len(), 1);
    assert_eq!(reflector.last_sync_resource_version(), "12");
    // The next watch resumes at the advanced version.
    assert_eq!(api.watch_requests()[1].resource_version, "12");

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watch_connection_refused_backs_off_without_relist() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::Fail(error_of_kind(ErrorKind::ConnectionRefused)));
    api.push_watch(WatchScript::Fail(error_of_kind(ErrorKind::Throttled)));

    let store = Arc::new(RecordingStore::new());
    let (_reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    wait_until(|| api.watch_requests().len() == 3).await;
    assert_eq!(api.list_requests().len(), 1);

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_internal_watch_error_retries_within_budget() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::Events(vec![Err(error_of_kind(
        ErrorKind::InternalError,
    ))]));

    let store = Arc::new(RecordingStore::new());
    let options = ReflectorOptions {
        max_internal_error_retry_duration: Duration::from_secs(60),
        ..Default::default()
    };
    let (_reflector, tx, handle) = spawn_reflector(&api, &store, options);

    // Retried the watch without going back to list.
    wait_until(|| api.watch_requests().len() == 2).await;
    assert_eq!(api.list_requests().len(), 1);

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_internal_watch_error_without_budget_ends_the_cycle() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::Events(vec![Err(error_of_kind(
        ErrorKind::InternalError,
    ))]));
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "11", None)));

    let store = Arc::new(RecordingStore::new());
    let (_reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    wait_until(|| api.list_requests().len() == 2).await;

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_resync_fires_on_every_period() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::EventsThenPend(vec![]));

    let store = Arc::new(RecordingStore::new());
    let reflector = Arc::new(
        Reflector::new(
            "test-reflector",
            api.clone(),
            store.clone(),
            ReflectorOptions {
                resync_period: Duration::from_secs(1),
                ..Default::default()
            },
        )
        .with_should_resync(Arc::new(|| true)),
    );
    let (_reflector, tx, handle) = spawn(reflector);

    wait_until(|| store.resync_count() >= 3).await;

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_resync_respects_should_resync() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::EventsThenPend(vec![]));

    let store = Arc::new(RecordingStore::new());
    let reflector = Arc::new(
        Reflector::new(
            "test-reflector",
            api.clone(),
            store.clone(),
            ReflectorOptions {
                resync_period: Duration::from_secs(1),
                ..Default::default()
            },
        )
        .with_should_resync(Arc::new(|| false)),
    );
    let (_reflector, tx, handle) = spawn(reflector);

    // Give the timer several virtual periods; the veto keeps resync at zero.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(store.resync_count(), 0);

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_resync_error_aborts_the_cycle() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::EventsThenPend(vec![]));
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "11", None)));

    let store = Arc::new(RecordingStore::new());
    *store.resync_error.lock().unwrap() = Some(error_of_kind(ErrorKind::QueryFailed));

    let reflector = Arc::new(Reflector::new(
        "test-reflector",
        api.clone(),
        store.clone(),
        ReflectorOptions {
            resync_period: Duration::from_secs(1),
            ..Default::default()
        },
    ));
    let (_reflector, tx, handle) = spawn(reflector);

    // The failing resync tore down the cycle and a new list started.
    wait_until(|| api.list_requests().len() == 2).await;
    assert!(store.resync_count() >= 1);

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stream_mode_adds_items_and_replaces_with_keys() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(
        vec![
            deployment("default", "a", "uid-a", "8"),
            deployment("default", "b", "uid-b", "9"),
        ],
        "10",
        Some("next"),
    )));
    api.push_list(Ok(page(vec![deployment("default", "c", "uid-c", "10")], "10", None)));

    let store = Arc::new(RecordingStore::new());
    let options = ReflectorOptions {
        stream_handle_for_paginated_list: true,
        ..Default::default()
    };
    let (reflector, tx, handle) = spawn_reflector(&api, &store, options);

    wait_until(|| reflector.last_sync_resource_version() == "10").await;

    assert_eq!(store.replace_count(), 1);
    {
        let replaces = store.replaces.lock().unwrap();
        assert_eq!(replaces[0].0.len(), 3);
        assert!(replaces[0]
            .0
            .iter()
            .all(|item| matches!(item, StoreItem::Key(_))));
    }
    // Items reached the store through add() as the pages arrived.
    assert_eq!(
        store.object_names(),
        names(&["default/a", "default/b", "default/c"])
    );

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_paginated_initial_list_keeps_chunking_on_relist() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "8")], "10", Some("next"))));
    api.push_list(Ok(page(vec![deployment("default", "b", "uid-b", "9")], "10", None)));
    api.push_watch(WatchScript::Events(vec![Err(error_of_kind(ErrorKind::Expired))]));
    api.push_list(Ok(page(
        vec![
            deployment("default", "a", "uid-a", "12"),
            deployment("default", "b", "uid-b", "13"),
        ],
        "13",
        None,
    )));

    let store = Arc::new(RecordingStore::new());
    let (_reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    wait_until(|| api.list_requests().len() == 3).await;

    let requests = api.list_requests();
    // The initial chunked result showed the source honors paging, so the relist at a
    // known version still asks for chunks.
    assert_eq!(requests[2].resource_version, "10");
    assert_eq!(requests[2].limit, DEFAULT_PAGE_SIZE);

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_watch_error_handler_observes_connects_and_failures() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    // First watch connects and closes cleanly after one event.
    api.push_watch(WatchScript::Events(vec![Ok(WatchEvent::Modified(deployment(
        "default", "a", "uid-a", "12",
    )))]));
    // The reconnect is rejected outright, which drops the whole cycle.
    api.push_watch(WatchScript::Fail(error_of_kind(ErrorKind::Expired)));
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "13")], "13", None)));

    let calls: Arc<Mutex<Vec<(String, Option<ErrorKind>)>>> = Arc::new(Mutex::new(Vec::new()));
    let handler: WatchErrorHandler = {
        let calls = calls.clone();
        Arc::new(move |name: &str, err: Option<&FleetError>| {
            calls
                .lock()
                .unwrap()
                .push((name.to_string(), err.map(|e| e.kind())));
        })
    };

    let store = Arc::new(RecordingStore::new());
    let reflector = Arc::new(
        Reflector::new(
            "test-reflector",
            api.clone(),
            store.clone(),
            ReflectorOptions::default(),
        )
        .with_watch_error_handler(handler),
    );
    let (_reflector, tx, handle) = spawn(reflector);

    // Three observations by the time the second cycle's watch parks: the first
    // connect, the dropped cycle, and the reconnect of the fresh cycle.
    wait_until(|| calls.lock().unwrap().len() >= 3).await;

    let recorded = calls.lock().unwrap().clone();
    assert!(recorded.iter().all(|(name, _)| name == "test-reflector"));
    assert_eq!(recorded[0].1, None);
    assert_eq!(recorded[1].1, Some(ErrorKind::Expired));
    assert_eq!(recorded[2].1, None);

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pagination_at_known_version_does_not_flip_the_preference() {
    let api = Arc::new(FakeClusterApi::new());
    // Initial list at "0" comes back in one piece.
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "8")], "10", None)));
    api.push_watch(WatchScript::Events(vec![Err(error_of_kind(ErrorKind::Expired))]));
    // The relist at "10" happens to come back chunked anyway.
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "11")], "11", Some("next"))));
    api.push_list(Ok(page(vec![deployment("default", "b", "uid-b", "12")], "11", None)));
    api.push_watch(WatchScript::Events(vec![Err(error_of_kind(ErrorKind::Expired))]));
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "13")], "13", None)));

    let store = Arc::new(RecordingStore::new());
    let (_reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    wait_until(|| api.list_requests().len() == 4).await;

    let requests = api.list_requests();
    // Only the initial list decides the chunking preference, so both relists at a
    // known version keep it off.
    assert_eq!(requests[1].limit, 0);
    assert_eq!(requests[3].resource_version, "11");
    assert_eq!(requests[3].limit, 0);

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_events_with_unexpected_gvk_are_skipped() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::EventsThenPend(vec![
        Ok(WatchEvent::Added(object_from(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"namespace": "default", "name": "intruder", "resourceVersion": "11"},
        })))),
        Ok(WatchEvent::Added(deployment("default", "b", "uid-b", "12"))),
    ]));

    let store = Arc::new(RecordingStore::new());
    let reflector = Arc::new(
        Reflector::new(
            "test-reflector",
            api.clone(),
            store.clone(),
            ReflectorOptions::default(),
        )
        .with_expected_gvk(kube::core::GroupVersionKind::gvk("apps", "v1", "Deployment")),
    );
    let (reflector, tx, handle) = spawn(reflector);

    wait_until(|| reflector.last_sync_resource_version() == "12").await;

    // The foreign object was dropped without touching the store or the version.
    assert_eq!(store.object_names(), names(&["default/a", "default/b"]));

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_bookmark_advances_version_without_store_changes() {
    let api = Arc::new(FakeClusterApi::new());
    api.push_list(Ok(page(vec![deployment("default", "a", "uid-a", "9")], "10", None)));
    api.push_watch(WatchScript::EventsThenPend(vec![Ok(WatchEvent::Bookmark(
        deployment("default", "a", "uid-a", "20"),
    ))]));

    let store = Arc::new(RvTrackingStore::default());
    let (reflector, tx, handle) = spawn_reflector(&api, &store, ReflectorOptions::default());

    wait_until(|| reflector.last_sync_resource_version() == "20").await;

    // No mutation beyond the initial replace, but the capability saw the version.
    assert_eq!(store.inner.object_names(), names(&["default/a"]));
    assert_eq!(store.inner.replace_count(), 1);
    assert!(store.tracked.lock().unwrap().contains(&"20".to_string()));

    tx.shutdown().unwrap();
    handle.await.unwrap();
}

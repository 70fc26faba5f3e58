//! End-to-end behaviour of the replication client over scripted seams.

use replicant_core::core_sync::{
    merge_updates, ApplyOutcome, Connectivity, IncrementalUpdate, LocalStorage, MemoryStorage,
    Model, StoreEvent, SyncClient,
};
use replicant_core::test_utils::{
    test_context, try_drain, try_drain_broadcast, user, wait_for_version, wait_for_watch,
    ScriptedBackend, ScriptedTransport, StreamScript,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

fn client(
    transport: Arc<ScriptedTransport>,
    backend: Arc<ScriptedBackend>,
    delay: Duration,
) -> SyncClient {
    let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::new());
    SyncClient::new(test_context(transport, backend, storage, delay))
}

fn idle_client() -> SyncClient {
    client(
        Arc::new(ScriptedTransport::new()),
        Arc::new(ScriptedBackend::new()),
        Duration::ZERO,
    )
}

fn contents(client: &SyncClient) -> Vec<(String, Vec<Value>)> {
    client
        .store()
        .collections()
        .into_iter()
        .map(|name| {
            let records = client
                .store()
                .get_all(&name)
                .iter()
                .map(|m| m.to_json())
                .collect();
            (name, records)
        })
        .collect()
}

fn name_of(client: &SyncClient, id: u64) -> Option<Value> {
    client
        .store()
        .get_raw("users", id)
        .map(|m| m.to_json()["name"].clone())
}

async fn at_version_10(client: &SyncClient) {
    client
        .apply(IncrementalUpdate::snapshot(10).with_changed("groups", user(1, "staff")))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_repeated_update_is_idempotent() {
    let client = idle_client();
    at_version_10(&client).await;
    let update = IncrementalUpdate::delta(11, 11).with_changed("users", user(5, "A"));

    client.apply(update.clone()).await.unwrap();
    let before = contents(&client);
    assert_eq!(client.apply(update).await.unwrap(), ApplyOutcome::Stale);
    assert_eq!(contents(&client), before);
    assert_eq!(client.store().version(), 11);
}

#[tokio::test]
async fn test_gap_leaves_store_untouched() {
    let client = idle_client();
    let mut resyncs = client.resync_requests().unwrap();
    at_version_10(&client).await;
    let before = contents(&client);

    let outcome = client
        .apply(IncrementalUpdate::delta(12, 14).with_changed("users", user(1, "X")))
        .await
        .unwrap();

    assert_eq!(outcome, ApplyOutcome::Gap);
    assert_eq!(contents(&client), before);
    assert_eq!(client.store().version(), 10);
    assert_eq!(try_drain(&mut resyncs).len(), 1);
}

#[tokio::test]
async fn test_delete_then_recreate_in_one_batch() {
    let client = idle_client();
    at_version_10(&client).await;
    client
        .apply(IncrementalUpdate::delta(11, 11).with_changed("users", user(7, "old")))
        .await
        .unwrap();

    client
        .apply(
            IncrementalUpdate::delta(12, 12)
                .with_deleted("users", 7)
                .with_changed("users", user(7, "new")),
        )
        .await
        .unwrap();

    assert_eq!(name_of(&client, 7), Some(Value::from("new")));
}

#[tokio::test]
async fn test_merged_and_sequential_application_agree() {
    let queue = vec![
        IncrementalUpdate::delta(11, 11).with_changed("users", user(1, "A")),
        IncrementalUpdate::delta(12, 12)
            .with_deleted("users", 1)
            .with_changed("users", user(2, "B")),
        IncrementalUpdate::delta(13, 13).with_changed("users", user(1, "C")),
        IncrementalUpdate::delta(14, 14).with_deleted("groups", 1),
    ];

    let sequential = idle_client();
    at_version_10(&sequential).await;
    for update in &queue {
        sequential.apply(update.clone()).await.unwrap();
    }

    let merged = idle_client();
    at_version_10(&merged).await;
    let runs = merge_updates(&queue);
    assert_eq!(runs.len(), 1);
    for update in runs {
        merged.apply(update).await.unwrap();
    }

    assert_eq!(contents(&merged), contents(&sequential));
    assert_eq!(merged.store().version(), 14);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_burst_commits_once() {
    let client = client(
        Arc::new(ScriptedTransport::new()),
        Arc::new(ScriptedBackend::new()),
        Duration::from_millis(100),
    );
    at_version_10(&client).await;
    client
        .apply(IncrementalUpdate::delta(11, 11).with_changed("users", user(5, "A")))
        .await
        .unwrap();
    assert_eq!(client.store().version(), 11);
    assert_eq!(name_of(&client, 5), Some(Value::from("A")));

    let mut events = client.store().subscribe();
    client.start().await.unwrap();
    let gate = &client.context().throttle;
    gate.new_update(IncrementalUpdate::delta(11, 12).with_deleted("users", 5));
    gate.new_update(IncrementalUpdate::delta(12, 13).with_changed("users", user(5, "B")));
    assert_eq!(gate.pending_len(), 2);

    wait_for_version(client.store(), 13, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(name_of(&client, 5), Some(Value::from("B")));
    assert_eq!(
        try_drain_broadcast(&mut events),
        vec![StoreEvent::Modified { version: 13 }]
    );
    client.stop();
}

#[tokio::test]
async fn test_stream_gap_resolved_by_replay() {
    let transport = Arc::new(ScriptedTransport::new());
    let backend = Arc::new(ScriptedBackend::new());
    let client = client(transport.clone(), backend.clone(), Duration::ZERO);
    at_version_10(&client).await;

    backend.push_elements(
        IncrementalUpdate::delta(11, 13)
            .with_changed("users", user(1, "A"))
            .with_changed("users", user(2, "B")),
    );
    transport.push(
        StreamScript::new(200)
            .line(r#"{"connected":true}"#)
            .update(&IncrementalUpdate::delta(12, 13).with_changed("users", user(2, "B")))
            .keep_open(),
    );

    client.start().await.unwrap();
    wait_for_version(client.store(), 13, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(backend.elements_calls(), vec![Some(10)]);
    assert_eq!(client.store().len("users"), 2);
    client.stop();
}

#[tokio::test(start_paused = true)]
async fn test_fourth_failure_goes_offline() {
    let transport = Arc::new(ScriptedTransport::new());
    for _ in 0..4 {
        transport.push(StreamScript::server_error(502));
    }
    let client = client(
        transport.clone(),
        Arc::new(ScriptedBackend::new()),
        Duration::ZERO,
    );
    let mut connectivity = client.connectivity().subscribe();
    client.start().await.unwrap();

    let state = wait_for_watch(&mut connectivity, Duration::from_secs(60), |c| {
        !c.is_online()
    })
    .await
    .unwrap();

    assert!(matches!(state, Connectivity::Offline(_)));
    assert_eq!(transport.open_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_third_failure_still_retries() {
    let transport = Arc::new(ScriptedTransport::new());
    for _ in 0..3 {
        transport.push(StreamScript::server_error(502));
    }
    transport.push(StreamScript::open_lines(&[r#"{"connected":true}"#]).keep_open());
    let client = client(
        transport.clone(),
        Arc::new(ScriptedBackend::new()),
        Duration::ZERO,
    );
    client.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.open_count(), 4);
    assert!(client.connectivity().get().is_online());
    client.stop();
}

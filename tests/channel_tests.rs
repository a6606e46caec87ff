// Channel state machine tests against a scripted client

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::{ChannelState, DelegateChain, EventFilterDelegate, LogStore, OneCollectorDelegate, Priority};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_retry_backoff_then_discard() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer.clone());
    let client = Arc::new(FakeClient::new(Reply::Status(503)));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    let start = Instant::now();
    for n in 0..5 {
        assert!(channel.handle.enqueue(event(n)).await.is_some());
    }
    channel.handle.flush().unwrap();

    tokio::time::sleep(Duration::from_secs(120)).await;

    let offsets: Vec<u64> = client
        .call_times()
        .iter()
        .map(|t| t.duration_since(start).as_secs())
        .collect();
    assert_eq!(offsets, vec![0, 2, 6, 14]);
    assert_eq!(observer.discarded(), 5);
    assert_eq!(store.total_count().await.unwrap(), 0);

    let status = channel.handle.status().await.unwrap();
    assert_eq!(status.discarded_records, 5);
    assert_eq!(status.state, ChannelState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_retry_succeeds_before_budget_runs_out() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer.clone());
    let client = Arc::new(FakeClient::new(Reply::Status(500)));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    channel.handle.enqueue(event(1)).await.unwrap();
    channel.handle.flush().unwrap();
    settle().await;
    assert_eq!(client.call_count(), 1);

    client.set_reply(Reply::Status(200));
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(client.call_count(), 2);
    assert_eq!(observer.discarded(), 0);
    assert_eq!(store.total_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_discard_without_retry() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer.clone());
    let client = Arc::new(FakeClient::new(Reply::Status(400)));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    for n in 0..3 {
        channel.handle.enqueue(event(n)).await.unwrap();
    }
    channel.handle.flush().unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(client.call_count(), 1);
    assert_eq!(observer.discarded(), 3);
    assert_eq!(store.total_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_batch_in_flight() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer);
    let client = Arc::new(FakeClient::new(Reply::Hold));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(2),
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    // Every critical record is a flush trigger of its own
    for n in 0..6 {
        let record = event(n).with_priority(Priority::Critical);
        channel.handle.enqueue(record).await.unwrap();
    }
    channel.handle.flush().unwrap();
    settle().await;

    assert_eq!(client.call_count(), 1);
    assert_eq!(client.held_count(), 1);
    let status = channel.handle.status().await.unwrap();
    assert_eq!(status.state, ChannelState::AwaitingResponse);
    assert_eq!(status.in_flight_batches, 1);

    let mut rounds = 0;
    while client.complete_held(200) > 0 {
        settle().await;
        assert!(client.held_count() <= 1);
        rounds += 1;
        assert!(rounds < 10, "channel kept sending");
    }

    // First batch held one record, then 2 + 2 + 1
    assert_eq!(client.call_count(), 4);
    assert_eq!(store.total_count().await.unwrap(), 0);
    assert_eq!(channel.handle.status().await.unwrap().delivered_records, 6);
}

#[tokio::test(start_paused = true)]
async fn test_critical_record_flushes_without_waiting() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer);
    let client = Arc::new(FakeClient::new(Reply::Status(200)));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    channel.handle.enqueue(event(1)).await.unwrap();
    settle().await;
    assert_eq!(client.call_count(), 0);

    channel
        .handle
        .enqueue(event(2).with_priority(Priority::Critical))
        .await
        .unwrap();
    settle().await;

    assert_eq!(client.call_count(), 1);
    assert_eq!(store.total_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pending_threshold_triggers_flush() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer);
    let client = Arc::new(FakeClient::new(Reply::Status(200)));
    let mut batch = manual_batch_policy(10);
    batch.pending_threshold = 3;
    let channel = start_channel(
        store.clone(),
        client.clone(),
        batch,
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    for n in 0..2 {
        channel.handle.enqueue(event(n)).await.unwrap();
    }
    settle().await;
    assert_eq!(client.call_count(), 0);

    channel.handle.enqueue(event(2)).await.unwrap();
    settle().await;
    assert_eq!(client.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_pending_records() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer);
    let client = Arc::new(FakeClient::new(Reply::Status(200)));
    let mut batch = manual_batch_policy(10);
    batch.flush_interval = Duration::from_secs(3);
    let channel = start_channel(
        store.clone(),
        client.clone(),
        batch,
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    channel.handle.enqueue(event(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;

    assert_eq!(client.call_count(), 1);
    assert_eq!(store.total_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disable_suspends_and_keeps_records() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer.clone());
    let client = Arc::new(FakeClient::new(Reply::Hold));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    for n in 0..3 {
        channel.handle.enqueue(event(n)).await.unwrap();
    }
    channel.handle.flush().unwrap();
    settle().await;
    assert_eq!(client.held_count(), 1);

    channel.handle.set_enabled(false).unwrap();
    settle().await;

    let status = channel.handle.status().await.unwrap();
    assert_eq!(status.state, ChannelState::Suspended);
    assert_eq!(status.pending, 3);
    assert!(client.held_all_canceled());

    // A late answer for the abandoned batch changes nothing
    client.complete_held(200);
    settle().await;
    assert_eq!(store.total_count().await.unwrap(), 3);

    // Triggers while suspended do not reach the client
    channel.handle.flush().unwrap();
    settle().await;
    assert_eq!(client.call_count(), 1);

    client.set_reply(Reply::Status(200));
    channel.handle.set_enabled(true).unwrap();
    channel.handle.flush().unwrap();
    settle().await;

    assert_eq!(client.call_count(), 2);
    assert_eq!(store.total_count().await.unwrap(), 0);
    assert_eq!(observer.discarded(), 0);
    assert_eq!(channel.handle.status().await.unwrap().delivered_records, 3);
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer);
    let client = Arc::new(FakeClient::new(Reply::Status(200)));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    channel.handle.pause().unwrap();
    channel
        .handle
        .enqueue(event(1).with_priority(Priority::Critical))
        .await
        .unwrap();
    settle().await;

    assert_eq!(client.call_count(), 0);
    assert!(channel.enablement.is_enabled(DESTINATION));
    assert_eq!(channel.handle.status().await.unwrap().state, ChannelState::Suspended);

    channel.handle.resume().unwrap();
    settle().await;

    assert_eq!(client.call_count(), 1);
    assert_eq!(store.total_count().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delegates_drop_and_redirect() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer.clone());
    let client = Arc::new(FakeClient::new(Reply::Status(200)));
    let delegates = DelegateChain::new()
        .with(Arc::new(EventFilterDelegate::new(["debug"])))
        .with(Arc::new(OneCollectorDelegate::new(
            ["crash"],
            "install-test",
            "https://alt.example",
        )));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        delegates,
    );

    let debug = telemetry_pipeline::Record::new(DESTINATION, "debug", serde_json::json!({}));
    let crash = telemetry_pipeline::Record::new(DESTINATION, "crash", serde_json::json!({}));
    channel.handle.enqueue(debug).await.unwrap();
    channel.handle.enqueue(crash).await.unwrap();
    channel.handle.enqueue(event(1)).await.unwrap();
    channel.handle.flush().unwrap();
    settle().await;

    let mut urls = client.urls();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "https://alt.example/OneCollector/1.0/".to_string(),
            format!("{}/logs?api-version=1.0.0", DEFAULT_URL),
        ]
    );

    let status = channel.handle.status().await.unwrap();
    assert_eq!(status.dropped_records, 1);
    assert_eq!(status.delivered_records, 2);
    assert_eq!(store.total_count().await.unwrap(), 0);
    assert_eq!(observer.discarded(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_of_only_dropped_records_makes_no_call() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer);
    let client = Arc::new(FakeClient::new(Reply::Status(200)));
    let delegates = DelegateChain::new().with(Arc::new(EventFilterDelegate::new(["event"])));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        delegates,
    );

    for n in 0..4 {
        channel.handle.enqueue(event(n)).await.unwrap();
    }
    channel.handle.flush().unwrap();
    settle().await;

    assert_eq!(client.call_count(), 0);
    assert_eq!(store.total_count().await.unwrap(), 0);
    let status = channel.handle.status().await.unwrap();
    assert_eq!(status.state, ChannelState::Idle);
    assert_eq!(status.dropped_records, 4);
}

#[tokio::test(start_paused = true)]
async fn test_log_url_change_applies_to_next_batch() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer);
    let client = Arc::new(FakeClient::new(Reply::Hold));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(1),
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    channel.handle.enqueue(event(1)).await.unwrap();
    channel.handle.enqueue(event(2)).await.unwrap();
    channel.handle.flush().unwrap();
    settle().await;

    channel.handle.set_log_url("https://in2.example.com");
    client.complete_held(200);
    settle().await;
    client.complete_held(200);
    settle().await;

    assert_eq!(
        client.urls(),
        vec![
            format!("{}/logs?api-version=1.0.0", DEFAULT_URL),
            "https://in2.example.com/logs?api-version=1.0.0".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_returns_in_flight_records_to_pending() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer);
    let client = Arc::new(FakeClient::new(Reply::Hold));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    channel.handle.enqueue(event(1)).await.unwrap();
    channel.handle.flush().unwrap();
    settle().await;
    assert_eq!(store.pending_count(DESTINATION).await.unwrap(), 0);

    channel.handle.shutdown().await.unwrap();
    assert_eq!(store.pending_count(DESTINATION).await.unwrap(), 1);
    assert!(channel.handle.flush().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_zero_flush_interval_keeps_channel_running() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer);
    let client = Arc::new(FakeClient::new(Reply::Status(200)));
    let mut batch = manual_batch_policy(10);
    batch.flush_interval = Duration::ZERO;
    let channel = start_channel(
        store.clone(),
        client.clone(),
        batch,
        retry_policy(2, 3),
        DelegateChain::new(),
    );

    assert!(channel.handle.enqueue(event(1)).await.is_some());
    settle().await;

    assert_eq!(client.call_count(), 1);
    assert_eq!(store.total_count().await.unwrap(), 0);
    assert!(channel.handle.status().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_redirected_retry_repeats_sequence_number() {
    let observer = Arc::new(CountingObserver::default());
    let store = memory_store(observer.clone());
    let client = Arc::new(FakeClient::new(Reply::Status(503)));
    let delegates = DelegateChain::new().with(Arc::new(OneCollectorDelegate::new(
        ["crash"],
        "install-test",
        "https://alt.example",
    )));
    let channel = start_channel(
        store.clone(),
        client.clone(),
        manual_batch_policy(10),
        retry_policy(2, 3),
        delegates,
    );

    let crash = telemetry_pipeline::Record::new(DESTINATION, "crash", serde_json::json!({}));
    let id = channel.handle.enqueue(crash).await.unwrap();
    channel.handle.flush().unwrap();
    settle().await;
    assert_eq!(client.call_count(), 1);

    client.set_reply(Reply::Status(200));
    tokio::time::sleep(Duration::from_secs(3)).await;

    let seqs: Vec<serde_json::Value> = client
        .bodies()
        .iter()
        .map(|body| {
            let line: serde_json::Value = serde_json::from_str(body.trim_end()).unwrap();
            line["ext"]["sdk"]["seq"].clone()
        })
        .collect();
    assert_eq!(seqs, vec![serde_json::json!(id.0), serde_json::json!(id.0)]);
    assert_eq!(store.total_count().await.unwrap(), 0);
}

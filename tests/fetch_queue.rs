//! Read dispatch: sharing, supersession, deduplication and retries.

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::cache::CacheEvent;
use courier::queue::QueueEvent;
use courier::{Builder, DispatchError, HttpMethod};
use serde_json::json;

use support::ScriptedTransport;

async fn built() -> (Arc<Builder>, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new());
    let builder = Arc::new(Builder::new(transport.clone()));
    builder.build().await.expect("build");
    (builder, transport)
}

#[tokio::test]
async fn concurrent_reads_share_one_execution() {
    let (builder, transport) = built().await;
    transport.delay("/users", Duration::from_millis(50));

    let command = builder
        .create_command(HttpMethod::Get, "/users")
        .expect("command");
    let (a, b, c) = tokio::join!(
        builder.dispatch(command.clone()),
        builder.dispatch(command.clone()),
        builder.dispatch(command.clone()),
    );

    let a = a.expect("first");
    assert_eq!(a, b.expect("second"));
    assert_eq!(a, c.expect("third"));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn cancelable_read_supersedes_the_live_one() {
    let (builder, transport) = built().await;
    transport.delay("/search?q=a", Duration::from_millis(500));

    let search = |term: &str| {
        builder
            .create_command(HttpMethod::Get, "/search")
            .expect("command")
            .query("q", term)
            .cancelable(true)
            .with_request_key("search")
            .with_cache_key("search")
    };

    let slow = {
        let builder = Arc::clone(&builder);
        let command = search("a");
        tokio::spawn(async move { builder.dispatch(command).await })
    };
    support::eventually(|| {
        let transport = Arc::clone(&transport);
        async move { transport.call_count() == 1 }
    })
    .await;

    let latest = search("ab");
    let fast = builder.dispatch(latest.clone()).await.expect("latest settles");
    assert_eq!(fast.data(), Some(&json!({ "path": "/search?q=ab", "body": null })));

    let superseded = slow.await.expect("task");
    assert!(matches!(superseded, Err(DispatchError::Superseded)));

    let cached = builder
        .cache()
        .get(&latest.cache_space(), "search")
        .expect("cached");
    assert_eq!(cached.response, fast);
}

#[tokio::test]
async fn superseded_read_landing_last_leaves_the_cache_alone() {
    let (builder, transport) = built().await;
    transport.ignore_cancel();
    transport.delay("/search?q=a", Duration::from_millis(200));

    let writes = Arc::new(Mutex::new(Vec::new()));
    builder.cache().subscribe({
        let writes = Arc::clone(&writes);
        move |event: &CacheEvent| {
            if let CacheEvent::Set { entry, .. } = event {
                writes.lock().unwrap().push(entry.response.clone());
            }
        }
    });

    let search = |term: &str| {
        builder
            .create_command(HttpMethod::Get, "/search")
            .expect("command")
            .query("q", term)
            .cancelable(true)
            .with_request_key("search")
            .with_cache_key("search")
    };

    let slow = {
        let builder = Arc::clone(&builder);
        let command = search("a");
        tokio::spawn(async move { builder.dispatch(command).await })
    };
    support::eventually(|| {
        let transport = Arc::clone(&transport);
        async move { transport.call_count() == 1 }
    })
    .await;

    let latest = search("ab");
    let fast = builder.dispatch(latest.clone()).await.expect("latest settles");
    assert_eq!(transport.in_flight(), 1);

    let superseded = slow.await.expect("task");
    assert!(matches!(superseded, Err(DispatchError::Superseded)));
    assert_eq!(transport.in_flight(), 0);

    let cached = builder
        .cache()
        .get(&latest.cache_space(), "search")
        .expect("cached");
    assert_eq!(cached.response, fast);
    assert_eq!(*writes.lock().unwrap(), vec![fast]);
}

#[tokio::test]
async fn recent_settlement_is_reused_inside_the_window() {
    let (builder, transport) = built().await;
    let command = builder
        .create_command(HttpMethod::Get, "/settings")
        .expect("command")
        .deduplicate(true)
        .deduplicate_time(Duration::from_secs(5));

    let first = builder.dispatch(command.clone()).await.expect("first");
    let second = builder.dispatch(command.clone()).await.expect("second");

    assert_eq!(first, second);
    assert_eq!(transport.call_count(), 1);

    let outside = command.deduplicate(false);
    builder.dispatch(outside).await.expect("third");
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn failed_attempts_are_retried() {
    let (builder, transport) = built().await;
    transport.fail_times("/feed", 2);

    let command = builder
        .create_command(HttpMethod::Get, "/feed")
        .expect("command")
        .retry(2)
        .retry_time(Duration::from_millis(1));
    let response = builder.dispatch(command).await.expect("settles on third try");

    assert!(response.is_success());
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn exhausted_retries_report_attempts() {
    let (builder, transport) = built().await;
    transport.fail_times("/feed", 10);

    let command = builder
        .create_command(HttpMethod::Get, "/feed")
        .expect("command")
        .retry(1)
        .retry_time(Duration::from_millis(1));
    let err = builder.dispatch(command).await.expect_err("fails");

    match err {
        DispatchError::RetryExhausted { attempts, response } => {
            assert_eq!(attempts, 2);
            assert_eq!(response.status, Some(503));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn loading_brackets_each_execution() {
    let (builder, _) = built().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    builder.fetch_queue().subscribe({
        let seen = Arc::clone(&seen);
        move |event: &QueueEvent| seen.lock().unwrap().push(event.clone())
    });

    let command = builder
        .create_command(HttpMethod::Get, "/users")
        .expect("command");
    builder.dispatch(command).await.expect("settled");

    let seen = seen.lock().unwrap();
    let loading: Vec<bool> = seen
        .iter()
        .filter_map(|event| match event {
            QueueEvent::Loading { loading, .. } => Some(*loading),
            _ => None,
        })
        .collect();
    assert_eq!(loading, vec![true, false]);
    assert!(
        seen.iter()
            .any(|event| matches!(event, QueueEvent::Settled { success: true, .. }))
    );
}

#[tokio::test]
async fn running_requests_are_visible_until_settled() {
    let (builder, transport) = built().await;
    transport.delay("/slow", Duration::from_millis(100));

    let command = builder
        .create_command(HttpMethod::Get, "/slow")
        .expect("command");
    let pending = {
        let builder = Arc::clone(&builder);
        let command = command.clone();
        tokio::spawn(async move { builder.dispatch(command).await })
    };

    support::eventually(|| {
        let builder = Arc::clone(&builder);
        async move { builder.fetch_queue().get_all_running_requests().len() == 1 }
    })
    .await;
    let running = builder
        .fetch_queue()
        .get(&command.request_key())
        .expect("running");
    assert_eq!(running.endpoint, "/slow");

    pending.await.expect("task").expect("settled");
    assert!(builder.fetch_queue().get_all_running_requests().is_empty());
}

//! Builder setup, interceptors, actions and isolation.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier::transport::ClientResponse;
use courier::{Action, Builder, DispatchError, HttpMethod, SetupError};
use serde_json::json;

use support::ScriptedTransport;

#[tokio::test]
async fn setup_errors_are_reported() {
    let builder = Builder::new(Arc::new(ScriptedTransport::new()));

    assert!(matches!(
        builder.create_command(HttpMethod::Get, "/users"),
        Err(SetupError::NotBuilt)
    ));
    builder
        .add_actions([Action::new("notify"), Action::new("audit")])
        .expect("unique names");
    let err = builder
        .add_actions([Action::new("notify")])
        .expect_err("duplicate");
    assert_eq!(
        err.to_string(),
        "action names must be unique: notify is already registered"
    );

    builder.build().await.expect("build");
    assert!(builder.is_built());
    assert!(matches!(
        builder.add_actions([Action::new("late")]),
        Err(SetupError::AlreadyBuilt)
    ));
}

#[tokio::test]
async fn interceptors_wrap_every_attempt() {
    let transport = Arc::new(ScriptedTransport::new());
    let builder = Builder::new(transport.clone());
    builder
        .on_request(|command| command.query("token", "abc"))
        .on_response(|response, command| {
            let payload = json!({
                "wrapped": response.data().cloned(),
                "endpoint": command.endpoint,
            });
            ClientResponse::success(payload).with_status(response.status.unwrap_or(200))
        });
    builder.build().await.expect("build");

    let command = builder
        .create_command(HttpMethod::Get, "/users")
        .expect("command");
    let response = builder.dispatch(command).await.expect("settled");

    assert_eq!(transport.calls(), vec!["/users?token=abc"]);
    assert_eq!(
        response.data(),
        Some(&json!({
            "wrapped": { "path": "/users?token=abc", "body": null },
            "endpoint": "/users",
        }))
    );
}

#[tokio::test]
async fn commands_can_opt_out_of_interceptors() {
    let transport = Arc::new(ScriptedTransport::new());
    let builder = Builder::new(transport.clone());
    builder
        .on_request(|command| command.query("token", "abc"))
        .on_response(|_, _| ClientResponse::failure(json!("rewritten")));
    builder.build().await.expect("build");

    let command = builder
        .create_command(HttpMethod::Get, "/public")
        .expect("command")
        .disable_request_interceptors(true)
        .disable_response_interceptors(true);
    let response = builder.dispatch(command).await.expect("settled");

    assert_eq!(transport.calls(), vec!["/public"]);
    assert!(response.is_success());
}

#[tokio::test]
async fn actions_observe_failures() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.fail_times("/orders", 1);
    let builder = Builder::new(transport);

    let failures = Arc::new(Mutex::new(Vec::new()));
    builder
        .add_actions([Action::new("report").on_error({
            let failures = Arc::clone(&failures);
            move |command, err: &DispatchError| {
                failures
                    .lock()
                    .unwrap()
                    .push((command.endpoint.clone(), err.kind()));
            }
        })])
        .expect("actions");
    builder.build().await.expect("build");

    let command = builder
        .create_command(HttpMethod::Post, "/orders")
        .expect("command")
        .action("report");
    builder.dispatch(command).await.expect_err("fails");

    assert_eq!(
        *failures.lock().unwrap(),
        vec![("/orders".to_string(), "transport")]
    );
}

#[tokio::test]
async fn panicking_action_does_not_break_dispatch() {
    let builder = Builder::new(Arc::new(ScriptedTransport::new()));
    builder
        .add_actions([Action::new("explode").on_start(|_| panic!("handler bug"))])
        .expect("actions");
    builder.build().await.expect("build");

    let command = builder
        .create_command(HttpMethod::Get, "/users")
        .expect("command")
        .action("explode");
    assert!(builder.dispatch(command).await.is_ok());
}

#[tokio::test]
async fn panicking_subscriber_is_isolated() {
    let builder = Builder::new(Arc::new(ScriptedTransport::new()));
    builder.build().await.expect("build");

    let delivered = Arc::new(AtomicUsize::new(0));
    builder.cache().subscribe(|_| panic!("subscriber bug"));
    builder.cache().subscribe({
        let delivered = Arc::clone(&delivered);
        move |_| {
            delivered.fetch_add(1, Ordering::SeqCst);
        }
    });

    let command = builder
        .create_command(HttpMethod::Get, "/users")
        .expect("command");
    builder.dispatch(command).await.expect("settled");

    assert_eq!(delivered.load(Ordering::SeqCst), 1);
    assert_eq!(builder.subscriber_failures(), 1);
}

#[tokio::test]
async fn builders_share_nothing() {
    let first = Builder::new(Arc::new(ScriptedTransport::new()));
    let second = Builder::new(Arc::new(ScriptedTransport::new()));
    first.build().await.expect("build");
    second.build().await.expect("build");

    let seen = Arc::new(AtomicUsize::new(0));
    second.cache().subscribe({
        let seen = Arc::clone(&seen);
        move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    let command = first
        .create_command(HttpMethod::Get, "/users")
        .expect("command");
    first.dispatch(command.clone()).await.expect("settled");

    assert!(first.cached(&command).is_some());
    assert!(second.cached(&command).is_none());
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    first.clear().await;
    assert!(first.cached(&command).is_none());
    second.dispatch(command.clone()).await.expect("settled");
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn clear_discards_in_flight_work() {
    let transport = Arc::new(ScriptedTransport::new());
    transport.ignore_cancel();
    transport.delay("/users", Duration::from_millis(100));
    transport.delay("/orders", Duration::from_millis(100));
    let builder = Arc::new(Builder::new(transport.clone()));
    builder.build().await.expect("build");

    let read = builder
        .create_command(HttpMethod::Get, "/users")
        .expect("command");
    let fetch = {
        let builder = Arc::clone(&builder);
        tokio::spawn(async move { builder.dispatch(read).await })
    };
    let write = builder
        .create_command(HttpMethod::Post, "/orders")
        .expect("command");
    let submitted = builder.submit(write).await.expect("enqueued");

    support::eventually(|| {
        let transport = Arc::clone(&transport);
        async move { transport.in_flight() == 2 }
    })
    .await;
    assert_eq!(builder.fetch_queue().get_all_running_requests().len(), 1);
    assert_eq!(builder.submit_queue().get_all_running_requests().len(), 1);

    builder.clear().await;

    assert!(builder.cache().keys().is_empty());
    assert!(builder.fetch_queue().get_all_running_requests().is_empty());
    assert!(builder.submit_queue().get_all_running_requests().is_empty());

    assert!(matches!(submitted.await, Err(DispatchError::Dropped)));
    let fetched = fetch.await.expect("task");
    assert!(matches!(fetched, Err(DispatchError::Superseded)));

    support::eventually(|| {
        let transport = Arc::clone(&transport);
        async move { transport.in_flight() == 0 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(builder.cache().keys().is_empty());
}

//! The fetch/timeout race and its bookkeeping.

use freshet_client::{FetchError, PendingValue, ResourceStatus};
use freshet_test_utils::assertions::{assert_failed, assert_received, assert_timed_out};
use freshet_test_utils::{delayed, never_settles, DataEvent, Harness, ResourceName, ScriptedRead};
use serde_json::json;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_never_settling_fetch_times_out() {
    let h = Harness::new(ScriptedRead::new()).unwrap();

    let pending = h
        .client
        .wait_for_data("thing:1", never_settles(), Duration::from_millis(10));
    assert_eq!(h.client.state().status("thing:1"), ResourceStatus::Requesting);
    assert_eq!(h.hooks.requested("thing:1"), 1);

    let outcome = pending.await;
    assert_timed_out(&outcome, Duration::from_millis(10));
    assert_eq!(outcome.error().map(|e| e.message.as_str()), Some("Timeout of 10 reached."));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.hooks.received("thing:1"), 0);
    assert_eq!(h.hooks.errored("thing:1"), 1);

    let state = h.client.state();
    let resource = state.get("thing:1").unwrap();
    assert!(resource.error.as_ref().is_some_and(FetchError::is_timeout));
    assert_eq!(h.client.metrics().timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_result_is_discarded() {
    let h = Harness::new(ScriptedRead::new()).unwrap();

    let outcome = h
        .client
        .wait_for_data(
            "thing:1",
            delayed(Duration::from_millis(50), json!("late")),
            Duration::from_millis(10),
        )
        .await;
    assert_timed_out(&outcome, Duration::from_millis(10));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.hooks.settled("thing:1"), 1);
    assert_eq!(h.hooks.received("thing:1"), 0);
    assert_eq!(h.client.data("thing:1"), None);
}

#[tokio::test(start_paused = true)]
async fn test_success_before_timeout() {
    let h = Harness::new(ScriptedRead::new()).unwrap();

    let outcome = h
        .client
        .wait_for_data(
            "thing:1",
            delayed(Duration::from_millis(5), json!({ "id": 1 })),
            Duration::from_millis(10),
        )
        .await;
    assert_received(&outcome, &json!({ "id": 1 }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.hooks.events(),
        vec![
            DataEvent::Requested(ResourceName::from("thing:1")),
            DataEvent::Received(ResourceName::from("thing:1"), json!({ "id": 1 })),
        ]
    );
    assert_eq!(h.client.metrics().timeouts, 0);
    assert_eq!(h.client.state().status("thing:1"), ResourceStatus::Holding);
}

#[tokio::test(start_paused = true)]
async fn test_failure_is_a_value_and_keeps_data() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    h.seed_received("thing:1", Duration::from_secs(5), json!("old"));

    let error = FetchError::new("boom").with_payload(json!({ "status": 500 }));
    let outcome = h
        .client
        .wait_for_data("thing:1", PendingValue::failed(error), Duration::from_secs(1))
        .await;
    assert_failed(&outcome, "boom");
    assert!(!outcome.is_timeout());

    let state = h.client.state();
    let resource = state.get("thing:1").unwrap();
    assert_eq!(resource.data, Some(json!("old")));
    assert_eq!(
        resource.error.as_ref().and_then(|e| e.payload.clone()),
        Some(json!({ "status": 500 }))
    );

    // The next success clears the error.
    h.client
        .wait_for_data("thing:1", PendingValue::ready(json!("new")), Duration::from_secs(1))
        .await;
    let state = h.client.state();
    let resource = state.get("thing:1").unwrap();
    assert_eq!(resource.data, Some(json!("new")));
    assert!(resource.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_watch_sees_request_and_receipt() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    let mut rx = h.client.watch();

    let pending = h.client.wait_for_data(
        "thing:1",
        delayed(Duration::from_millis(5), json!(1)),
        Duration::from_secs(1),
    );
    assert!(rx.has_changed().unwrap());
    assert_eq!(
        rx.borrow_and_update().status("thing:1"),
        ResourceStatus::Requesting
    );

    pending.await;
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow().status("thing:1"), ResourceStatus::Holding);
}

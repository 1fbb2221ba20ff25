//! End-to-end scheduling: registration, evaluation and the wake timer.

use chrono::TimeDelta;
use freshet_client::{Api, Client, ClientConfig, Clock, ResourceName, ResourceStatus};
use freshet_core::RequirementDeclaration;
use freshet_test_utils::assertions::assert_missing_read;
use freshet_test_utils::{init_test_tracing, Harness, ManualTimer, Response, ScriptedRead};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fresh(resource: &str, secs: u64) -> RequirementDeclaration {
    RequirementDeclaration::new(resource).with_freshness(Duration::from_secs(secs))
}

#[tokio::test(start_paused = true)]
async fn test_stale_resource_dispatches_exactly_one_read() {
    init_test_tracing();
    let h = Harness::new(ScriptedRead::new()).unwrap();
    h.seed_received("thing:1", Duration::from_secs(92), json!("old"));

    let consumer = h.client.add_consumer();
    assert!(h.client.register(consumer, Some(vec![fresh("thing:1", 90)])));
    assert_eq!(h.read.call_count(), 0, "registration must not fetch");

    let dispatch = h.client.evaluate_and_fetch().unwrap();
    assert_eq!(dispatch.stale, vec![ResourceName::from("thing:1")]);
    assert_eq!(h.read.calls(), vec![vec![ResourceName::from("thing:1")]]);

    let outcomes = dispatch.settled().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(h.client.data("thing:1"), Some(json!("thing:1")));
}

#[tokio::test(start_paused = true)]
async fn test_fresh_resource_dispatches_nothing() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    h.seed_received("thing:1", Duration::from_secs(92), json!("old"));

    let consumer = h.client.add_consumer();
    h.client.register(consumer, Some(vec![fresh("thing:1", 95)]));
    assert_eq!(h.timer.pending_delay(), Some(Duration::from_secs(3)));

    let dispatch = h.client.evaluate_and_fetch().unwrap();
    assert!(dispatch.is_empty());
    assert!(dispatch.stale.is_empty());
    assert_eq!(h.read.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wake_timer_runs_evaluation() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    h.seed_received("thing:1", Duration::from_secs(92), json!("old"));
    h.client
        .register(h.client.add_consumer(), Some(vec![fresh("thing:1", 90)]));

    assert!(h.timer.fire());
    assert_eq!(h.read.times_requested("thing:1"), 1);

    let mut rx = h.client.watch();
    let state = rx
        .wait_for(|state| state.data("thing:1") == Some(&json!("thing:1")))
        .await
        .unwrap()
        .clone();
    assert_eq!(state.status("thing:1"), ResourceStatus::Holding);
    assert!(h.client.has_pending_timer());
}

#[tokio::test(start_paused = true)]
async fn test_identical_registration_leaves_timer_alone() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    let consumer = h.client.add_consumer();

    assert!(h.client.register(consumer, Some(vec![fresh("a", 30), fresh("b", 60)])));
    let schedules = h.timer.schedules();
    let cancels = h.timer.cancels();

    assert!(!h.client.register(consumer, Some(vec![fresh("a", 30), fresh("b", 60)])));
    assert!(!h.client.register(consumer, Some(vec![fresh("b", 60), fresh("a", 30)])));
    assert_eq!(h.timer.schedules(), schedules);
    assert_eq!(h.timer.cancels(), cancels);

    // A second consumer with looser bounds does not change the aggregate either.
    assert!(!h.client.register(h.client.add_consumer(), Some(vec![fresh("a", 90)])));
    assert_eq!(h.timer.schedules(), schedules);
}

#[tokio::test(start_paused = true)]
async fn test_no_requirements_leaves_timer_unset() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    let consumer = h.client.add_consumer();
    h.client.register(consumer, Some(vec![fresh("a", 30)]));
    assert!(h.client.has_pending_timer());

    h.client.evaluate_and_fetch().unwrap().settled().await;
    assert!(h.client.has_pending_timer());

    assert!(h.client.register(consumer, None));
    assert!(!h.client.has_pending_timer());
    assert_eq!(h.timer.pending_count(), 0);

    let dispatch = h.client.evaluate_and_fetch().unwrap();
    assert!(dispatch.is_empty());
    assert!(!h.client.has_pending_timer());
    assert_eq!(h.timer.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_delay_is_clamped_to_configured_range() {
    let config = ClientConfig::new()
        .with_min_update_delay(Duration::from_millis(50))
        .with_max_update_delay(Duration::from_secs(10));
    let h = Harness::with_config(ScriptedRead::new(), config).unwrap();

    // Never received: already overdue, so the floor applies.
    h.client
        .register(h.client.add_consumer(), Some(vec![fresh("a", 30)]));
    assert_eq!(h.timer.pending_delay(), Some(Duration::from_millis(50)));

    // Received and fresh for 30s: the next check is beyond the ceiling.
    h.client.evaluate_and_fetch().unwrap().settled().await;
    h.clock.advance(Duration::from_secs(1));
    h.client.update_timer(None);
    assert_eq!(h.timer.pending_delay(), Some(Duration::from_secs(10)));
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_requirement_sleeps_until_ceiling() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    h.client.register(
        h.client.add_consumer(),
        Some(vec![RequirementDeclaration::new("b")]),
    );
    h.client.evaluate_and_fetch().unwrap().settled().await;

    // Received once with no freshness bound: never stale again.
    assert_eq!(h.timer.pending_delay(), Some(Duration::from_secs(60)));
    let dispatch = h.client.evaluate_and_fetch().unwrap();
    assert!(dispatch.is_empty());
    assert_eq!(h.read.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_delay_overrides_schedule() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    h.client.update_timer(Some(Duration::from_secs(7)));
    assert_eq!(h.timer.pending_delay(), Some(Duration::from_secs(7)));
    assert_eq!(h.timer.pending_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_fetch_in_flight() {
    let read = ScriptedRead::new().respond("a", Response::Never);
    let h = Harness::new(read).unwrap();
    h.client.register(
        h.client.add_consumer(),
        Some(vec![fresh("a", 1).with_timeout(Duration::from_secs(30))]),
    );

    let first = h.client.evaluate_and_fetch().unwrap();
    assert_eq!(first.pending.len(), 1);

    // Freshness has long expired, but the outstanding fetch suppresses it.
    h.clock.advance(Duration::from_secs(10));
    let second = h.client.evaluate_and_fetch().unwrap();
    assert!(second.stale.is_empty());
    assert_eq!(h.read.call_count(), 1);

    // Past the timeout the liveness branch re-fetches.
    h.clock.advance(Duration::from_secs(25));
    let third = h.client.evaluate_and_fetch().unwrap();
    assert_eq!(third.stale, vec![ResourceName::from("a")]);
    assert_eq!(h.read.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_restored_outstanding_fetch_is_retried() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    h.seed_requested("thing:1", Duration::from_secs(3600));
    h.seed_requested("thing:2", Duration::from_secs(10));
    h.client.register(
        h.client.add_consumer(),
        Some(vec![fresh("thing:1", 90), fresh("thing:2", 90)]),
    );

    // No timeout is declared, so the default timeout bounds both fetches.
    let dispatch = h.client.evaluate_and_fetch().unwrap();
    assert_eq!(dispatch.stale, vec![ResourceName::from("thing:1")]);
    dispatch.settled().await;
    assert_eq!(h.client.state().status("thing:1"), ResourceStatus::Holding);
    assert_eq!(h.client.state().status("thing:2"), ResourceStatus::Requesting);
    assert_eq!(h.timer.pending_delay(), Some(Duration::from_secs(20)));

    h.clock.advance(Duration::from_secs(21));
    let dispatch = h.client.evaluate_and_fetch().unwrap();
    assert_eq!(dispatch.stale, vec![ResourceName::from("thing:2")]);
    assert_eq!(h.read.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_settlement_is_not_recorded_before_request() {
    let h = Harness::new(ScriptedRead::new()).unwrap();
    h.client
        .register(h.client.add_consumer(), Some(vec![fresh("thing:1", 90)]));

    let later = h.clock.now() + TimeDelta::seconds(5);
    h.client.evaluate_and_fetch_at(later).unwrap().settled().await;

    let state = h.client.state();
    let resource = state.get("thing:1").unwrap();
    assert_eq!(resource.last_requested, Some(later));
    assert_eq!(resource.last_received, Some(later));
    assert_eq!(state.status("thing:1"), ResourceStatus::Holding);
}

#[tokio::test(start_paused = true)]
async fn test_tighter_timeout_does_not_shorten_inflight_wait() {
    let read = ScriptedRead::new().respond("a", Response::Never);
    let h = Harness::new(read).unwrap();
    h.client.register(
        h.client.add_consumer(),
        Some(vec![RequirementDeclaration::new("a").with_timeout(Duration::from_secs(30))]),
    );

    let mut first = h.client.evaluate_and_fetch().unwrap();
    let first = first.pending.pop().unwrap();

    assert!(h.client.register(
        h.client.add_consumer(),
        Some(vec![RequirementDeclaration::new("a").with_timeout(Duration::from_secs(5))]),
    ));

    tokio::time::sleep(Duration::from_secs(6)).await;
    h.clock.advance(Duration::from_secs(6));
    assert!(!first.is_finished());
    assert_eq!(h.hooks.errored("a"), 0);

    // The scheduler already uses the tighter bound.
    let mut second = h.client.evaluate_and_fetch().unwrap();
    assert_eq!(second.stale, vec![ResourceName::from("a")]);
    let second = second.pending.pop().unwrap();

    let outcome = second.await;
    freshet_test_utils::assertions::assert_timed_out(&outcome, Duration::from_secs(5));

    let outcome = first.await;
    freshet_test_utils::assertions::assert_timed_out(&outcome, Duration::from_secs(30));
    assert_eq!(h.hooks.requested("a"), 2);
    assert_eq!(h.hooks.errored("a"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_missing_read_is_fatal_at_dispatch() {
    let timer = ManualTimer::new();
    let api = Api::builder().build();
    let client = Client::builder(Arc::new(api), "k")
        .timer(timer.clone())
        .build()
        .unwrap();

    client.register(client.add_consumer(), Some(vec![fresh("a", 30)]));
    assert_missing_read(&client.evaluate_and_fetch());

    // Only "read" is mandatory.
    let outcomes = client
        .apply_operation("refresh", &[ResourceName::from("a")], None)
        .unwrap();
    assert!(outcomes.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unrequested_resources_are_ignored() {
    let read = ScriptedRead::new().also_return("extra", Response::Data(json!(1)));
    let h = Harness::new(read).unwrap();
    h.client
        .register(h.client.add_consumer(), Some(vec![fresh("a", 30)]));

    let outcomes = h.client.evaluate_and_fetch().unwrap().settled().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].resource().as_str(), "a");
    assert_eq!(h.hooks.requested("extra"), 0);
    assert!(h.client.state().get("extra").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_tokio_timer_drives_fetch() {
    let read = ScriptedRead::new();
    let api = Api::builder().read(read.clone()).build();
    let client = Client::new(Arc::new(api), "k").unwrap();

    client.register(
        client.add_consumer(),
        Some(vec![RequirementDeclaration::new("thing:1")]),
    );
    assert_eq!(read.call_count(), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut rx = client.watch();
    rx.wait_for(|state| state.status("thing:1") == ResourceStatus::Holding)
        .await
        .unwrap();
    assert_eq!(read.call_count(), 1);
    assert_eq!(client.data("thing:1"), Some(json!("thing:1")));

    // Unbounded freshness: nothing else to fetch.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(read.call_count(), 1);

    let metrics = client.metrics();
    assert_eq!(metrics.fetches_dispatched, 1);
    assert_eq!(metrics.data_received, 1);
    assert_eq!(metrics.in_flight(), 0);
}

//! freshet test utilities
//!
//! Shared test infrastructure for the freshet workspace:
//! - Proptest generators for declarations and bounds
//! - Deterministic clock and timer fixtures
//! - Recording data hooks and scripted read operations
//! - Assertions over fetch outcomes and results

pub use freshet_client::{
    Api, BoundMethods, Client, Clock, DataHandlers, FetchOutcome, OperationHandler, PendingValue,
    Timer, TimerCallback, TimerHandle,
};
pub use freshet_core::{
    AggregateRequirement, ClientConfig, ClientKey, ClientState, ConfigError, ConsumerId,
    FetchError, FreshetError, FreshetResult, RequirementDeclaration, ResourceName, ResourceState,
    Timestamp,
};

use chrono::{TimeDelta, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install a test tracing subscriber. Safe to call from every test.
///
/// Honours `RUST_LOG`, defaulting to `freshet=debug`.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("freshet=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// CLOCK AND TIMER FIXTURES
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Timestamp>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    /// A clock starting at the current wall-clock time.
    pub fn starting_now() -> Arc<Self> {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = locked(&self.now);
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }

    pub fn set(&self, at: Timestamp) {
        *locked(&self.now) = at;
    }

    /// The instant `ago` before now.
    pub fn before(&self, ago: Duration) -> Timestamp {
        let now = self.now();
        TimeDelta::from_std(ago)
            .ok()
            .and_then(|delta| now.checked_sub_signed(delta))
            .unwrap_or(now)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *locked(&self.now)
    }
}

#[derive(Default)]
struct ManualTimerState {
    next_id: u64,
    scheduled: BTreeMap<u64, (Duration, TimerCallback)>,
    schedule_log: Vec<Duration>,
    cancel_log: Vec<TimerHandle>,
}

/// Timer whose callbacks only run when a test calls [`ManualTimer::fire`].
///
/// Records every schedule and cancel so tests can assert on rescheduling.
#[derive(Default)]
pub struct ManualTimer {
    state: Mutex<ManualTimerState>,
}

impl ManualTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of callbacks scheduled and not yet fired or cancelled.
    pub fn pending_count(&self) -> usize {
        locked(&self.state).scheduled.len()
    }

    /// Delay of the most recently scheduled pending callback.
    pub fn pending_delay(&self) -> Option<Duration> {
        locked(&self.state)
            .scheduled
            .values()
            .next_back()
            .map(|(delay, _)| *delay)
    }

    /// Total `schedule_once` calls so far.
    pub fn schedules(&self) -> usize {
        locked(&self.state).schedule_log.len()
    }

    /// Total `cancel` calls so far.
    pub fn cancels(&self) -> usize {
        locked(&self.state).cancel_log.len()
    }

    pub fn scheduled_delays(&self) -> Vec<Duration> {
        locked(&self.state).schedule_log.clone()
    }

    /// Run the oldest pending callback. Returns `false` if none was pending.
    pub fn fire(&self) -> bool {
        let callback = {
            let mut state = locked(&self.state);
            state.scheduled.pop_first().map(|(_, (_, callback))| callback)
        };
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }
}

impl Timer for ManualTimer {
    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let mut state = locked(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.scheduled.insert(id, (delay, callback));
        state.schedule_log.push(delay);
        TimerHandle::new(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut state = locked(&self.state);
        state.scheduled.remove(&handle.id());
        state.cancel_log.push(handle);
    }
}

impl std::fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = locked(&self.state);
        f.debug_struct("ManualTimer")
            .field("pending", &state.scheduled.len())
            .field("schedules", &state.schedule_log.len())
            .field("cancels", &state.cancel_log.len())
            .finish()
    }
}

// ============================================================================
// HOST API FIXTURES
// ============================================================================

/// One data hook invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent {
    Requested(ResourceName),
    Received(ResourceName, Value),
    Errored(ResourceName, FetchError),
}

impl DataEvent {
    pub fn resource(&self) -> &ResourceName {
        match self {
            Self::Requested(r) | Self::Received(r, _) | Self::Errored(r, _) => r,
        }
    }
}

/// Data hooks that log every call.
#[derive(Debug, Default)]
pub struct RecordingDataHandlers {
    events: Mutex<Vec<DataEvent>>,
}

impl RecordingDataHandlers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<DataEvent> {
        locked(&self.events).clone()
    }

    pub fn requested(&self, resource: &str) -> usize {
        self.count(resource, |e| matches!(e, DataEvent::Requested(_)))
    }

    pub fn received(&self, resource: &str) -> usize {
        self.count(resource, |e| matches!(e, DataEvent::Received(..)))
    }

    pub fn errored(&self, resource: &str) -> usize {
        self.count(resource, |e| matches!(e, DataEvent::Errored(..)))
    }

    /// `received + errored` for `resource`.
    pub fn settled(&self, resource: &str) -> usize {
        self.received(resource) + self.errored(resource)
    }

    fn count(&self, resource: &str, pred: impl Fn(&DataEvent) -> bool) -> usize {
        locked(&self.events)
            .iter()
            .filter(|e| e.resource().as_str() == resource && pred(e))
            .count()
    }
}

impl DataHandlers for RecordingDataHandlers {
    fn data_requested(&self, _api: &Api, _key: &ClientKey, resource: &ResourceName) {
        locked(&self.events).push(DataEvent::Requested(resource.clone()));
    }

    fn data_received(&self, _api: &Api, _key: &ClientKey, resource: &ResourceName, data: &Value) {
        locked(&self.events).push(DataEvent::Received(resource.clone(), data.clone()));
    }

    fn error_received(
        &self,
        _api: &Api,
        _key: &ClientKey,
        resource: &ResourceName,
        error: &FetchError,
    ) {
        locked(&self.events).push(DataEvent::Errored(resource.clone(), error.clone()));
    }
}

/// How a [`ScriptedRead`] answers for one resource.
#[derive(Debug, Clone)]
pub enum Response {
    /// Settle immediately with data.
    Data(Value),
    /// Settle immediately with an error.
    Error(FetchError),
    /// Settle with data after a delay.
    Delayed(Duration, Value),
    /// Never settle.
    Never,
}

impl Response {
    fn into_pending(self) -> PendingValue {
        match self {
            Self::Data(value) => PendingValue::ready(value),
            Self::Error(error) => PendingValue::failed(error),
            Self::Delayed(delay, value) => delayed(delay, value),
            Self::Never => never_settles(),
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    responses: BTreeMap<ResourceName, Response>,
    unrequested: BTreeMap<ResourceName, Response>,
    calls: Vec<Vec<ResourceName>>,
}

/// Read operation driven by a per-resource script.
///
/// Resources without a scripted response answer with their own name as a
/// JSON string. Clones share the script and call log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRead {
    script: Arc<Mutex<Script>>,
}

impl ScriptedRead {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, resource: impl Into<ResourceName>, response: Response) -> Self {
        locked(&self.script)
            .responses
            .insert(resource.into(), response);
        self
    }

    /// Also return `resource` on every call, whether asked for or not.
    pub fn also_return(self, resource: impl Into<ResourceName>, response: Response) -> Self {
        locked(&self.script)
            .unrequested
            .insert(resource.into(), response);
        self
    }

    /// Resource lists of every call, in call order.
    pub fn calls(&self) -> Vec<Vec<ResourceName>> {
        locked(&self.script).calls.clone()
    }

    pub fn call_count(&self) -> usize {
        locked(&self.script).calls.len()
    }

    /// Number of calls whose resource list included `resource`.
    pub fn times_requested(&self, resource: &str) -> usize {
        locked(&self.script)
            .calls
            .iter()
            .filter(|call| call.iter().any(|r| r.as_str() == resource))
            .count()
    }
}

impl OperationHandler for ScriptedRead {
    fn handle(
        &self,
        _methods: &BoundMethods,
        resources: &[ResourceName],
        _extra: Option<&Value>,
    ) -> BTreeMap<ResourceName, PendingValue> {
        let mut script = locked(&self.script);
        script.calls.push(resources.to_vec());

        let mut produced: BTreeMap<ResourceName, PendingValue> = resources
            .iter()
            .map(|resource| {
                let response = script
                    .responses
                    .get(resource)
                    .cloned()
                    .unwrap_or_else(|| Response::Data(Value::String(resource.to_string())));
                (resource.clone(), response.into_pending())
            })
            .collect();
        for (resource, response) in &script.unrequested {
            produced.insert(resource.clone(), response.clone().into_pending());
        }
        produced
    }
}

/// A pending value that never settles.
pub fn never_settles() -> PendingValue {
    PendingValue::pending(futures_util::future::pending())
}

/// A pending value that settles with `value` after `delay`.
pub fn delayed(delay: Duration, value: Value) -> PendingValue {
    PendingValue::pending(async move {
        tokio::time::sleep(delay).await;
        Ok(value)
    })
}

/// A client wired to a manual clock and timer.
pub struct Harness {
    pub client: Arc<Client>,
    pub clock: Arc<ManualClock>,
    pub timer: Arc<ManualTimer>,
    pub hooks: Arc<RecordingDataHandlers>,
    pub read: ScriptedRead,
}

impl Harness {
    /// Build a harness around `read`. Must be called inside a tokio runtime.
    pub fn new(read: ScriptedRead) -> FreshetResult<Self> {
        Self::with_config(read, ClientConfig::default())
    }

    pub fn with_config(read: ScriptedRead, config: ClientConfig) -> FreshetResult<Self> {
        let clock = ManualClock::starting_now();
        let timer = ManualTimer::new();
        let hooks = RecordingDataHandlers::new();
        let api = Api::builder()
            .read(read.clone())
            .data_handlers(hooks.clone())
            .build();
        let client = Client::builder(Arc::new(api), "test-client")
            .config(config)
            .clock(clock.clone())
            .timer(timer.clone())
            .build()?;
        Ok(Self {
            client,
            clock,
            timer,
            hooks,
            read,
        })
    }

    /// Replace the client state with one where `resource` was received
    /// `ago` before now.
    pub fn seed_received(&self, resource: &str, ago: Duration, data: Value) {
        let at = self.clock.before(ago);
        let mut state = (*self.client.state()).clone();
        state.insert(
            ResourceName::from(resource),
            ResourceState {
                last_requested: Some(at),
                last_received: Some(at),
                data: Some(data),
                error: None,
            },
        );
        self.client.replace_state(Arc::new(state));
    }

    /// Replace the client state with one where a fetch of `resource` was
    /// requested `ago` before now and never settled.
    pub fn seed_requested(&self, resource: &str, ago: Duration) {
        let mut state = (*self.client.state()).clone();
        state.record_requested(&ResourceName::from(resource), self.clock.before(ago));
        self.client.replace_state(Arc::new(state));
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for freshet types.

    use super::*;
    use proptest::prelude::*;

    /// One of a small pool of resource names, so declarations collide.
    pub fn arb_resource_name() -> impl Strategy<Value = ResourceName> {
        (0u8..6).prop_map(|n| ResourceName::from(format!("thing:{}", n)))
    }

    /// A bound between 1ms and one hour.
    pub fn arb_duration() -> impl Strategy<Value = Duration> {
        (1u64..3_600_000).prop_map(Duration::from_millis)
    }

    pub fn arb_declaration() -> impl Strategy<Value = RequirementDeclaration> {
        (
            arb_resource_name(),
            proptest::option::of(arb_duration()),
            proptest::option::of(arb_duration()),
        )
            .prop_map(|(resource, freshness, timeout)| RequirementDeclaration {
                resource,
                freshness,
                timeout,
            })
    }

    pub fn arb_declarations() -> impl Strategy<Value = Vec<RequirementDeclaration>> {
        proptest::collection::vec(arb_declaration(), 0..16)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over fetch outcomes and freshet results.

    use super::*;

    /// Assert that an outcome carries `expected` data.
    #[track_caller]
    pub fn assert_received(outcome: &FetchOutcome, expected: &Value) {
        match outcome {
            FetchOutcome::Received { data, .. } => assert_eq!(data, expected, "Wrong data"),
            other => panic!("Expected Received, got: {:?}", other),
        }
    }

    /// Assert that an outcome failed with `message`.
    #[track_caller]
    pub fn assert_failed(outcome: &FetchOutcome, message: &str) {
        match outcome {
            FetchOutcome::Failed { error, .. } => assert_eq!(error.message, message),
            other => panic!("Expected Failed, got: {:?}", other),
        }
    }

    /// Assert that an outcome is the timeout failure for `timeout`.
    #[track_caller]
    pub fn assert_timed_out(outcome: &FetchOutcome, timeout: Duration) {
        assert_failed(outcome, &format!("Timeout of {} reached.", timeout.as_millis()));
        assert!(outcome.is_timeout());
    }

    /// Assert that a FreshetResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &FreshetResult<T>) {
        match result {
            Err(FreshetError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that a FreshetResult is the missing read operation error.
    #[track_caller]
    pub fn assert_missing_read<T: std::fmt::Debug>(result: &FreshetResult<T>) {
        match result {
            Err(FreshetError::Config(ConfigError::MissingOperation { operation })) => {
                assert_eq!(operation, "read");
            }
            other => panic!("Expected MissingOperation error, got: {:?}", other),
        }
    }
}

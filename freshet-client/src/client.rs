//! Client orchestrator.
//!
//! A [`Client`] binds one host [`Api`] to one client key. It owns the
//! resource state snapshot, the consumer registry and the single pending
//! wake timer, and drives the requirement algebra and staleness scheduler
//! from `freshet-core` whenever any of them changes.
//!
//! Registration never fetches. Fetches are dispatched only from an
//! evaluation pass, which normally runs when the wake timer fires, so
//! many registrations in a row coalesce into one pass.
//!
//! The internal lock is never held while host code runs: operation
//! handlers, data hooks and subscribers are all called after it is
//! released.

use freshet_core::{
    evaluate, ClientConfig, ClientKey, ClientState, ConfigError, ConsumerId, FetchError,
    FreshetResult, RequirementDeclaration, Requirements, ResourceName, Timestamp,
};
use futures_util::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::api::{Api, BoundMethods, PendingValue, READ_OPERATION};
use crate::clock::{Clock, SystemClock};
use crate::metrics::{ClientMetrics, ClientMetricsSnapshot};
use crate::registry::ConsumerRegistry;
use crate::session::ConsumerSession;
use crate::timer::{Timer, TimerHandle, TokioTimer};
use crate::wait::{race, FetchOutcome, PendingOutcome, Settlement};

// ============================================================================
// SUPPORTING TYPES
// ============================================================================

/// Callback notified after every accepted external state replacement.
pub trait Subscriber: Send + Sync {
    fn on_state_replaced(&self, client: &Client);
}

impl<F> Subscriber for F
where
    F: Fn(&Client) + Send + Sync,
{
    fn on_state_replaced(&self, client: &Client) {
        self(client)
    }
}

/// What one evaluation pass did.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Resources found stale, in name order.
    pub stale: Vec<ResourceName>,
    /// One entry per fetch started.
    pub pending: Vec<PendingOutcome>,
}

impl Dispatch {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait for every dispatched fetch to settle.
    pub async fn settled(self) -> Vec<FetchOutcome> {
        join_all(self.pending).await
    }
}

/// Handle given to mutations for dispatching operations.
pub struct OperationRunner<'a> {
    client: &'a Client,
}

impl OperationRunner<'_> {
    /// Dispatch `operation` through the client; see [`Client::apply_operation`].
    pub fn apply(
        &self,
        operation: &str,
        resources: &[ResourceName],
        extra: Option<&Value>,
    ) -> FreshetResult<Vec<PendingOutcome>> {
        self.client.apply_operation(operation, resources, extra)
    }

    pub fn methods(&self) -> BoundMethods {
        self.client.methods()
    }

    pub fn client(&self) -> &Client {
        self.client
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder for [`Client`].
pub struct ClientBuilder {
    api: Arc<Api>,
    key: ClientKey,
    config: ClientConfig,
    clock: Option<Arc<dyn Clock>>,
    timer: Option<Arc<dyn Timer>>,
    runtime: Option<Handle>,
    state: ClientState,
}

impl ClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Runtime that fetch races are spawned on. Defaults to the current one.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Initial resource state, e.g. rehydrated from a persisted store.
    pub fn state(mut self, state: ClientState) -> Self {
        self.state = state;
        self
    }

    pub fn build(self) -> FreshetResult<Arc<Client>> {
        self.config.validate()?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|err| {
                ConfigError::InvalidValue {
                    field: "runtime".to_string(),
                    value: "none".to_string(),
                    reason: err.to_string(),
                }
            })?,
        };
        let timer = self
            .timer
            .unwrap_or_else(|| Arc::new(TokioTimer::new(runtime.clone())));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let state = Arc::new(self.state);
        let (snapshot_tx, _) = watch::channel(Arc::clone(&state));

        debug!(key = %self.key, "Creating client");
        Ok(Arc::new_cyclic(|me| Client {
            key: self.key,
            api: self.api,
            config: self.config,
            clock,
            timer,
            runtime,
            inner: Mutex::new(ClientInner {
                state,
                registry: ConsumerRegistry::new(),
                requirements: Requirements::new(),
                timer: None,
                timer_generation: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
            snapshot_tx,
            metrics: ClientMetrics::new(),
            me: me.clone(),
        }))
    }
}

// ============================================================================
// CLIENT
// ============================================================================

struct ClientInner {
    state: Arc<ClientState>,
    registry: ConsumerRegistry,
    /// Last derived view of `registry`, compared on every registration.
    requirements: Requirements,
    timer: Option<TimerHandle>,
    /// Bumped on every schedule so a superseded wake can recognise itself.
    timer_generation: u64,
}

/// Freshness-aware data client for one (Api, key) pair.
pub struct Client {
    key: ClientKey,
    api: Arc<Api>,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    timer: Arc<dyn Timer>,
    runtime: Handle,
    inner: Mutex<ClientInner>,
    subscribers: Mutex<Vec<Arc<dyn Subscriber>>>,
    snapshot_tx: watch::Sender<Arc<ClientState>>,
    metrics: ClientMetrics,
    me: Weak<Client>,
}

impl Client {
    pub fn builder(api: Arc<Api>, key: impl Into<ClientKey>) -> ClientBuilder {
        ClientBuilder {
            api,
            key: key.into(),
            config: ClientConfig::default(),
            clock: None,
            timer: None,
            runtime: None,
            state: ClientState::new(),
        }
    }

    /// Create a client with default config, system clock and tokio timer.
    pub fn new(api: Arc<Api>, key: impl Into<ClientKey>) -> FreshetResult<Arc<Self>> {
        Self::builder(api, key).build()
    }

    fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, snapshot: Arc<ClientState>) {
        self.snapshot_tx.send_replace(snapshot);
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn api(&self) -> &Api {
        &self.api
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Current resource state snapshot.
    pub fn state(&self) -> Arc<ClientState> {
        Arc::clone(&self.lock().state)
    }

    /// Current data held for `resource`.
    pub fn data(&self, resource: &str) -> Option<Value> {
        self.lock().state.data(resource).cloned()
    }

    /// Current aggregate requirements.
    pub fn requirements(&self) -> Requirements {
        self.lock().requirements.clone()
    }

    pub fn has_pending_timer(&self) -> bool {
        self.lock().timer.is_some()
    }

    /// Host methods pre-bound to this client's key.
    pub fn methods(&self) -> BoundMethods {
        self.api.bind(&self.key)
    }

    /// Receiver of every state snapshot the client publishes.
    pub fn watch(&self) -> watch::Receiver<Arc<ClientState>> {
        self.snapshot_tx.subscribe()
    }

    pub fn metrics(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot()
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Issue a new consumer handle.
    pub fn add_consumer(&self) -> ConsumerId {
        ConsumerId::new()
    }

    pub fn declarations_of(&self, consumer: ConsumerId) -> FreshetResult<Vec<RequirementDeclaration>> {
        self.lock().registry.get(consumer).map(<[_]>::to_vec)
    }

    /// Replace a consumer's declarations; `None` removes the consumer.
    ///
    /// Returns whether the aggregate requirements changed. When they did
    /// not, the wake timer is left untouched.
    pub fn register(
        &self,
        consumer: ConsumerId,
        declarations: Option<Vec<RequirementDeclaration>>,
    ) -> bool {
        self.register_at(consumer, declarations, self.clock.now())
    }

    pub fn register_at(
        &self,
        consumer: ConsumerId,
        declarations: Option<Vec<RequirementDeclaration>>,
        now: Timestamp,
    ) -> bool {
        let mut inner = self.lock();
        inner.registry.replace(consumer, declarations);

        let requirements = inner.registry.requirements();
        if requirements == inner.requirements {
            trace!(consumer = %consumer, "Requirements unchanged");
            return false;
        }

        debug!(
            consumer = %consumer,
            resources = requirements.len(),
            "Requirements changed"
        );
        inner.requirements = requirements;
        self.update_timer_locked(&mut inner, now, None);
        true
    }

    /// Start collecting selector declarations for `consumer`.
    pub fn session(&self, consumer: ConsumerId) -> ConsumerSession<'_> {
        ConsumerSession::new(self, consumer)
    }

    // ------------------------------------------------------------------------
    // Evaluation and dispatch
    // ------------------------------------------------------------------------

    /// Fetch every stale resource, then reschedule the wake timer.
    pub fn evaluate_and_fetch(&self) -> FreshetResult<Dispatch> {
        self.evaluate_and_fetch_at(self.clock.now())
    }

    pub fn evaluate_and_fetch_at(&self, now: Timestamp) -> FreshetResult<Dispatch> {
        let report = {
            let inner = self.lock();
            evaluate(&inner.requirements, &inner.state, now, self.config.default_timeout)
        };
        ClientMetrics::incr(&self.metrics.evaluations);

        let stale: Vec<ResourceName> = report.stale.into_iter().collect();
        debug!(stale = stale.len(), "Evaluated staleness");

        let pending = if stale.is_empty() {
            Vec::new()
        } else {
            self.apply_operation_at(READ_OPERATION, &stale, None, now)?
        };

        let mut inner = self.lock();
        self.update_timer_locked(&mut inner, now, None);
        Ok(Dispatch { stale, pending })
    }

    /// Dispatch `operation` for `resources`.
    ///
    /// Resources are grouped by the first handler that accepts them and
    /// each handler is called once per group. Every produced resource
    /// that has a requirement is waited on with its aggregate timeout;
    /// the rest are ignored.
    ///
    /// Fails only when `operation` is `"read"` and the Api has no read
    /// handler. Other operations without handlers dispatch nothing.
    pub fn apply_operation(
        &self,
        operation: &str,
        resources: &[ResourceName],
        extra: Option<&Value>,
    ) -> FreshetResult<Vec<PendingOutcome>> {
        self.apply_operation_at(operation, resources, extra, self.clock.now())
    }

    pub fn apply_operation_at(
        &self,
        operation: &str,
        resources: &[ResourceName],
        extra: Option<&Value>,
        now: Timestamp,
    ) -> FreshetResult<Vec<PendingOutcome>> {
        let handlers = if operation == READ_OPERATION {
            self.api.read_handlers().inspect_err(|err| {
                error!(key = %self.key, error = %err, "No read operation registered");
            })?
        } else {
            self.api.handlers(operation)
        };
        if handlers.is_empty() {
            trace!(operation, "No handlers registered, nothing dispatched");
            return Ok(Vec::new());
        }

        let mut groups: BTreeMap<usize, Vec<ResourceName>> = BTreeMap::new();
        for resource in resources {
            match handlers.iter().position(|handler| handler.handles(resource)) {
                Some(index) => groups.entry(index).or_default().push(resource.clone()),
                None => warn!(operation, resource = %resource, "No handler accepts resource"),
            }
        }

        let methods = self.methods();
        let requirements = self.requirements();
        let mut outcomes = Vec::new();

        for (index, group) in groups {
            debug!(operation, handler = index, resources = group.len(), "Invoking operation handler");
            let produced = handlers[index].handle(&methods, &group, extra);

            for (resource, value) in produced {
                match requirements.get(&resource) {
                    Some(requirement) => {
                        let timeout = requirement.timeout_or(self.config.default_timeout);
                        outcomes.push(self.wait_for_data_at(resource, value, timeout, now));
                    }
                    None => {
                        warn!(operation, resource = %resource, "Ignoring unrequested resource");
                    }
                }
            }
        }

        Ok(outcomes)
    }

    // ------------------------------------------------------------------------
    // Wait for data
    // ------------------------------------------------------------------------

    /// Record a request for `resource` and race `value` against `timeout`.
    ///
    /// The returned outcome always resolves: failures and timeouts arrive
    /// as [`FetchOutcome::Failed`]. Whichever of data, failure or timeout
    /// settles first is recorded; later arrivals are discarded.
    pub fn wait_for_data(
        &self,
        resource: impl Into<ResourceName>,
        value: PendingValue,
        timeout: Duration,
    ) -> PendingOutcome {
        self.wait_for_data_at(resource.into(), value, timeout, self.clock.now())
    }

    pub fn wait_for_data_at(
        &self,
        resource: ResourceName,
        value: PendingValue,
        timeout: Duration,
        now: Timestamp,
    ) -> PendingOutcome {
        let snapshot = {
            let mut inner = self.lock();
            Arc::make_mut(&mut inner.state).record_requested(&resource, now);
            Arc::clone(&inner.state)
        };
        self.publish(snapshot);
        ClientMetrics::incr(&self.metrics.fetches_dispatched);

        debug!(
            resource = %resource,
            timeout_ms = millis(timeout),
            "Fetch requested"
        );
        self.api
            .data_handlers()
            .data_requested(&self.api, &self.key, &resource);

        let me = self.me.clone();
        let settled_resource = resource.clone();
        let handle = self.runtime.spawn(async move {
            let settlement = race(value, timeout).await;
            match me.upgrade() {
                Some(client) => client.settle(settled_resource, settlement, now),
                None => outcome_of(settled_resource, settlement),
            }
        });

        PendingOutcome::new(resource, handle)
    }

    /// Record a settled fetch no earlier than the instant it was requested.
    fn settle(
        &self,
        resource: ResourceName,
        settlement: Settlement,
        requested_at: Timestamp,
    ) -> FetchOutcome {
        let now = self.clock.now().max(requested_at);
        if let Settlement::TimedOut(timeout) = &settlement {
            ClientMetrics::incr(&self.metrics.timeouts);
            warn!(
                resource = %resource,
                timeout_ms = millis(*timeout),
                "Fetch timed out"
            );
        }
        let outcome = outcome_of(resource, settlement);

        let snapshot = {
            let mut inner = self.lock();
            let state = Arc::make_mut(&mut inner.state);
            match &outcome {
                FetchOutcome::Received { resource, data } => {
                    state.record_received(resource, now, data.clone())
                }
                FetchOutcome::Failed { resource, error } => {
                    state.record_error(resource, now, error.clone())
                }
            }
            let snapshot = Arc::clone(&inner.state);
            self.update_timer_locked(&mut inner, now, None);
            snapshot
        };
        self.publish(snapshot);

        let hooks = self.api.data_handlers();
        match &outcome {
            FetchOutcome::Received { resource, data } => {
                ClientMetrics::incr(&self.metrics.data_received);
                debug!(resource = %resource, "Data received");
                hooks.data_received(&self.api, &self.key, resource, data);
            }
            FetchOutcome::Failed { resource, error } => {
                ClientMetrics::incr(&self.metrics.errors_received);
                debug!(resource = %resource, error = %error, "Fetch failed");
                hooks.error_received(&self.api, &self.key, resource, error);
            }
        }

        outcome
    }

    // ------------------------------------------------------------------------
    // Wake timer
    // ------------------------------------------------------------------------

    /// Reschedule the wake timer, after `explicit` if given, otherwise at
    /// the next instant any required resource could become stale.
    pub fn update_timer(&self, explicit: Option<Duration>) {
        self.update_timer_at(self.clock.now(), explicit)
    }

    pub fn update_timer_at(&self, now: Timestamp, explicit: Option<Duration>) {
        let mut inner = self.lock();
        self.update_timer_locked(&mut inner, now, explicit);
    }

    fn update_timer_locked(&self, inner: &mut ClientInner, now: Timestamp, explicit: Option<Duration>) {
        let target = match explicit {
            Some(delay) => Some(delay),
            None if inner.requirements.is_empty() => None,
            None => {
                let report = evaluate(
                    &inner.requirements,
                    &inner.state,
                    now,
                    self.config.default_timeout,
                );
                let delay = report
                    .delay_from(now)
                    .unwrap_or(self.config.max_update_delay);
                Some(self.config.clamp_delay(delay))
            }
        };

        match (inner.timer.take(), target) {
            (None, None) => trace!("No wake timer needed"),
            (Some(previous), None) => {
                self.timer.cancel(previous);
                ClientMetrics::incr(&self.metrics.timer_clears);
                debug!(timer = %previous, "Wake timer cleared");
            }
            (previous, Some(delay)) => {
                if let Some(previous) = previous {
                    self.timer.cancel(previous);
                }
                inner.timer_generation += 1;
                let generation = inner.timer_generation;
                let me = self.me.clone();
                let handle = self.timer.schedule_once(
                    delay,
                    Box::new(move || {
                        if let Some(client) = me.upgrade() {
                            client.on_wake(generation);
                        }
                    }),
                );
                inner.timer = Some(handle);
                ClientMetrics::incr(&self.metrics.timer_reschedules);
                debug!(
                    timer = %handle,
                    delay_ms = millis(delay),
                    "Wake timer scheduled"
                );
            }
        }
    }

    fn on_wake(&self, generation: u64) {
        {
            let mut inner = self.lock();
            if inner.timer_generation != generation {
                trace!(generation, "Ignoring superseded wake");
                return;
            }
            inner.timer = None;
        }

        if let Err(err) = self.evaluate_and_fetch() {
            error!(key = %self.key, error = %err, "Evaluation failed");
        }
    }

    /// Cancel the pending wake timer.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        if let Some(handle) = inner.timer.take() {
            self.timer.cancel(handle);
            ClientMetrics::incr(&self.metrics.timer_clears);
        }
        debug!(key = %self.key, "Client disposed");
    }

    // ------------------------------------------------------------------------
    // State replacement and subscribers
    // ------------------------------------------------------------------------

    /// Replace the whole resource state, e.g. after external rehydration.
    ///
    /// The exact snapshot already held is refused and returns `false`.
    /// Otherwise the wake timer is updated and every subscriber notified.
    pub fn replace_state(&self, state: Arc<ClientState>) -> bool {
        self.replace_state_at(state, self.clock.now())
    }

    pub fn replace_state_at(&self, state: Arc<ClientState>, now: Timestamp) -> bool {
        {
            let mut inner = self.lock();
            if Arc::ptr_eq(&inner.state, &state) {
                trace!("Ignoring replacement with the current snapshot");
                return false;
            }
            inner.state = Arc::clone(&state);
            self.update_timer_locked(&mut inner, now, None);
        }
        self.publish(state);
        ClientMetrics::incr(&self.metrics.state_replacements);

        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        debug!(subscribers = subscribers.len(), "State replaced");
        for subscriber in &subscribers {
            subscriber.on_state_replaced(self);
        }
        true
    }

    /// Returns `false` when `subscriber` is already subscribed.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        if subscribers.iter().any(|s| same_subscriber(s, &subscriber)) {
            return false;
        }
        subscribers.push(subscriber);
        true
    }

    /// Returns `false` when `subscriber` was not subscribed.
    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| !same_subscriber(s, subscriber));
        subscribers.len() != before
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Run the host mutation `name`.
    pub async fn mutate(&self, name: &str, args: Value) -> FreshetResult<Value> {
        let mutation = self.api.mutation(name)?;
        debug!(mutation = name, "Running mutation");
        mutation.run(&OperationRunner { client: self }, args).await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = inner.timer.take() {
            self.timer.cancel(handle);
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Client")
            .field("key", &self.key)
            .field("resources", &inner.state.len())
            .field("consumers", &inner.registry.len())
            .field("requirements", &inner.requirements.len())
            .field("timer", &inner.timer)
            .finish()
    }
}

fn same_subscriber(a: &Arc<dyn Subscriber>, b: &Arc<dyn Subscriber>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn outcome_of(resource: ResourceName, settlement: Settlement) -> FetchOutcome {
    match settlement {
        Settlement::Data(data) => FetchOutcome::Received { resource, data },
        Settlement::Failed(error) => FetchOutcome::Failed { resource, error },
        Settlement::TimedOut(timeout) => FetchOutcome::Failed {
            resource,
            error: FetchError::timeout(timeout),
        },
    }
}

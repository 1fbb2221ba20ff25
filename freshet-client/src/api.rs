//! Host-supplied Api definition.
//!
//! The host application describes how to talk to its backend through
//! capability tables: raw methods keyed by verb, named operations (of
//! which `"read"` is mandatory), mutations, selectors and data hooks.
//! The client never looks inside them; it only dispatches.

use async_trait::async_trait;
use freshet_core::{
    ClientKey, ConfigError, FetchError, FreshetResult, RequirementDeclaration, ResourceName,
};
use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::client::OperationRunner;
use crate::session::SelectorContext;

/// Name of the mandatory operation used to fetch stale resources.
pub const READ_OPERATION: &str = "read";

/// Outcome of a raw request.
pub type FetchResult = Result<Value, FetchError>;

/// A raw value, or an operation that will eventually produce one.
pub enum PendingValue {
    Ready(FetchResult),
    Pending(BoxFuture<'static, FetchResult>),
}

impl PendingValue {
    pub fn ready(value: Value) -> Self {
        Self::Ready(Ok(value))
    }

    pub fn failed(error: FetchError) -> Self {
        Self::Ready(Err(error))
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = FetchResult> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl fmt::Debug for PendingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

impl From<Value> for PendingValue {
    fn from(value: Value) -> Self {
        Self::ready(value)
    }
}

// ============================================================================
// CAPABILITY TRAITS
// ============================================================================

/// A raw request function, e.g. `GET`.
pub trait Method: Send + Sync {
    fn call(&self, key: &ClientKey, path: &str, params: Value) -> PendingValue;
}

impl<F> Method for F
where
    F: Fn(&ClientKey, &str, Value) -> PendingValue + Send + Sync,
{
    fn call(&self, key: &ClientKey, path: &str, params: Value) -> PendingValue {
        self(key, path, params)
    }
}

/// Handler for a named operation.
///
/// Returns one raw value (or pending operation) per resource it produced.
/// It may return resources it was not asked for; the client ignores
/// those it has no requirement for.
pub trait OperationHandler: Send + Sync {
    fn handle(
        &self,
        methods: &BoundMethods,
        resources: &[ResourceName],
        extra: Option<&Value>,
    ) -> BTreeMap<ResourceName, PendingValue>;

    /// Whether this handler is responsible for `resource`.
    ///
    /// Resources are routed to the first handler in an operation's list
    /// that accepts them.
    fn handles(&self, _resource: &ResourceName) -> bool {
        true
    }
}

impl<F> OperationHandler for F
where
    F: Fn(&BoundMethods, &[ResourceName], Option<&Value>) -> BTreeMap<ResourceName, PendingValue>
        + Send
        + Sync,
{
    fn handle(
        &self,
        methods: &BoundMethods,
        resources: &[ResourceName],
        extra: Option<&Value>,
    ) -> BTreeMap<ResourceName, PendingValue> {
        self(methods, resources, extra)
    }
}

/// A host mutation. It may issue requests and dispatch operations.
#[async_trait]
pub trait Mutation: Send + Sync {
    async fn run(&self, operations: &OperationRunner<'_>, args: Value) -> FreshetResult<Value>;
}

/// Freshness bound a selector asks for on behalf of its caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Demand {
    pub freshness: Option<Duration>,
    pub timeout: Option<Duration>,
}

impl Demand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh_within(freshness: Duration) -> Self {
        Self {
            freshness: Some(freshness),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The declaration this demand makes for `resource`.
    pub fn declare(&self, resource: impl Into<ResourceName>) -> RequirementDeclaration {
        RequirementDeclaration {
            resource: resource.into(),
            freshness: self.freshness,
            timeout: self.timeout,
        }
    }
}

/// Derives a value from client state, declaring what it reads.
pub trait Selector: Send + Sync {
    fn select(&self, ctx: &mut SelectorContext<'_>, demand: &Demand, args: &Value) -> Value;
}

impl<F> Selector for F
where
    F: Fn(&mut SelectorContext<'_>, &Demand, &Value) -> Value + Send + Sync,
{
    fn select(&self, ctx: &mut SelectorContext<'_>, demand: &Demand, args: &Value) -> Value {
        self(ctx, demand, args)
    }
}

/// Hooks invoked once per fetch attempt.
///
/// Every attempt calls `data_requested` once, followed by exactly one of
/// `data_received` or `error_received`.
pub trait DataHandlers: Send + Sync {
    fn data_requested(&self, _api: &Api, _key: &ClientKey, _resource: &ResourceName) {}

    fn data_received(&self, _api: &Api, _key: &ClientKey, _resource: &ResourceName, _data: &Value) {
    }

    fn error_received(
        &self,
        _api: &Api,
        _key: &ClientKey,
        _resource: &ResourceName,
        _error: &FetchError,
    ) {
    }
}

/// Data handlers that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDataHandlers;

impl DataHandlers for NoopDataHandlers {}

// ============================================================================
// BOUND METHODS
// ============================================================================

/// The host method table with the client key already applied.
#[derive(Clone)]
pub struct BoundMethods {
    key: ClientKey,
    methods: Arc<BTreeMap<String, Arc<dyn Method>>>,
}

impl BoundMethods {
    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub fn has(&self, verb: &str) -> bool {
        self.methods.contains_key(verb)
    }

    pub fn call(&self, verb: &str, path: &str, params: Value) -> FreshetResult<PendingValue> {
        let method = self.methods.get(verb).ok_or_else(|| ConfigError::UnknownMethod {
            verb: verb.to_string(),
        })?;
        Ok(method.call(&self.key, path, params))
    }
}

impl fmt::Debug for BoundMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundMethods")
            .field("key", &self.key)
            .field("verbs", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// API
// ============================================================================

/// Complete host Api definition.
pub struct Api {
    methods: Arc<BTreeMap<String, Arc<dyn Method>>>,
    operations: BTreeMap<String, Vec<Arc<dyn OperationHandler>>>,
    mutations: BTreeMap<String, Arc<dyn Mutation>>,
    selectors: BTreeMap<String, Arc<dyn Selector>>,
    data_handlers: Arc<dyn DataHandlers>,
}

impl Api {
    pub fn builder() -> ApiBuilder {
        ApiBuilder::default()
    }

    /// Bind the method table to a client key.
    pub fn bind(&self, key: &ClientKey) -> BoundMethods {
        BoundMethods {
            key: key.clone(),
            methods: Arc::clone(&self.methods),
        }
    }

    /// Handlers registered for `operation`, in priority order.
    pub fn handlers(&self, operation: &str) -> &[Arc<dyn OperationHandler>] {
        self.operations
            .get(operation)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Handlers of the mandatory read operation.
    pub fn read_handlers(&self) -> FreshetResult<&[Arc<dyn OperationHandler>]> {
        let handlers = self.handlers(READ_OPERATION);
        if handlers.is_empty() {
            return Err(ConfigError::MissingOperation {
                operation: READ_OPERATION.to_string(),
            }
            .into());
        }
        Ok(handlers)
    }

    pub fn mutation(&self, name: &str) -> FreshetResult<Arc<dyn Mutation>> {
        self.mutations.get(name).cloned().ok_or_else(|| {
            ConfigError::UnknownMutation {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn selector(&self, name: &str) -> FreshetResult<Arc<dyn Selector>> {
        self.selectors.get(name).cloned().ok_or_else(|| {
            ConfigError::UnknownSelector {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn data_handlers(&self) -> &dyn DataHandlers {
        self.data_handlers.as_ref()
    }
}

impl fmt::Debug for Api {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Api")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field(
                "operations",
                &self
                    .operations
                    .iter()
                    .map(|(name, handlers)| (name, handlers.len()))
                    .collect::<Vec<_>>(),
            )
            .field("mutations", &self.mutations.keys().collect::<Vec<_>>())
            .field("selectors", &self.selectors.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`Api`].
pub struct ApiBuilder {
    methods: BTreeMap<String, Arc<dyn Method>>,
    operations: BTreeMap<String, Vec<Arc<dyn OperationHandler>>>,
    mutations: BTreeMap<String, Arc<dyn Mutation>>,
    selectors: BTreeMap<String, Arc<dyn Selector>>,
    data_handlers: Arc<dyn DataHandlers>,
}

impl Default for ApiBuilder {
    fn default() -> Self {
        Self {
            methods: BTreeMap::new(),
            operations: BTreeMap::new(),
            mutations: BTreeMap::new(),
            selectors: BTreeMap::new(),
            data_handlers: Arc::new(NoopDataHandlers),
        }
    }
}

impl ApiBuilder {
    pub fn method(mut self, verb: impl Into<String>, method: impl Method + 'static) -> Self {
        self.methods.insert(verb.into(), Arc::new(method));
        self
    }

    /// Append a handler to `operation`'s list.
    pub fn operation(
        mut self,
        operation: impl Into<String>,
        handler: impl OperationHandler + 'static,
    ) -> Self {
        self.operations
            .entry(operation.into())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    /// Shorthand for `operation(READ_OPERATION, handler)`.
    pub fn read(self, handler: impl OperationHandler + 'static) -> Self {
        self.operation(READ_OPERATION, handler)
    }

    pub fn mutation(mut self, name: impl Into<String>, mutation: impl Mutation + 'static) -> Self {
        self.mutations.insert(name.into(), Arc::new(mutation));
        self
    }

    pub fn selector(mut self, name: impl Into<String>, selector: impl Selector + 'static) -> Self {
        self.selectors.insert(name.into(), Arc::new(selector));
        self
    }

    pub fn data_handlers(mut self, handlers: Arc<dyn DataHandlers>) -> Self {
        self.data_handlers = handlers;
        self
    }

    pub fn build(self) -> Api {
        Api {
            methods: Arc::new(self.methods),
            operations: self.operations,
            mutations: self.mutations,
            selectors: self.selectors,
            data_handlers: self.data_handlers,
        }
    }
}

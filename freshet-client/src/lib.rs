//! freshet client - freshness-aware data orchestration
//!
//! Consumers declare how fresh each resource must be. The [`Client`]
//! merges those declarations, keeps one wake timer armed for the next
//! moment anything goes stale, and fetches stale resources through the
//! host-supplied [`Api`] when it fires.
//!
//! ```ignore
//! let api = Arc::new(Api::builder().read(read_things).build());
//! let client = Client::new(api, "session-1")?;
//!
//! let consumer = client.add_consumer();
//! client.register(
//!     consumer,
//!     Some(vec![RequirementDeclaration::new("thing:1")
//!         .with_freshness(Duration::from_secs(90))]),
//! );
//! ```

pub mod api;
pub mod client;
pub mod clock;
pub mod metrics;
pub mod registry;
pub mod session;
pub mod timer;
pub mod wait;

pub use api::{
    Api, ApiBuilder, BoundMethods, DataHandlers, Demand, FetchResult, Method, Mutation,
    NoopDataHandlers, OperationHandler, PendingValue, Selector, READ_OPERATION,
};
pub use client::{Client, ClientBuilder, Dispatch, OperationRunner, Subscriber};
pub use clock::{Clock, SystemClock};
pub use metrics::{ClientMetrics, ClientMetricsSnapshot};
pub use registry::ConsumerRegistry;
pub use session::{ConsumerSession, SelectorContext};
pub use timer::{Timer, TimerCallback, TimerHandle, TokioTimer};
pub use wait::{FetchOutcome, PendingOutcome};

pub use freshet_core::{
    ClientConfig, ClientKey, ClientState, ConfigError, ConsumerId, FetchError, FreshetError,
    FreshetResult, RegistryError, RequirementDeclaration, Requirements, ResourceName,
    ResourceState, ResourceStatus, Timestamp,
};

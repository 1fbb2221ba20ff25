//! freshet core - requirement algebra and staleness scheduling
//!
//! Pure data types and pure functions with no async runtime. The client
//! orchestrator in `freshet-client` drives these on every change.
//!
//! - [`merge`] folds consumer declarations into one [`AggregateRequirement`]
//!   per resource (minimum freshness, minimum timeout).
//! - [`evaluate`] compares those requirements with the current
//!   [`ClientState`] and reports which resources are stale now and when the
//!   next one will be.

pub mod config;
pub mod error;
pub mod identity;
pub mod requirement;
pub mod staleness;
pub mod state;

pub use config::{
    ClientConfig, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAX_UPDATE_DELAY_MS,
    DEFAULT_MIN_UPDATE_DELAY_MS,
};
pub use error::{ConfigError, FetchError, FreshetError, FreshetResult, RegistryError};
pub use identity::{ClientKey, ConsumerId, ResourceName, Timestamp};
pub use requirement::{merge, AggregateRequirement, RequirementDeclaration, Requirements, UNBOUNDED};
pub use staleness::{
    evaluate, freshness_expiry, resource_expiry, timeout_expiry, Expiry, StalenessReport,
};
pub use state::{ClientState, ResourceState, ResourceStatus};

//! Requirement declarations and the merge algebra.
//!
//! Consumers declare how fresh a resource must be kept and how long a fetch
//! of it may take. [`merge`] folds any number of declarations into one
//! [`AggregateRequirement`] per resource by taking the minimum of each
//! field, so the result is independent of declaration order.

use crate::ResourceName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Sentinel for "no constraint".
pub const UNBOUNDED: Duration = Duration::MAX;

/// One consumer's freshness/timeout bound for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequirementDeclaration {
    pub resource: ResourceName,
    /// Maximum acceptable age of the held copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<Duration>,
    /// Maximum time a fetch may stay outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl RequirementDeclaration {
    /// Declare interest in a resource without bounding either field.
    pub fn new(resource: impl Into<ResourceName>) -> Self {
        Self {
            resource: resource.into(),
            freshness: None,
            timeout: None,
        }
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = Some(freshness);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The tightest bound across all current declarations for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRequirement {
    pub freshness: Duration,
    pub timeout: Duration,
}

impl Default for AggregateRequirement {
    fn default() -> Self {
        Self {
            freshness: UNBOUNDED,
            timeout: UNBOUNDED,
        }
    }
}

impl AggregateRequirement {
    /// Tighten this requirement with one more declaration.
    pub fn absorb(&mut self, declaration: &RequirementDeclaration) {
        self.freshness = self.freshness.min(declaration.freshness.unwrap_or(UNBOUNDED));
        self.timeout = self.timeout.min(declaration.timeout.unwrap_or(UNBOUNDED));
    }

    pub fn has_freshness_bound(&self) -> bool {
        self.freshness != UNBOUNDED
    }

    pub fn has_timeout_bound(&self) -> bool {
        self.timeout != UNBOUNDED
    }

    /// The timeout to race a fetch against, falling back when unbounded.
    pub fn timeout_or(&self, fallback: Duration) -> Duration {
        if self.has_timeout_bound() {
            self.timeout
        } else {
            fallback
        }
    }
}

/// Aggregate requirements keyed by resource.
///
/// A resource absent from this map is exempt from staleness checks.
pub type Requirements = BTreeMap<ResourceName, AggregateRequirement>;

/// Merge declarations into one aggregate requirement per named resource.
pub fn merge<'a, I>(declarations: I) -> Requirements
where
    I: IntoIterator<Item = &'a RequirementDeclaration>,
{
    declarations
        .into_iter()
        .fold(Requirements::new(), |mut acc, declaration| {
            acc.entry(declaration.resource.clone())
                .or_default()
                .absorb(declaration);
            acc
        })
}

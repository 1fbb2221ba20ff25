//! Staleness scheduling.
//!
//! Given the aggregate requirements and the current resource state, decide
//! which resources must be fetched now and when the next one will expire.
//!
//! Each resource has two expiry offsets relative to `now`:
//!
//! ```text
//! freshness:  F - (now - last_received)   Overdue if never received
//! timeout:    T - (now - last_requested)  only while a fetch is outstanding
//! ```
//!
//! The resource expires at the earlier of the two and is stale once that
//! offset is negative. While a fetch is outstanding the freshness offset is
//! ignored, so at most one fetch per resource is in flight until its
//! timeout elapses. An outstanding fetch with no declared timeout is
//! measured against the caller's `default_timeout` instead, so a fetch that
//! will never settle (for example one restored from a saved snapshot) is
//! still retried.

use crate::{
    AggregateRequirement, ClientState, Requirements, ResourceName, ResourceState, Timestamp,
    UNBOUNDED,
};
use chrono::TimeDelta;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// Time left before a resource violates its requirement.
///
/// Variants are ordered, so `min` picks the most urgent expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Expiry {
    /// Expired infinitely long ago (never received).
    Overdue,
    /// Expires after this offset; negative means already expired.
    In(TimeDelta),
    /// Nothing bounds this resource.
    Never,
}

impl Expiry {
    pub fn is_stale(&self) -> bool {
        match self {
            Expiry::Overdue => true,
            Expiry::In(offset) => *offset < TimeDelta::zero(),
            Expiry::Never => false,
        }
    }

    /// Absolute instant of expiry, never earlier than `now`.
    pub fn deadline(&self, now: Timestamp) -> Option<Timestamp> {
        match self {
            Expiry::Overdue => Some(now),
            Expiry::In(offset) => now.checked_add_signed((*offset).max(TimeDelta::zero())),
            Expiry::Never => None,
        }
    }

    /// `bound - elapsed`, with an unbounded bound never expiring.
    fn remaining(bound: Duration, elapsed: TimeDelta) -> Self {
        if bound == UNBOUNDED {
            return Expiry::Never;
        }
        let Ok(bound) = TimeDelta::from_std(bound) else {
            return Expiry::Never;
        };
        match bound.checked_sub(&elapsed) {
            Some(offset) => Expiry::In(offset),
            None if elapsed > TimeDelta::zero() => Expiry::Overdue,
            None => Expiry::Never,
        }
    }
}

/// Expiry of the held copy's age against the freshness bound.
pub fn freshness_expiry(
    requirement: &AggregateRequirement,
    state: &ResourceState,
    now: Timestamp,
) -> Expiry {
    if state.is_outstanding() {
        return Expiry::Never;
    }
    match state.last_received {
        None => Expiry::Overdue,
        Some(received) => Expiry::remaining(requirement.freshness, now - received),
    }
}

/// Expiry of an outstanding fetch against the timeout bound.
///
/// An unbounded timeout falls back to `default_timeout`.
pub fn timeout_expiry(
    requirement: &AggregateRequirement,
    state: &ResourceState,
    now: Timestamp,
    default_timeout: Duration,
) -> Expiry {
    match state.last_requested {
        Some(requested) if state.is_outstanding() => {
            Expiry::remaining(requirement.timeout_or(default_timeout), now - requested)
        }
        _ => Expiry::Never,
    }
}

/// Combined expiry of one resource.
pub fn resource_expiry(
    requirement: &AggregateRequirement,
    state: &ResourceState,
    now: Timestamp,
    default_timeout: Duration,
) -> Expiry {
    freshness_expiry(requirement, state, now)
        .min(timeout_expiry(requirement, state, now, default_timeout))
}

/// Result of one staleness evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StalenessReport {
    /// Resources whose requirement is violated now.
    pub stale: BTreeSet<ResourceName>,
    /// Earliest instant any resource expires, clamped to `now`.
    /// `None` when nothing will ever expire.
    pub next_check_at: Option<Timestamp>,
}

impl StalenessReport {
    pub fn is_stale(&self, resource: &str) -> bool {
        self.stale.contains(resource)
    }

    /// Delay from `now` until `next_check_at`.
    pub fn delay_from(&self, now: Timestamp) -> Option<Duration> {
        self.next_check_at
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Evaluate every required resource against its state.
///
/// Resources held in `state` but absent from `requirements` are ignored.
/// Outstanding fetches with no declared timeout expire after
/// `default_timeout`.
pub fn evaluate(
    requirements: &Requirements,
    state: &ClientState,
    now: Timestamp,
    default_timeout: Duration,
) -> StalenessReport {
    let never_fetched = ResourceState::default();
    let mut report = StalenessReport::default();
    let mut earliest = Expiry::Never;

    for (resource, requirement) in requirements {
        let resource_state = state.get(resource.as_str()).unwrap_or(&never_fetched);
        let expiry = resource_expiry(requirement, resource_state, now, default_timeout);
        if expiry.is_stale() {
            report.stale.insert(resource.clone());
        }
        earliest = earliest.min(expiry);
    }

    report.next_check_at = earliest.deadline(now);
    report
}

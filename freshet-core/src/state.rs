//! Per-resource fetch state held by a client.

use crate::{FetchError, ResourceName, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// What the client knows about one resource.
///
/// `last_requested` is set when a fetch is dispatched, `last_received`
/// when it settles with either data or an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub last_requested: Option<Timestamp>,
    pub last_received: Option<Timestamp>,
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FetchError>,
}

/// Lifecycle position of a resource, inferred from its timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Never requested.
    NeverFetched,
    /// A fetch started after the last receipt and has not settled.
    Requesting,
    /// The last fetch settled; data or an error is held.
    Holding,
}

impl ResourceState {
    /// True while a fetch was started after the last receipt and has not settled.
    pub fn is_outstanding(&self) -> bool {
        match (self.last_requested, self.last_received) {
            (Some(requested), Some(received)) => requested > received,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    pub fn status(&self) -> ResourceStatus {
        if self.is_outstanding() {
            ResourceStatus::Requesting
        } else if self.last_received.is_some() {
            ResourceStatus::Holding
        } else {
            ResourceStatus::NeverFetched
        }
    }
}

/// Snapshot of every tracked resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientState {
    resources: BTreeMap<ResourceName, ResourceState>,
}

impl ClientState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, resource: &str) -> Option<&ResourceState> {
        self.resources.get(resource)
    }

    /// Current data for a resource, if any has been received.
    pub fn data(&self, resource: &str) -> Option<&Value> {
        self.get(resource).and_then(|state| state.data.as_ref())
    }

    pub fn status(&self, resource: &str) -> ResourceStatus {
        self.get(resource)
            .map(ResourceState::status)
            .unwrap_or(ResourceStatus::NeverFetched)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceName, &ResourceState)> {
        self.resources.iter()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Insert or overwrite a resource's state wholesale.
    pub fn insert(&mut self, resource: ResourceName, state: ResourceState) {
        self.resources.insert(resource, state);
    }

    pub fn record_requested(&mut self, resource: &ResourceName, at: Timestamp) {
        self.entry(resource).last_requested = Some(at);
    }

    /// Record a successful fetch. Clears any previously stored error.
    pub fn record_received(&mut self, resource: &ResourceName, at: Timestamp, data: Value) {
        let state = self.entry(resource);
        state.last_received = Some(at);
        state.data = Some(data);
        state.error = None;
    }

    /// Record a failed fetch. Previously received data is kept.
    pub fn record_error(&mut self, resource: &ResourceName, at: Timestamp, error: FetchError) {
        let state = self.entry(resource);
        state.last_received = Some(at);
        state.error = Some(error);
    }

    fn entry(&mut self, resource: &ResourceName) -> &mut ResourceState {
        self.resources.entry(resource.clone()).or_default()
    }
}

impl FromIterator<(ResourceName, ResourceState)> for ClientState {
    fn from_iter<T: IntoIterator<Item = (ResourceName, ResourceState)>>(iter: T) -> Self {
        Self {
            resources: iter.into_iter().collect(),
        }
    }
}

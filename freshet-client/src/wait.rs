//! Racing a fetch against its timeout.
//!
//! A fetch and its timeout compete for a single result: whichever settles
//! first wins and the loser is ignored. A timed-out fetch keeps running
//! unobserved; it is never aborted.

use freshet_core::{FetchError, ResourceName};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::api::PendingValue;

/// Final result of one fetch attempt.
///
/// Failures are values: callers never handle an `Err` for an ordinary
/// fetch failure or timeout.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Received { resource: ResourceName, data: Value },
    Failed { resource: ResourceName, error: FetchError },
}

impl FetchOutcome {
    pub fn resource(&self) -> &ResourceName {
        match self {
            Self::Received { resource, .. } | Self::Failed { resource, .. } => resource,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Received { data, .. } => Some(data),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError> {
        match self {
            Self::Received { .. } => None,
            Self::Failed { error, .. } => Some(error),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.error().is_some_and(FetchError::is_timeout)
    }
}

/// How the race between a fetch and its timeout ended.
#[derive(Debug)]
pub(crate) enum Settlement {
    Data(Value),
    Failed(FetchError),
    TimedOut(Duration),
}

impl From<Result<Value, FetchError>> for Settlement {
    fn from(result: Result<Value, FetchError>) -> Self {
        match result {
            Ok(data) => Settlement::Data(data),
            Err(error) => Settlement::Failed(error),
        }
    }
}

/// Await `pending`, giving up after `timeout`.
pub(crate) async fn race(pending: PendingValue, timeout: Duration) -> Settlement {
    let future = match pending {
        PendingValue::Ready(result) => return result.into(),
        PendingValue::Pending(future) => future,
    };

    // Run the fetch as its own task so that losing the race only drops the
    // join handle, leaving the underlying operation to finish on its own.
    let fetch = tokio::spawn(future);
    tokio::select! {
        biased;
        joined = fetch => match joined {
            Ok(result) => result.into(),
            Err(err) => Settlement::Failed(FetchError::new(format!("Fetch task failed: {}", err))),
        },
        _ = tokio::time::sleep(timeout) => Settlement::TimedOut(timeout),
    }
}

/// Eventual [`FetchOutcome`] of a dispatched fetch.
#[derive(Debug)]
pub struct PendingOutcome {
    resource: ResourceName,
    handle: JoinHandle<FetchOutcome>,
}

impl PendingOutcome {
    pub(crate) fn new(resource: ResourceName, handle: JoinHandle<FetchOutcome>) -> Self {
        Self { resource, handle }
    }

    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Future for PendingOutcome {
    type Output = FetchOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.handle).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(err)) => Poll::Ready(FetchOutcome::Failed {
                resource: this.resource.clone(),
                error: FetchError::new(format!("Fetch task failed: {}", err)),
            }),
            Poll::Pending => Poll::Pending,
        }
    }
}

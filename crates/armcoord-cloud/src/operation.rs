//! Composition helpers for coordinated mutations
//!
//! A mutating operation locks every resource whose shared state it rewrites,
//! performs get / modify / put, waits for the backend to converge, and
//! releases its locks on every exit path.

use crate::backoff::PollConfig;
use crate::error::{CloudError, Result};
use crate::id::ResourceId;
use crate::lock::{LockKey, LockRegistry};
use crate::poller::{self, NOT_FOUND, Observation, PollSpec, ProbeError};
use crate::provider::{ProvisionedResource, ResourceClient, provisioning_state};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// States a resource passes through while a create or update is applied
pub const PROVISIONING_PENDING: &[&str] = &[
    provisioning_state::ACCEPTED,
    provisioning_state::CREATING,
    provisioning_state::UPDATING,
    provisioning_state::PROVISIONING,
];

pub const PROVISIONING_TARGET: &[&str] = &[provisioning_state::SUCCEEDED];

/// States a resource may still report while its deletion is applied
pub const DELETION_PENDING: &[&str] = &[
    provisioning_state::DELETING,
    provisioning_state::SUCCEEDED,
    provisioning_state::UPDATING,
];

pub const DELETION_TARGET: &[&str] = &[NOT_FOUND];

/// Deadline and cancellation scope of one top-level operation
#[derive(Debug, Clone)]
pub struct OperationContext {
    name: String,
    deadline: Instant,
    cancel: CancellationToken,
    lock_timeout: Option<Duration>,
}

impl OperationContext {
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        Self::with_cancellation(name, timeout, CancellationToken::new())
    }

    pub fn with_cancellation(
        name: impl Into<String>,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            deadline: poller::deadline_after(timeout),
            cancel,
            lock_timeout: None,
        }
    }

    /// Bound lock acquisition separately from the overall deadline
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Nested scope sharing the deadline; cancelled with its parent
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
            lock_timeout: self.lock_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// How long lock acquisition may block from now
    pub fn lock_wait(&self) -> Duration {
        let remaining = self.remaining();
        self.lock_timeout.map_or(remaining, |limit| limit.min(remaining))
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Poll specification bounded by this operation's deadline and cancellation
    pub fn poll_spec(
        &self,
        resource: impl Into<String>,
        pending: &[&str],
        target: &[&str],
        config: &PollConfig,
    ) -> PollSpec {
        PollSpec::new(resource, pending, target, Duration::ZERO)
            .with_config(config)
            .with_deadline(self.deadline)
            .with_cancellation(self.cancel.clone())
    }
}

/// Run `body` while holding every key in `keys`
///
/// Acquisition is bounded by the context's deadline and cancellation. The
/// keys are released however `body` finishes.
pub async fn with_locks<T, E, F, Fut>(
    registry: &LockRegistry,
    ctx: &OperationContext,
    keys: impl IntoIterator<Item = LockKey>,
    body: F,
) -> std::result::Result<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<CloudError>,
{
    let guard = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(CloudError::Cancelled(ctx.name.clone()).into()),
        acquired = registry.acquire_all_timeout(keys, ctx.lock_wait()) => acquired?,
    };
    tracing::debug!(
        operation = %ctx.name,
        locks = guard.len(),
        "Entering critical section"
    );

    let result = body().await;
    guard.release();
    result
}

/// Get, apply `mutate`, put back, and wait for the long-running operation
///
/// `mutate` returns whether it changed anything; an unchanged model is not
/// written. Returns whether a write happened.
pub async fn read_modify_write<C, F, E>(
    client: &C,
    id: &ResourceId,
    mutate: F,
) -> std::result::Result<bool, E>
where
    C: ResourceClient + ?Sized,
    F: FnOnce(&mut C::Model) -> std::result::Result<bool, E>,
    E: From<CloudError>,
{
    let mut model = client
        .get(id)
        .await?
        .ok_or_else(|| CloudError::ResourceNotFound(id.to_string()))?;

    if !mutate(&mut model)? {
        tracing::debug!(kind = client.resource_type(), resource = %id, "No change to write");
        return Ok(false);
    }

    let operation = client.create_or_update(id, model).await?;
    operation.wait().await?;
    tracing::debug!(kind = client.resource_type(), resource = %id, "Write accepted");
    Ok(true)
}

/// Wait until `id` reports `Succeeded`, returning the converged model
///
/// A model that reports no provisioning state is treated as settled.
pub async fn wait_for_provisioning<C>(
    client: &C,
    ctx: &OperationContext,
    id: &ResourceId,
    config: &PollConfig,
) -> Result<C::Model>
where
    C: ResourceClient + ?Sized,
{
    let spec = ctx.poll_spec(id.to_string(), PROVISIONING_PENDING, PROVISIONING_TARGET, config);
    let converged = poller::wait_for(spec, move || async move {
        match client.get(id).await {
            Ok(Some(model)) => {
                let state = model
                    .provisioning_state()
                    .unwrap_or(provisioning_state::SUCCEEDED)
                    .to_string();
                Ok(Observation::new(model, state))
            }
            Ok(None) => Err(ProbeError::NotFound),
            Err(err) => Err(err.into()),
        }
    })
    .await?;

    converged
        .value
        .ok_or_else(|| CloudError::ResourceNotFound(id.to_string()))
}

/// Wait until `id` no longer exists
pub async fn wait_for_deletion<C>(
    client: &C,
    ctx: &OperationContext,
    id: &ResourceId,
    config: &PollConfig,
) -> Result<()>
where
    C: ResourceClient + ?Sized,
{
    let spec = ctx.poll_spec(id.to_string(), DELETION_PENDING, DELETION_TARGET, config);
    poller::wait_for(spec, move || async move {
        match client.get(id).await {
            Ok(Some(model)) => {
                let state = model
                    .provisioning_state()
                    .unwrap_or(provisioning_state::SUCCEEDED)
                    .to_string();
                Ok(Observation::<C::Model>::state_only(state))
            }
            Ok(None) => Err(ProbeError::NotFound),
            Err(err) => Err(err.into()),
        }
    })
    .await?;
    Ok(())
}

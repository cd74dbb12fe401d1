//! Management API abstraction
//!
//! The typed REST clients live outside this crate. Coordination only needs a
//! whole-object `get`, a `create_or_update` that starts a long-running
//! operation, a `delete`, and the provisioning state of a model.

use crate::error::Result;
use crate::id::ResourceId;
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Provisioning states reported by the management API
pub mod provisioning_state {
    pub const ACCEPTED: &str = "Accepted";
    pub const CREATING: &str = "Creating";
    pub const UPDATING: &str = "Updating";
    pub const PROVISIONING: &str = "Provisioning";
    pub const DELETING: &str = "Deleting";
    pub const SUCCEEDED: &str = "Succeeded";
    pub const FAILED: &str = "Failed";
    pub const CANCELED: &str = "Canceled";
}

/// A resource model carrying an opaque provisioning state
pub trait ProvisionedResource: Clone + Send + Sync + 'static {
    fn provisioning_state(&self) -> Option<&str>;
}

type OperationFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Handle on an accepted mutation whose completion can be awaited
#[must_use = "a long-running operation does nothing unless waited on"]
pub struct LongRunningOperation {
    description: String,
    future: OperationFuture,
}

impl LongRunningOperation {
    pub fn new<F>(description: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            description: description.into(),
            future: Box::pin(future),
        }
    }

    /// Operation that finished synchronously
    pub fn completed(description: impl Into<String>) -> Self {
        Self::new(description, async { Ok(()) })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub async fn wait(self) -> Result<()> {
        tracing::debug!(operation = %self.description, "Waiting for long-running operation");
        self.future.await
    }
}

impl fmt::Debug for LongRunningOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongRunningOperation")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Client for one resource kind
///
/// Implementations report a missing resource as `Ok(None)` from `get`, and
/// replace the whole object on `create_or_update`.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    type Model: ProvisionedResource;

    /// Kind label used in logs (e.g. `azurerm_virtual_network`)
    fn resource_type(&self) -> &str;

    async fn get(&self, id: &ResourceId) -> Result<Option<Self::Model>>;

    async fn create_or_update(
        &self,
        id: &ResourceId,
        model: Self::Model,
    ) -> Result<LongRunningOperation>;

    async fn delete(&self, id: &ResourceId) -> Result<LongRunningOperation>;
}

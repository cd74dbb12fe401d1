//! ArmCoord Cloud Coordination
//!
//! This crate serializes conflicting mutations against shared cloud
//! resources and waits for the backend to converge after each mutation.
//!
//! # Components
//!
//! - **Lock Registry**: named mutual exclusion keyed by `type.name`, with
//!   deadlock-free multi-key acquisition
//! - **Convergence Poller**: pending/target state waits with debounce,
//!   bounded exponential backoff, deadline and cancellation
//! - **Operations**: lock / read-modify-write / wait composition
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │             resource operations                  │
//! │        (create subnet, associate NSG...)         │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                armcoord-cloud                    │
//! │  ┌──────────────┐  ┌──────────────────────────┐  │
//! │  │ LockRegistry │  │ PollSpec / wait_for      │  │
//! │  └──────────────┘  └──────────────────────────┘  │
//! │  ┌──────────────────────────────────────────┐   │
//! │  │  trait ResourceClient { get, put, ... }  │   │
//! │  └──────────────────────────────────────────┘   │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//!           ┌───────▼───────┐
//!           │ management API│
//!           └───────────────┘
//! ```

pub mod backoff;
pub mod error;
pub mod id;
pub mod lock;
pub mod operation;
pub mod poller;
pub mod provider;

// Re-exports
pub use backoff::{Backoff, PollConfig};
pub use error::{CloudError, Result};
pub use id::ResourceId;
pub use lock::{LockGuard, LockKey, LockRegistry, MultiLockGuard};
pub use operation::{
    OperationContext, read_modify_write, wait_for_deletion, wait_for_provisioning, with_locks,
};
pub use poller::{
    Converged, NOT_FOUND, Observation, PollError, PollErrorKind, PollSpec, ProbeError, ProbeResult,
    wait_for,
};
pub use provider::{LongRunningOperation, ProvisionedResource, ResourceClient, provisioning_state};

//! Network operations for ArmCoord
//!
//! This crate composes the coordination primitives of `armcoord-cloud` into
//! the network operations of a cloud provider: subnets, security group and
//! route table associations, NIC associations, and security rules.
//!
//! # Features
//!
//! - Lock-protected read-modify-write of shared parent resources
//! - Convergence waits on every resource an operation touches
//! - An in-memory management API for tests and demos
//!
//! # Example
//!
//! ```ignore
//! use armcoord_network::{NetworkProvider, Subnet};
//! use armcoord_cloud::OperationContext;
//!
//! let ctx = OperationContext::new("create subnet", Duration::from_secs(1800));
//! let subnet = provider
//!     .create_subnet(&ctx, &vnet_id, Subnet::new("frontend", "10.0.1.0/24"))
//!     .await?;
//! ```

pub mod error;
pub mod model;
pub mod provider;
pub mod simulator;

pub use error::{NetworkError, Result};
pub use model::{
    Access, Direction, IpConfiguration, NetworkInterface, NetworkSecurityGroup,
    ProvisioningStateMut, Route, RouteTable, SecurityRule, Subnet, VirtualNetwork,
};
pub use provider::{NetworkProvider, resource_type, virtual_network_keys};
pub use simulator::{InMemoryArm, SimulatedNetwork, SimulatorConfig};

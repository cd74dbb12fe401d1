//! Network provider error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Subnet {subnet} not found in virtual network {virtual_network}")]
    SubnetNotFound {
        virtual_network: String,
        subnet: String,
    },

    #[error("IP configuration {ip_configuration} not found on network interface {interface}")]
    IpConfigurationNotFound {
        interface: String,
        ip_configuration: String,
    },

    #[error("Security rule {rule} conflicts with {existing}: {reason}")]
    SecurityRuleConflict {
        rule: String,
        existing: String,
        reason: String,
    },

    #[error("References of {resource} changed while waiting for locks")]
    ReferenceChanged { resource: String },

    #[error("Cloud error: {0}")]
    CloudError(#[from] armcoord_cloud::CloudError),
}

impl NetworkError {
    pub fn is_not_found(&self) -> bool {
        match self {
            NetworkError::SubnetNotFound { .. } | NetworkError::IpConfigurationNotFound { .. } => {
                true
            }
            NetworkError::CloudError(err) => err.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetworkError>;

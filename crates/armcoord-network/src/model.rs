//! Network resource models
//!
//! Whole-object representations as exchanged with the management API. Every
//! PUT replaces the full object, including embedded collections such as a
//! virtual network's subnets or a NIC's IP configurations.

use armcoord_cloud::ProvisionedResource;
use serde::{Deserialize, Serialize};

/// Models whose provisioning state can be rewritten by a backend
pub trait ProvisioningStateMut: ProvisionedResource {
    fn set_provisioning_state(&mut self, state: Option<String>);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualNetwork {
    pub name: String,
    #[serde(default)]
    pub address_space: Vec<String>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
}

impl VirtualNetwork {
    pub fn new(name: impl Into<String>, address_space: &[&str]) -> Self {
        Self {
            name: name.into(),
            address_space: address_space.iter().map(|s| s.to_string()).collect(),
            subnets: Vec::new(),
            provisioning_state: None,
        }
    }

    pub fn subnet(&self, name: &str) -> Option<&Subnet> {
        self.subnets.iter().find(|s| s.name == name)
    }

    pub fn subnet_mut(&mut self, name: &str) -> Option<&mut Subnet> {
        self.subnets.iter_mut().find(|s| s.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subnet {
    pub name: String,
    pub address_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_security_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_table_id: Option<String>,
}

impl Subnet {
    pub fn new(name: impl Into<String>, address_prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address_prefix: address_prefix.into(),
            network_security_group_id: None,
            route_table_id: None,
        }
    }

    pub fn with_network_security_group(mut self, id: impl Into<String>) -> Self {
        self.network_security_group_id = Some(id.into());
        self
    }

    pub fn with_route_table(mut self, id: impl Into<String>) -> Self {
        self.route_table_id = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default)]
    pub ip_configurations: Vec<IpConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_security_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, ip_configurations: Vec<IpConfiguration>) -> Self {
        Self {
            name: name.into(),
            ip_configurations,
            network_security_group_id: None,
            provisioning_state: None,
        }
    }

    pub fn ip_configuration(&self, name: &str) -> Option<&IpConfiguration> {
        self.ip_configurations.iter().find(|c| c.name == name)
    }

    pub fn ip_configuration_mut(&mut self, name: &str) -> Option<&mut IpConfiguration> {
        self.ip_configurations.iter_mut().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfiguration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub load_balancer_backend_address_pool_ids: Vec<String>,
}

impl IpConfiguration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subnet_id: None,
            primary: false,
            load_balancer_backend_address_pool_ids: Vec::new(),
        }
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSecurityGroup {
    pub name: String,
    #[serde(default)]
    pub security_rules: Vec<SecurityRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
}

impl NetworkSecurityGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            security_rules: Vec::new(),
            provisioning_state: None,
        }
    }

    pub fn rule(&self, name: &str) -> Option<&SecurityRule> {
        self.security_rules.iter().find(|r| r.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityRule {
    pub name: String,
    pub priority: u32,
    pub direction: Direction,
    pub access: Access,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_wildcard")]
    pub source_address_prefix: String,
    #[serde(default = "default_wildcard")]
    pub destination_port_range: String,
}

fn default_protocol() -> String {
    "*".to_string()
}
fn default_wildcard() -> String {
    "*".to_string()
}

impl SecurityRule {
    pub fn new(name: impl Into<String>, priority: u32, direction: Direction, access: Access) -> Self {
        Self {
            name: name.into(),
            priority,
            direction,
            access,
            protocol: default_protocol(),
            source_address_prefix: default_wildcard(),
            destination_port_range: default_wildcard(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_destination_port_range(mut self, range: impl Into<String>) -> Self {
        self.destination_port_range = range.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTable {
    pub name: String,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_state: Option<String>,
}

impl RouteTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: Vec::new(),
            provisioning_state: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub name: String,
    pub address_prefix: String,
    pub next_hop_type: String,
}

impl ProvisionedResource for VirtualNetwork {
    fn provisioning_state(&self) -> Option<&str> {
        self.provisioning_state.as_deref()
    }
}

impl ProvisioningStateMut for VirtualNetwork {
    fn set_provisioning_state(&mut self, state: Option<String>) {
        self.provisioning_state = state;
    }
}

impl ProvisionedResource for NetworkInterface {
    fn provisioning_state(&self) -> Option<&str> {
        self.provisioning_state.as_deref()
    }
}

impl ProvisioningStateMut for NetworkInterface {
    fn set_provisioning_state(&mut self, state: Option<String>) {
        self.provisioning_state = state;
    }
}

impl ProvisionedResource for NetworkSecurityGroup {
    fn provisioning_state(&self) -> Option<&str> {
        self.provisioning_state.as_deref()
    }
}

impl ProvisioningStateMut for NetworkSecurityGroup {
    fn set_provisioning_state(&mut self, state: Option<String>) {
        self.provisioning_state = state;
    }
}

impl ProvisionedResource for RouteTable {
    fn provisioning_state(&self) -> Option<&str> {
        self.provisioning_state.as_deref()
    }
}

impl ProvisioningStateMut for RouteTable {
    fn set_provisioning_state(&mut self, state: Option<String>) {
        self.provisioning_state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_network_wire_format() {
        let mut vnet = VirtualNetwork::new("vnet-1", &["10.0.0.0/16"]);
        vnet.subnets.push(Subnet::new("frontend", "10.0.1.0/24").with_route_table("rt-id"));

        let json = serde_json::to_value(&vnet).unwrap();
        assert_eq!(json["addressSpace"][0], "10.0.0.0/16");
        assert_eq!(json["subnets"][0]["addressPrefix"], "10.0.1.0/24");
        assert_eq!(json["subnets"][0]["routeTableId"], "rt-id");
        assert!(json["subnets"][0].get("networkSecurityGroupId").is_none());
        assert!(json.get("provisioningState").is_none());
    }

    #[test]
    fn test_security_rule_defaults() {
        let rule: SecurityRule = serde_json::from_str(
            r#"{"name": "allow-ssh", "priority": 100, "direction": "Inbound", "access": "Allow"}"#,
        )
        .unwrap();
        assert_eq!(rule.protocol, "*");
        assert_eq!(rule.destination_port_range, "*");
        assert_eq!(rule, SecurityRule::new("allow-ssh", 100, Direction::Inbound, Access::Allow));
    }

    #[test]
    fn test_lookup_helpers() {
        let mut nic = NetworkInterface::new(
            "nic-1",
            vec![IpConfiguration::new("ipconfig1").primary()],
        );
        assert!(nic.ip_configuration("ipconfig1").unwrap().primary);
        assert!(nic.ip_configuration("missing").is_none());

        nic.ip_configuration_mut("ipconfig1")
            .unwrap()
            .load_balancer_backend_address_pool_ids
            .push("pool".to_string());
        assert_eq!(
            nic.ip_configurations[0].load_balancer_backend_address_pool_ids,
            vec!["pool"]
        );
        assert_eq!(nic.provisioning_state(), None);
    }
}

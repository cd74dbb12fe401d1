//! Network resource operations
//!
//! Every operation here rewrites an embedded collection of a shared parent
//! resource (a virtual network's subnets, a NIC's IP configurations, a
//! security group's rules). Each one locks the parent and every resource it
//! references, performs get / modify / put, waits for convergence, and only
//! then releases its locks.

use crate::error::{NetworkError, Result};
use crate::model::{NetworkInterface, NetworkSecurityGroup, RouteTable, SecurityRule, Subnet, VirtualNetwork};
use armcoord_cloud::lock::normalize_keys;
use armcoord_cloud::{
    CloudError, LockKey, LockRegistry, OperationContext, PollConfig, ResourceClient, ResourceId,
    read_modify_write, wait_for_provisioning, with_locks,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

/// Lock namespaces, one per resource kind
pub mod resource_type {
    pub const VIRTUAL_NETWORK: &str = "azurerm_virtual_network";
    pub const NETWORK_SECURITY_GROUP: &str = "azurerm_network_security_group";
    pub const ROUTE_TABLE: &str = "azurerm_route_table";
    pub const NETWORK_INTERFACE: &str = "azurerm_network_interface";
    pub const LOAD_BALANCER: &str = "azurerm_lb";
}

use resource_type::{
    LOAD_BALANCER, NETWORK_INTERFACE, NETWORK_SECURITY_GROUP, ROUTE_TABLE, VIRTUAL_NETWORK,
};

pub type VirtualNetworkClient = Arc<dyn ResourceClient<Model = VirtualNetwork>>;
pub type NetworkInterfaceClient = Arc<dyn ResourceClient<Model = NetworkInterface>>;
pub type SecurityGroupClient = Arc<dyn ResourceClient<Model = NetworkSecurityGroup>>;
pub type RouteTableClient = Arc<dyn ResourceClient<Model = RouteTable>>;

const MIN_RULE_PRIORITY: u32 = 100;
const MAX_RULE_PRIORITY: u32 = 4096;

/// Tries before a [`NetworkError::ReferenceChanged`] is surfaced
const REFERENCE_ATTEMPTS: u32 = 3;

/// Lock keys for the virtual networks containing `subnet_ids`
pub fn virtual_network_keys(subnet_ids: &[ResourceId]) -> Result<Vec<LockKey>> {
    let keys = subnet_ids
        .iter()
        .map(|id| {
            virtual_network_of(id).map(|vnet| LockKey::new(VIRTUAL_NETWORK, vnet.name()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(normalize_keys(keys))
}

fn virtual_network_of(subnet_id: &ResourceId) -> Result<ResourceId> {
    let is_subnet = subnet_id
        .resource_type()
        .is_some_and(|t| t.eq_ignore_ascii_case("subnets"));
    match subnet_id.parent() {
        Some(parent)
            if is_subnet
                && parent
                    .resource_type()
                    .is_some_and(|t| t.eq_ignore_ascii_case("virtualNetworks")) =>
        {
            Ok(parent)
        }
        _ => Err(NetworkError::InvalidInput(format!(
            "{subnet_id} is not a subnet ID"
        ))),
    }
}

fn load_balancer_of(pool_id: &ResourceId) -> Result<ResourceId> {
    let is_pool = pool_id
        .resource_type()
        .is_some_and(|t| t.eq_ignore_ascii_case("backendAddressPools"));
    match pool_id.parent() {
        Some(parent)
            if is_pool
                && parent
                    .resource_type()
                    .is_some_and(|t| t.eq_ignore_ascii_case("loadBalancers")) =>
        {
            Ok(parent)
        }
        _ => Err(NetworkError::InvalidInput(format!(
            "{pool_id} is not a backend address pool ID"
        ))),
    }
}

/// A resource referenced by the one being modified
#[derive(Debug, Clone)]
enum Dependent {
    SecurityGroup(ResourceId),
    RouteTable(ResourceId),
    LoadBalancer(ResourceId),
}

impl Dependent {
    fn security_group(raw: &str) -> Result<Self> {
        Ok(Dependent::SecurityGroup(ResourceId::parse(raw)?))
    }

    fn route_table(raw: &str) -> Result<Self> {
        Ok(Dependent::RouteTable(ResourceId::parse(raw)?))
    }

    fn lock_key(&self) -> LockKey {
        match self {
            Dependent::SecurityGroup(id) => LockKey::new(NETWORK_SECURITY_GROUP, id.name()),
            Dependent::RouteTable(id) => LockKey::new(ROUTE_TABLE, id.name()),
            Dependent::LoadBalancer(id) => LockKey::new(LOAD_BALANCER, id.name()),
        }
    }
}

fn subnet_dependents(subnet: &Subnet) -> Result<Vec<Dependent>> {
    let mut dependents = Vec::new();
    if let Some(nsg) = &subnet.network_security_group_id {
        dependents.push(Dependent::security_group(nsg)?);
    }
    if let Some(route_table) = &subnet.route_table_id {
        dependents.push(Dependent::route_table(route_table)?);
    }
    Ok(dependents)
}

/// Drop dependents that share a lock key, keeping the first
fn unique_dependents(dependents: Vec<Dependent>) -> Vec<Dependent> {
    let mut seen = HashSet::new();
    dependents
        .into_iter()
        .filter(|d| seen.insert(d.lock_key()))
        .collect()
}

/// Resources a subnet points at, compared to detect concurrent rewiring
#[derive(Debug, Clone, PartialEq, Eq)]
struct SubnetReferences {
    network_security_group_id: Option<String>,
    route_table_id: Option<String>,
}

impl SubnetReferences {
    fn of(subnet: &Subnet) -> Self {
        Self {
            network_security_group_id: subnet.network_security_group_id.clone(),
            route_table_id: subnet.route_table_id.clone(),
        }
    }
}

/// Which reference of a subnet an association rewrites
#[derive(Debug, Clone, Copy)]
enum SubnetLink {
    SecurityGroup,
    RouteTable,
}

impl SubnetLink {
    fn get(self, subnet: &Subnet) -> Option<&str> {
        match self {
            SubnetLink::SecurityGroup => subnet.network_security_group_id.as_deref(),
            SubnetLink::RouteTable => subnet.route_table_id.as_deref(),
        }
    }

    fn slot(self, subnet: &mut Subnet) -> &mut Option<String> {
        match self {
            SubnetLink::SecurityGroup => &mut subnet.network_security_group_id,
            SubnetLink::RouteTable => &mut subnet.route_table_id,
        }
    }

    fn dependent(self, raw: &str) -> Result<Dependent> {
        match self {
            SubnetLink::SecurityGroup => Dependent::security_group(raw),
            SubnetLink::RouteTable => Dependent::route_table(raw),
        }
    }
}

/// Rerun `attempt` while the references read before locking turn out stale
///
/// Lock keys are derived from a read made before the locks are held. When the
/// locked read disagrees, the attempt fails with
/// [`NetworkError::ReferenceChanged`] and is retried with fresh keys.
async fn retry_on_reference_change<T, F, Fut>(resource: &ResourceId, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries = 1;
    loop {
        match attempt().await {
            Err(NetworkError::ReferenceChanged { .. }) if tries < REFERENCE_ATTEMPTS => {
                tracing::debug!(resource = %resource, attempt = tries, "References changed before locking, retrying");
                tries += 1;
            }
            other => return other,
        }
    }
}

/// Coordinated network operations over the management API
pub struct NetworkProvider {
    locks: Arc<LockRegistry>,
    virtual_networks: VirtualNetworkClient,
    network_interfaces: NetworkInterfaceClient,
    security_groups: SecurityGroupClient,
    route_tables: RouteTableClient,
    poll: PollConfig,
}

impl NetworkProvider {
    pub fn new(
        locks: Arc<LockRegistry>,
        virtual_networks: VirtualNetworkClient,
        network_interfaces: NetworkInterfaceClient,
        security_groups: SecurityGroupClient,
        route_tables: RouteTableClient,
    ) -> Self {
        Self {
            locks,
            virtual_networks,
            network_interfaces,
            security_groups,
            route_tables,
            poll: PollConfig::default(),
        }
    }

    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    pub fn locks(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    pub fn poll_config(&self) -> &PollConfig {
        &self.poll
    }

    // ------------------------------------------------------------------
    // Subnets
    // ------------------------------------------------------------------

    /// Create or replace `subnet` inside `virtual_network_id`
    pub async fn create_subnet(
        &self,
        ctx: &OperationContext,
        virtual_network_id: &ResourceId,
        subnet: Subnet,
    ) -> Result<Subnet> {
        if subnet.name.is_empty() || subnet.address_prefix.is_empty() {
            return Err(NetworkError::InvalidInput(
                "subnet name and address prefix are required".to_string(),
            ));
        }
        subnet_dependents(&subnet)?;

        retry_on_reference_change(virtual_network_id, move || {
            self.create_subnet_once(ctx, virtual_network_id, subnet.clone())
        })
        .await
    }

    async fn create_subnet_once(
        &self,
        ctx: &OperationContext,
        virtual_network_id: &ResourceId,
        subnet: Subnet,
    ) -> Result<Subnet> {
        let existing = self.current_subnet(virtual_network_id, &subnet.name).await?;
        let expected = existing.as_ref().map(SubnetReferences::of);

        let mut dependents = subnet_dependents(&subnet)?;
        if let Some(existing) = &existing {
            dependents.extend(subnet_dependents(existing)?);
        }
        let dependents = unique_dependents(dependents);
        let mut keys = vec![LockKey::new(VIRTUAL_NETWORK, virtual_network_id.name())];
        keys.extend(dependents.iter().map(Dependent::lock_key));
        let name = subnet.name.clone();
        let label = format!("{virtual_network_id}/subnets/{name}");

        with_locks(&self.locks, ctx, keys, move || async move {
            read_modify_write(
                self.virtual_networks.as_ref(),
                virtual_network_id,
                |vnet: &mut VirtualNetwork| {
                    let found = vnet.subnet(&subnet.name).map(SubnetReferences::of);
                    if found != expected {
                        return Err(NetworkError::ReferenceChanged { resource: label });
                    }
                    match vnet.subnet_mut(&subnet.name) {
                        Some(existing) if *existing == subnet => return Ok(false),
                        Some(existing) => *existing = subnet,
                        None => vnet.subnets.push(subnet),
                    }
                    Ok(true)
                },
            )
            .await?;

            let vnet = wait_for_provisioning(
                self.virtual_networks.as_ref(),
                ctx,
                virtual_network_id,
                &self.poll,
            )
            .await?;
            for dependent in &dependents {
                self.wait_dependent(ctx, dependent).await?;
            }

            tracing::info!(virtual_network = %virtual_network_id, subnet = %name, "Subnet provisioned");
            vnet.subnet(&name)
                .cloned()
                .ok_or_else(|| NetworkError::SubnetNotFound {
                    virtual_network: virtual_network_id.name().to_string(),
                    subnet: name.clone(),
                })
        })
        .await
    }

    /// Remove a subnet; returns `false` if it was already gone
    pub async fn delete_subnet(&self, ctx: &OperationContext, subnet_id: &ResourceId) -> Result<bool> {
        let vnet_id = virtual_network_of(subnet_id)?;
        let vnet_id = &vnet_id;
        retry_on_reference_change(subnet_id, move || {
            self.delete_subnet_once(ctx, vnet_id, subnet_id)
        })
        .await
    }

    async fn delete_subnet_once(
        &self,
        ctx: &OperationContext,
        vnet_id: &ResourceId,
        subnet_id: &ResourceId,
    ) -> Result<bool> {
        let Some(current) = self.current_subnet(vnet_id, subnet_id.name()).await? else {
            tracing::debug!(subnet = %subnet_id, "Subnet already deleted");
            return Ok(false);
        };

        let expected = SubnetReferences::of(&current);
        let dependents = subnet_dependents(&current)?;
        let mut keys = vec![LockKey::new(VIRTUAL_NETWORK, vnet_id.name())];
        keys.extend(dependents.iter().map(Dependent::lock_key));
        let subnet_name = subnet_id.name().to_string();

        with_locks(&self.locks, ctx, keys, move || async move {
            let removed = read_modify_write(
                self.virtual_networks.as_ref(),
                vnet_id,
                |vnet: &mut VirtualNetwork| {
                    match vnet.subnet(&subnet_name).map(SubnetReferences::of) {
                        None => return Ok(false),
                        Some(found) if found != expected => {
                            return Err(NetworkError::ReferenceChanged {
                                resource: subnet_id.to_string(),
                            });
                        }
                        Some(_) => {}
                    }
                    vnet.subnets.retain(|s| s.name != subnet_name);
                    Ok(true)
                },
            )
            .await?;

            if removed {
                wait_for_provisioning(self.virtual_networks.as_ref(), ctx, vnet_id, &self.poll)
                    .await?;
                for dependent in &dependents {
                    self.wait_dependent(ctx, dependent).await?;
                }
                tracing::info!(subnet = %subnet_id, "Subnet deleted");
            }
            Ok(removed)
        })
        .await
    }

    pub async fn associate_subnet_nsg(
        &self,
        ctx: &OperationContext,
        subnet_id: &ResourceId,
        nsg_id: &ResourceId,
    ) -> Result<bool> {
        self.set_subnet_link(ctx, subnet_id, SubnetLink::SecurityGroup, Some(nsg_id))
            .await
    }

    pub async fn dissociate_subnet_nsg(
        &self,
        ctx: &OperationContext,
        subnet_id: &ResourceId,
    ) -> Result<bool> {
        self.set_subnet_link(ctx, subnet_id, SubnetLink::SecurityGroup, None)
            .await
    }

    pub async fn associate_subnet_route_table(
        &self,
        ctx: &OperationContext,
        subnet_id: &ResourceId,
        route_table_id: &ResourceId,
    ) -> Result<bool> {
        self.set_subnet_link(ctx, subnet_id, SubnetLink::RouteTable, Some(route_table_id))
            .await
    }

    pub async fn dissociate_subnet_route_table(
        &self,
        ctx: &OperationContext,
        subnet_id: &ResourceId,
    ) -> Result<bool> {
        self.set_subnet_link(ctx, subnet_id, SubnetLink::RouteTable, None)
            .await
    }

    /// Point one reference of a subnet at `desired` (or clear it)
    ///
    /// Both the previously referenced resource and the new one are locked.
    async fn set_subnet_link(
        &self,
        ctx: &OperationContext,
        subnet_id: &ResourceId,
        link: SubnetLink,
        desired: Option<&ResourceId>,
    ) -> Result<bool> {
        let vnet_id = virtual_network_of(subnet_id)?;
        let vnet_id = &vnet_id;
        let desired = desired.map(ToString::to_string);
        let desired = desired.as_deref();
        retry_on_reference_change(subnet_id, move || {
            self.set_subnet_link_once(ctx, vnet_id, subnet_id, link, desired)
        })
        .await
    }

    async fn set_subnet_link_once(
        &self,
        ctx: &OperationContext,
        vnet_id: &ResourceId,
        subnet_id: &ResourceId,
        link: SubnetLink,
        desired: Option<&str>,
    ) -> Result<bool> {
        let Some(current) = self.current_subnet(vnet_id, subnet_id.name()).await? else {
            if desired.is_none() {
                return Ok(false);
            }
            return Err(NetworkError::SubnetNotFound {
                virtual_network: vnet_id.name().to_string(),
                subnet: subnet_id.name().to_string(),
            });
        };

        let observed = link.get(&current).map(str::to_string);
        if observed.as_deref() == desired {
            return Ok(false);
        }

        let dependents = observed
            .iter()
            .map(String::as_str)
            .chain(desired)
            .map(|raw| link.dependent(raw))
            .collect::<Result<Vec<_>>>()?;
        let target = desired.map(str::to_string);
        let label = subnet_id.to_string();

        self.modify_subnet(ctx, subnet_id, dependents, move |subnet| {
            let slot = link.slot(subnet);
            if *slot != observed {
                return Err(NetworkError::ReferenceChanged { resource: label });
            }
            *slot = target;
            Ok(true)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Network interfaces
    // ------------------------------------------------------------------

    pub async fn associate_nic_nsg(
        &self,
        ctx: &OperationContext,
        nic_id: &ResourceId,
        nsg_id: &ResourceId,
    ) -> Result<bool> {
        let desired = nsg_id.to_string();
        let desired = desired.as_str();
        retry_on_reference_change(nic_id, move || {
            self.set_nic_nsg_once(ctx, nic_id, Some(desired))
        })
        .await
    }

    pub async fn dissociate_nic_nsg(&self, ctx: &OperationContext, nic_id: &ResourceId) -> Result<bool> {
        retry_on_reference_change(nic_id, move || self.set_nic_nsg_once(ctx, nic_id, None)).await
    }

    async fn set_nic_nsg_once(
        &self,
        ctx: &OperationContext,
        nic_id: &ResourceId,
        desired: Option<&str>,
    ) -> Result<bool> {
        let Some(current) = self.network_interfaces.get(nic_id).await? else {
            if desired.is_none() {
                return Ok(false);
            }
            return Err(CloudError::ResourceNotFound(nic_id.to_string()).into());
        };

        let observed = current.network_security_group_id;
        if observed.as_deref() == desired {
            return Ok(false);
        }

        let dependents = observed
            .iter()
            .map(String::as_str)
            .chain(desired)
            .map(Dependent::security_group)
            .collect::<Result<Vec<_>>>()?;
        let target = desired.map(str::to_string);
        let label = nic_id.to_string();

        self.modify_interface(ctx, nic_id, dependents, move |nic| {
            if nic.network_security_group_id != observed {
                return Err(NetworkError::ReferenceChanged { resource: label });
            }
            nic.network_security_group_id = target;
            Ok(true)
        })
        .await
    }

    /// Add `pool_id` to the backend pools of one IP configuration
    pub async fn associate_nic_backend_pool(
        &self,
        ctx: &OperationContext,
        nic_id: &ResourceId,
        ip_configuration: &str,
        pool_id: &ResourceId,
    ) -> Result<bool> {
        let load_balancer = load_balancer_of(pool_id)?;
        let pool = pool_id.to_string();
        let interface = nic_id.name().to_string();
        let ip_configuration = ip_configuration.to_string();

        let dependents = vec![Dependent::LoadBalancer(load_balancer)];
        self.modify_interface(ctx, nic_id, dependents, move |nic| {
            let config = nic.ip_configuration_mut(&ip_configuration).ok_or_else(|| {
                NetworkError::IpConfigurationNotFound {
                    interface: interface.clone(),
                    ip_configuration: ip_configuration.clone(),
                }
            })?;
            if config.load_balancer_backend_address_pool_ids.contains(&pool) {
                return Ok(false);
            }
            config.load_balancer_backend_address_pool_ids.push(pool);
            Ok(true)
        })
        .await
    }

    pub async fn dissociate_nic_backend_pool(
        &self,
        ctx: &OperationContext,
        nic_id: &ResourceId,
        ip_configuration: &str,
        pool_id: &ResourceId,
    ) -> Result<bool> {
        let load_balancer = load_balancer_of(pool_id)?;
        let pool = pool_id.to_string();
        let interface = nic_id.name().to_string();
        let ip_configuration = ip_configuration.to_string();

        let dependents = vec![Dependent::LoadBalancer(load_balancer)];
        self.modify_interface(ctx, nic_id, dependents, move |nic| {
            let config = nic.ip_configuration_mut(&ip_configuration).ok_or_else(|| {
                NetworkError::IpConfigurationNotFound {
                    interface: interface.clone(),
                    ip_configuration: ip_configuration.clone(),
                }
            })?;
            let pools = &mut config.load_balancer_backend_address_pool_ids;
            let before = pools.len();
            pools.retain(|p| *p != pool);
            Ok(pools.len() != before)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Security rules
    // ------------------------------------------------------------------

    /// Create or replace a rule in a network security group
    pub async fn add_security_rule(
        &self,
        ctx: &OperationContext,
        nsg_id: &ResourceId,
        rule: SecurityRule,
    ) -> Result<SecurityRule> {
        if rule.name.is_empty() {
            return Err(NetworkError::InvalidInput("security rule name is required".to_string()));
        }
        if !(MIN_RULE_PRIORITY..=MAX_RULE_PRIORITY).contains(&rule.priority) {
            return Err(NetworkError::InvalidInput(format!(
                "priority {} outside {MIN_RULE_PRIORITY}..={MAX_RULE_PRIORITY}",
                rule.priority
            )));
        }

        let keys = vec![LockKey::new(NETWORK_SECURITY_GROUP, nsg_id.name())];
        let name = rule.name.clone();

        with_locks(&self.locks, ctx, keys, move || async move {
            read_modify_write(
                self.security_groups.as_ref(),
                nsg_id,
                |nsg: &mut NetworkSecurityGroup| {
                    if let Some(other) = nsg.security_rules.iter().find(|r| {
                        r.name != rule.name
                            && r.priority == rule.priority
                            && r.direction == rule.direction
                    }) {
                        return Err(NetworkError::SecurityRuleConflict {
                            rule: rule.name.clone(),
                            existing: other.name.clone(),
                            reason: format!("priority {} already in use", rule.priority),
                        });
                    }
                    match nsg.security_rules.iter_mut().find(|r| r.name == rule.name) {
                        Some(existing) if *existing == rule => return Ok(false),
                        Some(existing) => *existing = rule,
                        None => nsg.security_rules.push(rule),
                    }
                    Ok(true)
                },
            )
            .await?;

            let nsg = wait_for_provisioning(self.security_groups.as_ref(), ctx, nsg_id, &self.poll)
                .await?;
            tracing::info!(security_group = %nsg_id, rule = %name, "Security rule provisioned");
            nsg.rule(&name).cloned().ok_or_else(|| {
                NetworkError::from(CloudError::ResourceNotFound(format!(
                    "{nsg_id}/securityRules/{name}"
                )))
            })
        })
        .await
    }

    /// Remove a rule; returns `false` if it did not exist
    pub async fn remove_security_rule(
        &self,
        ctx: &OperationContext,
        nsg_id: &ResourceId,
        rule_name: &str,
    ) -> Result<bool> {
        let keys = vec![LockKey::new(NETWORK_SECURITY_GROUP, nsg_id.name())];

        with_locks(&self.locks, ctx, keys, move || async move {
            let removed = read_modify_write(
                self.security_groups.as_ref(),
                nsg_id,
                |nsg: &mut NetworkSecurityGroup| {
                    let before = nsg.security_rules.len();
                    nsg.security_rules.retain(|r| r.name != rule_name);
                    Ok::<_, NetworkError>(nsg.security_rules.len() != before)
                },
            )
            .await?;

            if removed {
                wait_for_provisioning(self.security_groups.as_ref(), ctx, nsg_id, &self.poll)
                    .await?;
                tracing::info!(security_group = %nsg_id, rule = %rule_name, "Security rule removed");
            }
            Ok(removed)
        })
        .await
    }

    // ------------------------------------------------------------------
    // Shared steps
    // ------------------------------------------------------------------

    async fn current_subnet(&self, vnet_id: &ResourceId, name: &str) -> Result<Option<Subnet>> {
        let vnet = self.virtual_networks.get(vnet_id).await?;
        Ok(vnet.and_then(|v| v.subnet(name).cloned()))
    }

    /// Lock the virtual network and `dependents`, apply `apply` to one
    /// subnet entry, and wait for everything touched to converge
    async fn modify_subnet<F>(
        &self,
        ctx: &OperationContext,
        subnet_id: &ResourceId,
        dependents: Vec<Dependent>,
        apply: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut Subnet) -> Result<bool> + Send,
    {
        let vnet_id = virtual_network_of(subnet_id)?;
        let subnet_name = subnet_id.name().to_string();
        let mut keys = vec![LockKey::new(VIRTUAL_NETWORK, vnet_id.name())];
        keys.extend(dependents.iter().map(Dependent::lock_key));

        with_locks(&self.locks, ctx, keys, move || async move {
            let changed = read_modify_write(
                self.virtual_networks.as_ref(),
                &vnet_id,
                |vnet: &mut VirtualNetwork| match vnet.subnet_mut(&subnet_name) {
                    Some(subnet) => apply(subnet),
                    None => Err(NetworkError::SubnetNotFound {
                        virtual_network: vnet_id.name().to_string(),
                        subnet: subnet_name.clone(),
                    }),
                },
            )
            .await?;

            if changed {
                wait_for_provisioning(self.virtual_networks.as_ref(), ctx, &vnet_id, &self.poll)
                    .await?;
                for dependent in &dependents {
                    self.wait_dependent(ctx, dependent).await?;
                }
                tracing::info!(subnet = %subnet_id, "Subnet updated");
            }
            Ok(changed)
        })
        .await
    }

    /// Lock the NIC and `dependents`, apply `apply`, and wait for
    /// everything touched to converge
    async fn modify_interface<F>(
        &self,
        ctx: &OperationContext,
        nic_id: &ResourceId,
        dependents: Vec<Dependent>,
        apply: F,
    ) -> Result<bool>
    where
        F: FnOnce(&mut NetworkInterface) -> Result<bool> + Send,
    {
        let mut keys = vec![LockKey::new(NETWORK_INTERFACE, nic_id.name())];
        keys.extend(dependents.iter().map(Dependent::lock_key));

        with_locks(&self.locks, ctx, keys, move || async move {
            let changed = read_modify_write(self.network_interfaces.as_ref(), nic_id, apply).await?;

            if changed {
                wait_for_provisioning(self.network_interfaces.as_ref(), ctx, nic_id, &self.poll)
                    .await?;
                for dependent in &dependents {
                    self.wait_dependent(ctx, dependent).await?;
                }
                tracing::info!(network_interface = %nic_id, "Network interface updated");
            }
            Ok(changed)
        })
        .await
    }

    async fn wait_dependent(&self, ctx: &OperationContext, dependent: &Dependent) -> Result<()> {
        match dependent {
            Dependent::SecurityGroup(id) => {
                wait_for_provisioning(self.security_groups.as_ref(), ctx, id, &self.poll).await?;
            }
            Dependent::RouteTable(id) => {
                wait_for_provisioning(self.route_tables.as_ref(), ctx, id, &self.poll).await?;
            }
            // lock only; the pool itself is not rewritten
            Dependent::LoadBalancer(_) => {}
        }
        Ok(())
    }
}

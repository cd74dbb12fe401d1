//! In-memory management API
//!
//! Behaves like the real backend where coordination matters: reads and
//! writes take time, every PUT replaces the whole object, and a mutated
//! resource reports `Updating` (or `Deleting`) for a number of reads before
//! it settles. Concurrent writers without locks lose each other's updates
//! here exactly as they would remotely.

use crate::model::{
    NetworkInterface, NetworkSecurityGroup, ProvisioningStateMut, RouteTable, VirtualNetwork,
};
use crate::provider::{NetworkProvider, resource_type};
use armcoord_cloud::{
    CloudError, LockRegistry, LongRunningOperation, ResourceClient, ResourceId, Result,
    provisioning_state,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Latency and settling behaviour of a simulated backend
#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    /// Delay between a GET's snapshot and its response
    pub read_latency: Duration,
    /// Time a long-running operation takes to complete after being accepted
    pub operation_latency: Duration,
    /// Reads a mutated resource stays in its transitional state
    pub settle_reads: u32,
}

impl SimulatorConfig {
    pub fn new(read_latency: Duration, operation_latency: Duration, settle_reads: u32) -> Self {
        Self {
            read_latency,
            operation_latency,
            settle_reads,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stable,
    Updating { reads_left: u32 },
    Deleting { reads_left: u32 },
}

#[derive(Debug, Clone)]
struct Record<M> {
    model: M,
    phase: Phase,
    version: u64,
    updated_at: DateTime<Utc>,
}

/// Resource store for one resource kind
pub struct InMemoryArm<M> {
    resource_type: String,
    config: SimulatorConfig,
    records: Mutex<HashMap<String, Record<M>>>,
    forced_states: Mutex<HashMap<String, String>>,
    fail_next_get: Mutex<Option<String>>,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl<M: ProvisioningStateMut> InMemoryArm<M> {
    pub fn new(resource_type: impl Into<String>, config: SimulatorConfig) -> Self {
        Self {
            resource_type: resource_type.into(),
            config,
            records: Mutex::new(HashMap::new()),
            forced_states: Mutex::new(HashMap::new()),
            fail_next_get: Mutex::new(None),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    /// Seed an existing, settled resource
    pub fn insert(&self, id: &ResourceId, mut model: M) {
        model.set_provisioning_state(None);
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.insert(
            id.to_string(),
            Record {
                model,
                phase: Phase::Stable,
                version: 1,
                updated_at: Utc::now(),
            },
        );
    }

    /// Stored model without advancing its settling state
    pub fn snapshot(&self, id: &ResourceId) -> Option<M> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(&id.to_string()).map(|r| r.model.clone())
    }

    /// Number of accepted writes to `id` since it was created
    pub fn version(&self, id: &ResourceId) -> Option<u64> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(&id.to_string()).map(|r| r.version)
    }

    pub fn last_modified(&self, id: &ResourceId) -> Option<DateTime<Utc>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.get(&id.to_string()).map(|r| r.updated_at)
    }

    /// Fail the next GET (of any resource) with an API error
    pub fn fail_next_get(&self, message: impl Into<String>) {
        *self.fail_next_get.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    /// Report `state` for `id` on every read until cleared with `None`
    pub fn force_state(&self, id: &ResourceId, state: Option<&str>) {
        let mut forced = self.forced_states.lock().unwrap_or_else(PoisonError::into_inner);
        match state {
            Some(state) => forced.insert(id.to_string(), state.to_string()),
            None => forced.remove(&id.to_string()),
        };
    }

    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    fn read(&self, key: &str) -> Option<M> {
        let forced = self
            .forced_states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.get_mut(key)?;

        let state = match record.phase {
            Phase::Stable => provisioning_state::SUCCEEDED,
            Phase::Updating { reads_left: 0 } => {
                record.phase = Phase::Stable;
                provisioning_state::SUCCEEDED
            }
            Phase::Updating { reads_left } => {
                record.phase = Phase::Updating {
                    reads_left: reads_left - 1,
                };
                provisioning_state::UPDATING
            }
            Phase::Deleting { reads_left: 0 } => {
                records.remove(key);
                return None;
            }
            Phase::Deleting { reads_left } => {
                record.phase = Phase::Deleting {
                    reads_left: reads_left - 1,
                };
                provisioning_state::DELETING
            }
        };

        let mut model = record.model.clone();
        model.set_provisioning_state(Some(forced.unwrap_or_else(|| state.to_string())));
        Some(model)
    }

    fn operation(&self, description: String) -> LongRunningOperation {
        let latency = self.config.operation_latency;
        LongRunningOperation::new(description, async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl<M: ProvisioningStateMut> ResourceClient for InMemoryArm<M> {
    type Model = M;

    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<M>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next_get
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // the snapshot is taken before the response is delivered
        let result = match injected {
            Some(message) => {
                tracing::debug!(resource = %id, "Injected GET failure");
                Err(CloudError::ApiError(message))
            }
            None => Ok(self.read(&id.to_string())),
        };

        if !self.config.read_latency.is_zero() {
            tokio::time::sleep(self.config.read_latency).await;
        }
        result
    }

    async fn create_or_update(&self, id: &ResourceId, mut model: M) -> Result<LongRunningOperation> {
        model.set_provisioning_state(None);
        let phase = match self.config.settle_reads {
            0 => Phase::Stable,
            reads_left => Phase::Updating { reads_left },
        };

        let version = {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let version = records.get(&id.to_string()).map_or(1, |r| r.version + 1);
            records.insert(
                id.to_string(),
                Record {
                    model,
                    phase,
                    version,
                    updated_at: Utc::now(),
                },
            );
            version
        };
        self.puts.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(resource = %id, version, "PUT accepted");

        Ok(self.operation(format!("PUT {id}")))
    }

    async fn delete(&self, id: &ResourceId) -> Result<LongRunningOperation> {
        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            let key = id.to_string();
            match self.config.settle_reads {
                0 => {
                    records.remove(&key);
                }
                reads_left => {
                    if let Some(record) = records.get_mut(&key) {
                        record.phase = Phase::Deleting { reads_left };
                        record.updated_at = Utc::now();
                    }
                }
            }
        }
        tracing::debug!(resource = %id, "DELETE accepted");

        Ok(self.operation(format!("DELETE {id}")))
    }
}

/// One simulated store per network resource kind
#[derive(Clone)]
pub struct SimulatedNetwork {
    pub virtual_networks: Arc<InMemoryArm<VirtualNetwork>>,
    pub network_interfaces: Arc<InMemoryArm<NetworkInterface>>,
    pub security_groups: Arc<InMemoryArm<NetworkSecurityGroup>>,
    pub route_tables: Arc<InMemoryArm<RouteTable>>,
}

impl SimulatedNetwork {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            virtual_networks: Arc::new(InMemoryArm::new(
                resource_type::VIRTUAL_NETWORK,
                config.clone(),
            )),
            network_interfaces: Arc::new(InMemoryArm::new(
                resource_type::NETWORK_INTERFACE,
                config.clone(),
            )),
            security_groups: Arc::new(InMemoryArm::new(
                resource_type::NETWORK_SECURITY_GROUP,
                config.clone(),
            )),
            route_tables: Arc::new(InMemoryArm::new(resource_type::ROUTE_TABLE, config)),
        }
    }

    /// Provider backed by these stores
    pub fn provider(&self, locks: Arc<LockRegistry>) -> NetworkProvider {
        NetworkProvider::new(
            locks,
            self.virtual_networks.clone(),
            self.network_interfaces.clone(),
            self.security_groups.clone(),
            self.route_tables.clone(),
        )
    }
}

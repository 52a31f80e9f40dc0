//! Service registry boundary and an in-memory implementation.
//!
//! The registry owns every [`ServiceInstance`]. The controller only asks for
//! registration and removal; the health checker asks for health updates.

use crate::config::Protocol;
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// Health of a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// A registered replica of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// `<service>-<index>`.
    pub id: String,
    pub service: String,
    pub index: usize,
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub health: HealthStatus,
    pub metadata: BTreeMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Selection weight, 1 by default.
    pub weight: u32,
}

impl ServiceInstance {
    /// Creates a healthy instance for replica `index` of `service`.
    pub fn new(service: impl Into<String>, index: usize, host: impl Into<String>, port: u16) -> Self {
        let service = service.into();
        let now = Utc::now();
        Self {
            id: Self::instance_id(&service, index),
            service,
            index,
            host: host.into(),
            port,
            protocol: Protocol::Http,
            health: HealthStatus::Healthy,
            metadata: BTreeMap::new(),
            registered_at: now,
            last_heartbeat: now,
            weight: 1,
        }
    }

    /// Formats the id of replica `index` of `service`.
    pub fn instance_id(service: &str, index: usize) -> String {
        format!("{}-{}", service, index)
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns `http://host:port`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Returns the `version` metadata entry, if any.
    pub fn version(&self) -> Option<&str> {
        self.metadata.get("version").map(String::as_str)
    }
}

/// Options for [`ServiceRegistry::select_instance`].
#[derive(Debug, Clone, Copy)]
pub struct SelectOptions {
    pub only_healthy: bool,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self { only_healthy: true }
    }
}

/// Source of truth for service instances.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Registers an instance, replacing any instance with the same id.
    async fn register_service(&self, instance: ServiceInstance) -> Result<()>;

    /// Removes one instance, or every instance of `name` when `instance_id`
    /// is `None`. Returns the number of instances removed.
    async fn deregister_service(&self, name: &str, instance_id: Option<&str>) -> Result<usize>;

    /// Returns every instance of `name`, ordered by replica index.
    async fn discover_service(&self, name: &str) -> Result<Vec<ServiceInstance>>;

    /// Picks one instance of `name`.
    async fn select_instance(
        &self,
        name: &str,
        options: SelectOptions,
    ) -> Result<Option<ServiceInstance>>;

    /// Records a probe outcome and refreshes the heartbeat. Returns the
    /// previous health, or `None` if the instance is unknown.
    async fn update_health(
        &self,
        name: &str,
        instance_id: &str,
        health: HealthStatus,
    ) -> Result<Option<HealthStatus>>;
}

/// Registry backed by a concurrent map keyed by service name.
#[derive(Default)]
pub struct InMemoryRegistry {
    services: DashMap<String, Vec<ServiceInstance>>,
    cursors: DashMap<String, AtomicUsize>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of instances registered across all services.
    pub fn instance_count(&self) -> usize {
        self.services.iter().map(|entry| entry.len()).sum()
    }

    /// Returns the names of services with at least one instance.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter(|entry| !entry.is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn register_service(&self, instance: ServiceInstance) -> Result<()> {
        if instance.service.is_empty() {
            return Err(MeshError::Registry(format!(
                "instance {} has no service name",
                instance.id
            )));
        }

        let mut instances = self.services.entry(instance.service.clone()).or_default();
        debug!(service = %instance.service, instance = %instance.id, "registering instance");
        instances.retain(|existing| existing.id != instance.id);
        instances.push(instance);
        instances.sort_by_key(|i| i.index);
        Ok(())
    }

    async fn deregister_service(&self, name: &str, instance_id: Option<&str>) -> Result<usize> {
        let removed = match instance_id {
            Some(id) => match self.services.get_mut(name) {
                Some(mut instances) => {
                    let before = instances.len();
                    instances.retain(|i| i.id != id);
                    before - instances.len()
                }
                None => 0,
            },
            None => self
                .services
                .remove(name)
                .map(|(_, instances)| instances.len())
                .unwrap_or(0),
        };

        if removed == 0 {
            warn!(service = %name, instance = ?instance_id, "deregister matched no instance");
        } else {
            debug!(service = %name, instance = ?instance_id, removed, "deregistered");
        }
        Ok(removed)
    }

    async fn discover_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .services
            .get(name)
            .map(|instances| instances.clone())
            .unwrap_or_default())
    }

    async fn select_instance(
        &self,
        name: &str,
        options: SelectOptions,
    ) -> Result<Option<ServiceInstance>> {
        let candidates: Vec<ServiceInstance> = self
            .discover_service(name)
            .await?
            .into_iter()
            .filter(|i| !options.only_healthy || i.health.is_healthy())
            .collect();

        if candidates.is_empty() {
            return Ok(None);
        }

        let cursor = self
            .cursors
            .entry(name.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        let idx = cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates.into_iter().nth(idx))
    }

    async fn update_health(
        &self,
        name: &str,
        instance_id: &str,
        health: HealthStatus,
    ) -> Result<Option<HealthStatus>> {
        let Some(mut instances) = self.services.get_mut(name) else {
            return Ok(None);
        };
        let Some(instance) = instances.iter_mut().find(|i| i.id == instance_id) else {
            return Ok(None);
        };

        let previous = instance.health;
        instance.health = health;
        instance.last_heartbeat = Utc::now();
        Ok(Some(previous))
    }
}

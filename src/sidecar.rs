//! Sidecar bookkeeping.
//!
//! Sidecars are tracked per (service, replica, sidecar name). A record is
//! created as running when its replica is registered and marked stopped when
//! the replica is scaled away or the mesh shuts down.

use crate::config::SidecarConfig;
use crate::events::{EventBus, MeshEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SidecarStatus {
    Running,
    Stopped,
}

/// Identity of one sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SidecarKey {
    pub service: String,
    pub replica_index: usize,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SidecarRecord {
    pub key: SidecarKey,
    pub image: Option<String>,
    pub status: SidecarStatus,
    pub started_at: DateTime<Utc>,
}

pub struct SidecarManager {
    records: DashMap<SidecarKey, SidecarRecord>,
    events: EventBus,
}

impl SidecarManager {
    pub fn new(events: EventBus) -> Self {
        Self {
            records: DashMap::new(),
            events,
        }
    }

    /// Starts every sidecar declared for replica `index` of `service`.
    pub fn start_for_instance(&self, service: &str, index: usize, sidecars: &[SidecarConfig]) {
        for sidecar in sidecars {
            let key = SidecarKey {
                service: service.to_string(),
                replica_index: index,
                name: sidecar.name.clone(),
            };
            debug!(service = %service, replica = index, sidecar = %sidecar.name, "starting sidecar");
            self.records.insert(
                key.clone(),
                SidecarRecord {
                    key,
                    image: sidecar.image.clone(),
                    status: SidecarStatus::Running,
                    started_at: Utc::now(),
                },
            );
            self.events.publish(MeshEvent::SidecarStarted {
                service: service.to_string(),
                replica_index: index,
                name: sidecar.name.clone(),
            });
        }
    }

    /// Stops the sidecars of one replica. Returns how many were running.
    pub fn stop_replica(&self, service: &str, index: usize) -> usize {
        let keys: Vec<SidecarKey> = self
            .records
            .iter()
            .filter(|r| r.key().service == service && r.key().replica_index == index)
            .map(|r| r.key().clone())
            .collect();
        keys.into_iter().filter(|key| self.stop(key)).count()
    }

    /// Stops every running sidecar.
    pub fn stop_all(&self) -> usize {
        let mut keys: Vec<SidecarKey> = self.records.iter().map(|r| r.key().clone()).collect();
        keys.sort();
        keys.into_iter().filter(|key| self.stop(key)).count()
    }

    fn stop(&self, key: &SidecarKey) -> bool {
        {
            let Some(mut record) = self.records.get_mut(key) else {
                return false;
            };
            if record.status == SidecarStatus::Stopped {
                return false;
            }
            record.status = SidecarStatus::Stopped;
        }
        debug!(service = %key.service, replica = key.replica_index, sidecar = %key.name, "stopping sidecar");
        self.events.publish(MeshEvent::SidecarStopped {
            service: key.service.clone(),
            replica_index: key.replica_index,
            name: key.name.clone(),
        });
        true
    }

    /// Forgets every record, running or not.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Number of running sidecars.
    pub fn running(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.status == SidecarStatus::Running)
            .count()
    }

    /// Returns all records sorted by key.
    pub fn records(&self) -> Vec<SidecarRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sidecars() -> Vec<SidecarConfig> {
        vec![
            SidecarConfig {
                name: "envoy".to_string(),
                image: Some("envoy:1.30".to_string()),
            },
            SidecarConfig {
                name: "log-shipper".to_string(),
                image: None,
            },
        ]
    }

    #[test]
    fn test_start_creates_running_records() {
        let manager = SidecarManager::new(EventBus::new(16));
        manager.start_for_instance("orders", 0, &sidecars());
        manager.start_for_instance("orders", 1, &sidecars());

        assert_eq!(manager.len(), 4);
        assert!(manager
            .records()
            .iter()
            .all(|r| r.status == SidecarStatus::Running));
    }

    #[test]
    fn test_stop_replica_only_touches_that_replica() {
        let events = EventBus::new(16);
        let manager = SidecarManager::new(events.clone());
        manager.start_for_instance("orders", 0, &sidecars());
        manager.start_for_instance("orders", 1, &sidecars());

        let mut rx = events.subscribe();
        assert_eq!(manager.stop_replica("orders", 1), 2);
        assert_eq!(manager.stop_replica("orders", 1), 0);
        assert_eq!(manager.running(), 2);
        assert!(manager
            .records()
            .iter()
            .filter(|r| r.status == SidecarStatus::Running)
            .all(|r| r.key.replica_index == 0));
        assert_eq!(rx.try_recv().unwrap().name(), "sidecar:stopped");
    }

    #[test]
    fn test_stop_all() {
        let manager = SidecarManager::new(EventBus::new(16));
        manager.start_for_instance("orders", 0, &sidecars());
        assert_eq!(manager.stop_all(), 2);
        assert_eq!(manager.running(), 0);
        assert_eq!(manager.stop_all(), 0);

        manager.clear();
        assert!(manager.is_empty());
    }
}

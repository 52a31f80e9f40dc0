//! Lifecycle notifications published by the control plane.
//!
//! Operators and dashboards subscribe to an [`EventBus`] and receive every
//! [`MeshEvent`] published after the subscription was taken. Publishing never
//! blocks and never fails when nobody is listening.

use crate::config::{GatewayType, PolicyType};
use crate::metrics::MeshMetrics;
use crate::registry::HealthStatus;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// A notification emitted by the mesh.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    MeshInitialized {
        mesh: String,
        services: usize,
        gateways: usize,
        policies: usize,
    },
    MeshShutdown {
        mesh: String,
    },
    /// Published only when an instance changes state.
    ServiceHealthChanged {
        service: String,
        instance_id: String,
        previous: HealthStatus,
        current: HealthStatus,
    },
    ServiceScaled {
        service: String,
        from: u32,
        to: u32,
    },
    PolicyAdded {
        name: String,
    },
    PolicyRemoved {
        name: String,
    },
    PolicyApplied {
        name: String,
        policy_type: PolicyType,
        target: String,
    },
    GatewaySetup {
        name: String,
        gateway_type: GatewayType,
        routes: usize,
        /// Middleware names in the order the gateway declares them.
        middleware: Vec<String>,
    },
    MetricsUpdated {
        service: String,
        metrics: MeshMetrics,
    },
    MetricsEnabled {
        path: String,
    },
    TracingEnabled {
        sample_rate: f64,
    },
    SidecarStarted {
        service: String,
        replica_index: usize,
        name: String,
    },
    SidecarStopped {
        service: String,
        replica_index: usize,
        name: String,
    },
}

impl MeshEvent {
    /// Returns the wire name of the notification.
    pub fn name(&self) -> &'static str {
        match self {
            MeshEvent::MeshInitialized { .. } => "mesh:initialized",
            MeshEvent::MeshShutdown { .. } => "mesh:shutdown",
            MeshEvent::ServiceHealthChanged { .. } => "service:health_changed",
            MeshEvent::ServiceScaled { .. } => "service:scaled",
            MeshEvent::PolicyAdded { .. } => "policy:added",
            MeshEvent::PolicyRemoved { .. } => "policy:removed",
            MeshEvent::PolicyApplied { .. } => "policy:applied",
            MeshEvent::GatewaySetup { .. } => "gateway:setup",
            MeshEvent::MetricsUpdated { .. } => "metrics:updated",
            MeshEvent::MetricsEnabled { .. } => "monitoring:metrics_enabled",
            MeshEvent::TracingEnabled { .. } => "monitoring:tracing_enabled",
            MeshEvent::SidecarStarted { .. } => "sidecar:started",
            MeshEvent::SidecarStopped { .. } => "sidecar:stopped",
        }
    }
}

/// Publish/subscribe channel for [`MeshEvent`]s.
///
/// Cloning shares the underlying channel. Slow subscribers that fall more
/// than `capacity` events behind observe a `Lagged` error and skip ahead.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to all events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event to all current subscribers.
    pub fn publish(&self, event: MeshEvent) {
        trace!(event = event.name(), "publishing");
        // An error only means there are no subscribers.
        let _ = self.sender.send(event);
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Hands every event to `handle` until `shutdown` fires or the bus closes.
///
/// Events already queued when the shutdown signal arrives are still handed
/// over, so a final `mesh:shutdown` published before the signal is never
/// lost.
pub async fn forward_events(
    mut events: broadcast::Receiver<MeshEvent>,
    mut shutdown: broadcast::Receiver<()>,
    mut handle: impl FnMut(&MeshEvent),
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => handle(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event log lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.recv() => {
                while let Ok(event) = events.try_recv() {
                    handle(&event);
                }
                break;
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

//! Active health checking.
//!
//! One loop per service sweeps all of its instances on a fixed interval.
//! Probes within a sweep run concurrently and each is bounded by the
//! service's probe timeout. A 2xx answer marks an instance healthy; anything
//! else marks it unhealthy. `service:health_changed` is published only when
//! an instance actually changes state.
//!
//! Probe tasks never touch the registry. Results are applied by the loop
//! itself, so cancelling a loop mid-sweep cannot race a later deregistration.

use crate::config::HealthCheckConfig;
use crate::error::{MeshError, Result};
use crate::events::{EventBus, MeshEvent};
use crate::registry::{HealthStatus, ServiceInstance, ServiceRegistry};
use async_trait::async_trait;
use http::{Request, Uri};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Checks a single instance.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Returns `Ok(())` if the instance is healthy.
    async fn probe(&self, instance: &ServiceInstance, check: &HealthCheckConfig) -> Result<()>;
}

/// Probes `GET http://host:port<path>` and expects a 2xx status.
#[derive(Clone)]
pub struct HttpProbe {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, instance: &ServiceInstance, check: &HealthCheckConfig) -> Result<()> {
        let target = format!("{}{}", instance.base_url(), check.path);
        let failed = |reason: String| MeshError::HealthProbe {
            target: target.clone(),
            reason,
        };

        let uri: Uri = target
            .parse()
            .map_err(|e| failed(format!("invalid uri: {}", e)))?;
        let request = Request::get(uri)
            .body(Empty::new())
            .map_err(|e| failed(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| failed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(failed(format!("status {}", response.status())))
        }
    }
}

/// Shared state for sweeps.
#[derive(Clone)]
struct Sweeper {
    registry: Arc<dyn ServiceRegistry>,
    probe: Arc<dyn HealthProbe>,
    events: EventBus,
}

impl Sweeper {
    /// Probes every instance of `service` once. Returns the number of
    /// instances that changed state.
    async fn sweep(&self, service: &str, check: &HealthCheckConfig) -> usize {
        let instances = match self.registry.discover_service(service).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(service = %service, error = %e, "failed to list instances for health check");
                return 0;
            }
        };

        let mut probes = JoinSet::new();
        for instance in instances {
            let probe = Arc::clone(&self.probe);
            let check = check.clone();
            probes.spawn(async move {
                let outcome = match timeout(check.timeout(), probe.probe(&instance, &check)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(MeshError::HealthProbe {
                        target: format!("{}{}", instance.base_url(), check.path),
                        reason: format!("timed out after {}ms", check.timeout_ms),
                    }),
                };
                (instance, outcome)
            });
        }

        let mut transitions = 0;
        while let Some(joined) = probes.join_next().await {
            let (instance, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    debug!(service = %service, error = %e, "probe task did not complete");
                    continue;
                }
            };

            let current = match outcome {
                Ok(()) => HealthStatus::Healthy,
                Err(e) => {
                    debug!(service = %service, instance = %instance.id, error = %e, "health probe failed");
                    HealthStatus::Unhealthy
                }
            };

            match self
                .registry
                .update_health(service, &instance.id, current)
                .await
            {
                Ok(Some(previous)) if previous != current => {
                    transitions += 1;
                    if current.is_healthy() {
                        info!(service = %service, instance = %instance.id, "instance became healthy");
                    } else {
                        warn!(service = %service, instance = %instance.id, "instance became unhealthy");
                    }
                    self.events.publish(MeshEvent::ServiceHealthChanged {
                        service: service.to_string(),
                        instance_id: instance.id.clone(),
                        previous,
                        current,
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(service = %service, instance = %instance.id, error = %e, "failed to record health");
                }
            }
        }
        transitions
    }
}

/// Runs the per-service health-check loops.
pub struct HealthChecker {
    sweeper: Sweeper,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    shutdown: broadcast::Sender<()>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        probe: Arc<dyn HealthProbe>,
        events: EventBus,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            sweeper: Sweeper {
                registry,
                probe,
                events,
            },
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Starts the loop for `service`. The first sweep happens one interval
    /// after the call.
    pub fn start(&self, service: &str, check: HealthCheckConfig) {
        let period = check.interval().max(Duration::from_millis(1));
        let sweeper = self.sweeper.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let name = service.to_string();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(service = %name, interval_ms = check.interval_ms, "health check loop started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sweeper.sweep(&name, &check) => {}
                }
            }

            debug!(service = %name, "health check loop stopped");
        });

        self.tasks.lock().push((service.to_string(), handle));
    }

    /// Sweeps `service` once, outside any loop. Returns the number of
    /// instances that changed state.
    pub async fn check_service(&self, service: &str, check: &HealthCheckConfig) -> usize {
        self.sweeper.sweep(service, check).await
    }

    /// Number of running loops.
    pub fn running(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Signals every loop to stop and waits until all have exited.
    pub async fn stop_all(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }

        // An error only means every loop already exited.
        let _ = self.shutdown.send(());
        for (service, handle) in tasks {
            if let Err(e) = handle.await {
                warn!(service = %service, error = %e, "health check loop ended abnormally");
            }
        }
        info!("health checks stopped");
    }
}

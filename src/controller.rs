//! The mesh controller.
//!
//! Owns the topology, policies and gateways of one mesh and routes requests
//! through them. Lifecycle operations (`initialize`, `scale_service`,
//! `shutdown`) are serialized; `route_request` runs concurrently with
//! everything and only touches the shared maps.

use crate::balancer::WeightedRoundRobin;
use crate::cache::{cache_key, CacheControl, ResponseCache};
use crate::client::{HttpClient, RequestOptions, UpstreamResponse};
use crate::config::{MeshConfig, PolicyConfig, ServiceConfig};
use crate::error::{MeshError, Result};
use crate::events::{EventBus, MeshEvent};
use crate::health::{HealthChecker, HealthProbe, HttpProbe};
use crate::metrics::MetricsAggregator;
use crate::policy::{PolicyEngine, RequestDirectives};
use crate::registry::{ServiceInstance, ServiceRegistry};
use crate::request::{MeshRequest, MeshResponse};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::router::{GatewayRouter, RouteMatch};
use crate::sidecar::SidecarManager;
use http::{HeaderMap, Method, StatusCode};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Request headers that partition cached responses.
const CACHE_VARY: [&str; 2] = ["accept", "authorization"];

/// Per-service state tracked by the controller.
#[derive(Debug, Clone)]
struct ServiceState {
    config: ServiceConfig,
    replicas: u32,
}

/// Builder for [`MeshController`].
pub struct MeshControllerBuilder {
    registry: Arc<dyn ServiceRegistry>,
    client: Arc<dyn HttpClient>,
    probe: Option<Arc<dyn HealthProbe>>,
    events: Option<EventBus>,
    cache: Option<(Arc<dyn ResponseCache>, Duration)>,
}

impl MeshControllerBuilder {
    /// Probe used by health-check loops. Defaults to [`HttpProbe`].
    pub fn health_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Bus notifications are published on. Defaults to a bus of capacity
    /// 1024.
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Serves GET requests through `cache`. Responses without a
    /// `Cache-Control` max-age are kept for `default_ttl`.
    pub fn response_cache(mut self, cache: Arc<dyn ResponseCache>, default_ttl: Duration) -> Self {
        self.cache = Some((cache, default_ttl));
        self
    }

    pub fn build(self) -> MeshController {
        let events = self.events.unwrap_or_default();
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(HttpProbe::new()) as Arc<dyn HealthProbe>);

        MeshController {
            health: HealthChecker::new(Arc::clone(&self.registry), probe, events.clone()),
            policies: PolicyEngine::new(events.clone()),
            sidecars: SidecarManager::new(events.clone()),
            registry: self.registry,
            client: self.client,
            cache: self.cache,
            router: RwLock::new(GatewayRouter::new()),
            metrics: MetricsAggregator::new(),
            balancer: WeightedRoundRobin::new(),
            services: RwLock::new(BTreeMap::new()),
            mesh: RwLock::new(None),
            running: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            events,
        }
    }
}

/// Control plane for one mesh.
pub struct MeshController {
    registry: Arc<dyn ServiceRegistry>,
    client: Arc<dyn HttpClient>,
    cache: Option<(Arc<dyn ResponseCache>, Duration)>,
    events: EventBus,
    policies: PolicyEngine,
    router: RwLock<GatewayRouter>,
    metrics: MetricsAggregator,
    sidecars: SidecarManager,
    health: HealthChecker,
    balancer: WeightedRoundRobin,
    services: RwLock<BTreeMap<String, ServiceState>>,
    /// `namespace`, `namespace/name` of the running mesh.
    mesh: RwLock<Option<(String, String)>>,
    running: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
}

impl MeshController {
    pub fn builder(
        registry: Arc<dyn ServiceRegistry>,
        client: Arc<dyn HttpClient>,
    ) -> MeshControllerBuilder {
        MeshControllerBuilder {
            registry,
            client,
            probe: None,
            events: None,
            cache: None,
        }
    }

    /// Creates a controller with an HTTP health probe and a default bus.
    pub fn new(registry: Arc<dyn ServiceRegistry>, client: Arc<dyn HttpClient>) -> Self {
        Self::builder(registry, client).build()
    }

    /// Brings the mesh up from `config`.
    ///
    /// The configuration is validated before anything is touched, so a bad
    /// reference leaves the mesh exactly as it was. If the registry rejects an
    /// instance, instances registered so far are removed again. Calling this
    /// on a running mesh logs a warning and does nothing.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for invalid configuration and the registry's
    /// error if registration fails.
    #[instrument(skip(self, config), fields(mesh = %config.identity()))]
    pub async fn initialize(&self, config: MeshConfig) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_running() {
            warn!("mesh already initialized");
            return Ok(());
        }

        config.validate()?;
        self.reset_state();

        self.policies.configure_security(&config.security);
        for policy in &config.policies {
            self.policies.apply_policy(policy.clone());
        }

        {
            let mut router = self.router.write();
            for gateway in &config.gateways {
                router.add_gateway(gateway.clone());
            }
        }
        for gateway in &config.gateways {
            info!(gateway = %gateway.name, gateway_type = ?gateway.gateway_type, routes = gateway.routes.len(), middleware = ?gateway.middleware, "gateway configured");
            self.events.publish(MeshEvent::GatewaySetup {
                name: gateway.name.clone(),
                gateway_type: gateway.gateway_type,
                routes: gateway.routes.len(),
                middleware: gateway.middleware.clone(),
            });
        }

        let mut registered: Vec<(String, String)> = Vec::new();
        for service in &config.services {
            self.metrics.register_service(&service.name);
            for index in 0..service.replicas as usize {
                let instance = Self::build_instance(service, index, &config.namespace);
                let id = instance.id.clone();
                if let Err(e) = self.registry.register_service(instance).await {
                    warn!(service = %service.name, instance = %id, error = %e, "registration failed, rolling back");
                    for (name, id) in registered.iter().rev() {
                        if let Err(e) = self.registry.deregister_service(name, Some(id)).await {
                            warn!(service = %name, instance = %id, error = %e, "rollback deregistration failed");
                        }
                    }
                    self.sidecars.stop_all();
                    self.reset_state();
                    return Err(e);
                }
                registered.push((service.name.clone(), id));
                self.sidecars
                    .start_for_instance(&service.name, index, &service.sidecars);
            }
            self.services.write().insert(
                service.name.clone(),
                ServiceState {
                    config: service.clone(),
                    replicas: service.replicas,
                },
            );
            info!(service = %service.name, replicas = service.replicas, "service registered");
        }

        for service in &config.services {
            self.health
                .start(&service.name, service.health_check.clone());
        }

        let monitoring = &config.monitoring;
        if monitoring.metrics.enabled {
            info!(path = %monitoring.metrics.path, "metrics export enabled");
            self.events.publish(MeshEvent::MetricsEnabled {
                path: monitoring.metrics.path.clone(),
            });
        }
        if monitoring.tracing.enabled {
            info!(sample_rate = monitoring.tracing.sample_rate, "tracing enabled");
            self.events.publish(MeshEvent::TracingEnabled {
                sample_rate: monitoring.tracing.sample_rate,
            });
        }

        *self.mesh.write() = Some((config.namespace.clone(), config.identity()));
        self.running.store(true, Ordering::SeqCst);
        info!(
            services = config.services.len(),
            gateways = config.gateways.len(),
            policies = config.policies.len(),
            "mesh initialized"
        );
        self.events.publish(MeshEvent::MeshInitialized {
            mesh: config.identity(),
            services: config.services.len(),
            gateways: config.gateways.len(),
            policies: config.policies.len(),
        });
        Ok(())
    }

    fn build_instance(service: &ServiceConfig, index: usize, namespace: &str) -> ServiceInstance {
        let (host, port) = service.instance_address(index, namespace);
        ServiceInstance::new(&service.name, index, host, port)
            .with_protocol(service.primary_protocol())
            .with_metadata("version", &service.version)
            .with_metadata("namespace", namespace)
    }

    fn reset_state(&self) {
        self.policies.clear();
        self.router.write().clear();
        self.services.write().clear();
        self.sidecars.clear();
        *self.mesh.write() = None;
    }

    /// Routes one request to a service instance.
    ///
    /// Metrics for the resolved service are recorded for every outcome,
    /// including policy rejections. An unmatched request changes nothing.
    ///
    /// # Errors
    ///
    /// - `NotRunning` before `initialize` or after `shutdown`
    /// - `RouteNotFound` when no ingress route matches
    /// - `Authorization` or `RateLimitExceeded` when a policy rejects
    /// - `CircuitOpen` when the service's breaker is open
    /// - `NoHealthyInstance` when nothing can serve the request
    /// - `Upstream` for transport failures, timeouts and non-2xx statuses
    #[instrument(skip(self, request), fields(method = %request.method, host = %request.host, path = %request.path))]
    pub async fn route_request(&self, request: MeshRequest) -> Result<MeshResponse> {
        if !self.is_running() {
            return Err(MeshError::NotRunning);
        }

        let host = request.host_only();
        let matched = self
            .router
            .read()
            .route(&host, &request.path, &request.method)
            .ok_or_else(|| MeshError::RouteNotFound {
                host: host.clone(),
                path: request.path_only().to_string(),
                method: request.method.to_string(),
            })?;

        let service = matched.route.service.clone();
        let start = Instant::now();
        let result = self.dispatch(&matched, &request).await;
        let latency = start.elapsed();

        let metrics = self.metrics.record_request(&service, result.is_ok(), latency);
        self.events.publish(MeshEvent::MetricsUpdated {
            service: service.clone(),
            metrics,
        });

        match result {
            Ok((response, cached)) => {
                debug!(service = %service, instance = %response.instance_id, status = %response.status, cached, latency_ms = latency.as_millis() as u64, "request routed");
                Ok(MeshResponse {
                    status: response.status,
                    headers: response.headers,
                    body: response.data,
                    service,
                    instance: response.instance_id,
                    cached,
                    latency,
                })
            }
            Err(e) => {
                warn!(service = %service, error = %e, latency_ms = latency.as_millis() as u64, "request failed");
                Err(e)
            }
        }
    }

    /// Applies policies, then answers from the response cache or calls
    /// instances until one succeeds or the retry budget is spent. The flag is
    /// true for cache hits.
    async fn dispatch(
        &self,
        matched: &RouteMatch,
        request: &MeshRequest,
    ) -> Result<(UpstreamResponse, bool)> {
        let service = matched.route.service.as_str();
        let directives = self.policies.apply_request_policies(service, request)?;

        let cache = match &self.cache {
            // Responses to authenticated callers are never shared.
            Some((cache, ttl))
                if request.method == Method::GET && directives.principal.is_none() =>
            {
                let (path, query) = match matched.upstream_path.split_once('?') {
                    Some((path, query)) => (path, Some(query)),
                    None => (matched.upstream_path.as_str(), None),
                };
                let key = cache_key(
                    service,
                    &Method::GET,
                    path,
                    query,
                    &request.headers,
                    &CACHE_VARY,
                );
                let hit = cache.get(&key).await;
                self.metrics.record_cache_lookup(service, hit.is_some());
                if let Some(data) = hit {
                    debug!(service = %service, key = %key, "cache hit");
                    return Ok((
                        UpstreamResponse {
                            status: StatusCode::OK,
                            headers: HeaderMap::new(),
                            data,
                            success: true,
                            instance_id: String::new(),
                        },
                        true,
                    ));
                }
                Some((cache, *ttl, key))
            }
            _ => None,
        };

        let response = self.call_with_retries(matched, request, &directives).await?;
        if let Some((cache, default_ttl, key)) = cache {
            if let Some(ttl) = CacheControl::from_headers(&response.headers).ttl(default_ttl) {
                cache.set(&key, response.data.clone(), Some(ttl)).await;
            }
        }
        Ok((response, false))
    }

    /// Calls instances until one succeeds or the retry budget is spent.
    async fn call_with_retries(
        &self,
        matched: &RouteMatch,
        request: &MeshRequest,
        directives: &RequestDirectives,
    ) -> Result<UpstreamResponse> {
        let service = matched.route.service.as_str();

        let timeout = directives.timeout.unwrap_or_else(|| matched.route.timeout());
        let retry_config = directives
            .retry
            .clone()
            .unwrap_or_else(|| RetryConfig::for_route(matched.route.retries));
        let mut retry = RetryPolicy::new(retry_config);

        loop {
            if let Some(breaker) = &directives.breaker {
                if !breaker.allow_request() {
                    return Err(MeshError::CircuitOpen {
                        service: service.to_string(),
                        path: request.path_only().to_string(),
                    });
                }
            }

            let outcome = self
                .call_once(service, &matched.upstream_path, request, directives, timeout)
                .await;

            match outcome {
                Ok(response) => {
                    if let Some(breaker) = &directives.breaker {
                        breaker.record_success();
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if let Some(breaker) = &directives.breaker {
                        if !counts_against_breaker(&e) {
                            breaker.release();
                        } else if breaker.record_failure() {
                            self.metrics.record_circuit_breaker_trip(service);
                        }
                    }
                    if retry.should_retry_error(&e) {
                        if let Some(delay) = retry.record_retry() {
                            debug!(service = %service, attempt = retry.attempt(), error = %e, "retrying");
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One attempt: select a healthy instance and call it.
    async fn call_once(
        &self,
        service: &str,
        path: &str,
        request: &MeshRequest,
        directives: &RequestDirectives,
        timeout: Duration,
    ) -> Result<UpstreamResponse> {
        let instance = self.select_instance(service, path, directives).await?;
        let options = RequestOptions::new(request.method.clone(), timeout)
            .with_headers(request.headers.clone())
            .with_data(request.body.clone())
            .with_instance(instance);

        let response = self.client.request(service, path, options).await?;
        if response.success {
            Ok(response)
        } else {
            Err(MeshError::Upstream {
                service: service.to_string(),
                path: path.to_string(),
                status: Some(response.status.as_u16()),
                reason: format!("upstream returned {}", response.status),
            })
        }
    }

    /// Picks a healthy instance by weighted round robin.
    async fn select_instance(
        &self,
        service: &str,
        path: &str,
        directives: &RequestDirectives,
    ) -> Result<ServiceInstance> {
        let healthy: Vec<ServiceInstance> = self
            .registry
            .discover_service(service)
            .await?
            .into_iter()
            .filter(|i| i.health.is_healthy())
            .collect();

        self.balancer
            .select(service, &healthy, |i| directives.weight_for(i))
            .ok_or_else(|| MeshError::NoHealthyInstance {
                service: service.to_string(),
                path: path.to_string(),
            })
    }

    /// Scales `name` to `target` replicas.
    ///
    /// Growing adds the next indices; shrinking removes the highest indices
    /// and stops their sidecars. Returns `false` if the service is unknown.
    #[instrument(skip(self))]
    pub async fn scale_service(&self, name: &str, target: u32) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;
        let Some(state) = self.services.read().get(name).cloned() else {
            warn!(service = %name, "cannot scale unknown service");
            return Ok(false);
        };
        let namespace = self
            .mesh
            .read()
            .as_ref()
            .map(|(namespace, _)| namespace.clone())
            .unwrap_or_default();

        let current = state.replicas;
        if target > current {
            for index in current as usize..target as usize {
                let instance = Self::build_instance(&state.config, index, &namespace);
                self.registry.register_service(instance).await?;
                self.sidecars
                    .start_for_instance(name, index, &state.config.sidecars);
                if let Some(s) = self.services.write().get_mut(name) {
                    s.replicas = index as u32 + 1;
                }
            }
        } else if target < current {
            for index in (target as usize..current as usize).rev() {
                let id = ServiceInstance::instance_id(name, index);
                self.registry.deregister_service(name, Some(&id)).await?;
                self.sidecars.stop_replica(name, index);
                if let Some(s) = self.services.write().get_mut(name) {
                    s.replicas = index as u32;
                }
            }
        }

        info!(service = %name, from = current, to = target, "service scaled");
        self.events.publish(MeshEvent::ServiceScaled {
            service: name.to_string(),
            from: current,
            to: target,
        });
        Ok(true)
    }

    /// Adds or replaces a policy and applies it immediately.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if the policy targets an unknown service or
    /// mixes rule types.
    pub fn add_policy(&self, policy: PolicyConfig) -> Result<()> {
        {
            let services = self.services.read();
            policy.validate_against(|name| services.contains_key(name))?;
        }
        let name = policy.name.clone();
        self.policies.apply_policy(policy);
        info!(policy = %name, "policy added");
        self.events.publish(MeshEvent::PolicyAdded { name });
        Ok(())
    }

    /// Removes a policy. Returns `false` if no policy had that name.
    pub fn remove_policy(&self, name: &str) -> bool {
        if self.policies.remove_policy(name).is_none() {
            return false;
        }
        info!(policy = %name, "policy removed");
        self.events.publish(MeshEvent::PolicyRemoved {
            name: name.to_string(),
        });
        true
    }

    /// Stops health checks, deregisters every instance, stops sidecars and
    /// marks the mesh stopped. Does nothing if the mesh is not running.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if !self.is_running() {
            debug!("mesh not running, nothing to shut down");
            return Ok(());
        }

        // Loops must be gone before their instances are.
        self.health.stop_all().await;

        let services: Vec<(String, u32)> = self
            .services
            .read()
            .iter()
            .map(|(name, state)| (name.clone(), state.replicas))
            .collect();
        for (name, replicas) in services {
            for index in (0..replicas as usize).rev() {
                let id = ServiceInstance::instance_id(&name, index);
                if let Err(e) = self.registry.deregister_service(&name, Some(&id)).await {
                    warn!(service = %name, instance = %id, error = %e, "deregistration failed");
                }
            }
            self.balancer.reset(&name);
        }

        let stopped = self.sidecars.stop_all();
        debug!(sidecars = stopped, "sidecars stopped");

        let mesh = self
            .mesh
            .read()
            .as_ref()
            .map(|(_, identity)| identity.clone())
            .unwrap_or_default();
        self.running.store(false, Ordering::SeqCst);
        self.services.write().clear();
        info!(mesh = %mesh, "mesh shut down");
        self.events.publish(MeshEvent::MeshShutdown { mesh });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &MetricsAggregator {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    pub fn policies(&self) -> &PolicyEngine {
        &self.policies
    }

    pub fn sidecars(&self) -> &SidecarManager {
        &self.sidecars
    }

    /// Number of running health-check loops.
    pub fn health_loops(&self) -> usize {
        self.health.running()
    }

    /// Names of the configured services.
    pub fn service_names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }

    /// Current replica count of `name`.
    pub fn replicas(&self, name: &str) -> Option<u32> {
        self.services.read().get(name).map(|s| s.replicas)
    }

    /// Every registered instance of every configured service.
    pub async fn instances(&self) -> Result<Vec<ServiceInstance>> {
        let mut all = Vec::new();
        for name in self.service_names() {
            all.extend(self.registry.discover_service(&name).await?);
        }
        Ok(all)
    }
}

/// Transport failures and 5xx statuses count as breaker failures; 4xx
/// statuses and local rejections do not.
fn counts_against_breaker(error: &MeshError) -> bool {
    match error {
        MeshError::Upstream { status, .. } => status.map_or(true, |s| s >= 500),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Environment, GatewayConfig, MonitoringConfig, PolicyAction, PolicyCondition, PolicyRule,
        PolicyType, RateLimitingConfig, RouteConfig, SecurityConfig,
    };
    use crate::cache::InMemoryResponseCache;
    use crate::registry::{HealthStatus, InMemoryRegistry, SelectOptions};
    use async_trait::async_trait;
    use http::{HeaderMap, StatusCode};
    use hyper::body::Bytes;
    use parking_lot::Mutex;
    use std::net::{IpAddr, Ipv4Addr};

    /// Answers every call with a fixed status and records what was called.
    struct FakeClient {
        status: Mutex<StatusCode>,
        calls: Mutex<Vec<(String, String, String)>>,
    }

    impl FakeClient {
        fn new(status: StatusCode) -> Arc<Self> {
            Arc::new(Self {
                status: Mutex::new(status),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String, String)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl HttpClient for FakeClient {
        async fn request(
            &self,
            service_name: &str,
            path: &str,
            options: RequestOptions,
        ) -> Result<UpstreamResponse> {
            let instance_id = options
                .instance
                .map(|i| i.id)
                .unwrap_or_default();
            self.calls.lock().push((
                service_name.to_string(),
                path.to_string(),
                instance_id.clone(),
            ));
            let status = *self.status.lock();
            Ok(UpstreamResponse {
                status,
                headers: HeaderMap::new(),
                data: Bytes::from_static(b"ok"),
                success: status.is_success(),
                instance_id,
            })
        }
    }

    /// Forwards to an in-memory registry and logs deregistrations and
    /// health updates in call order.
    #[derive(Default)]
    struct RecordingRegistry {
        inner: InMemoryRegistry,
        log: Mutex<Vec<String>>,
    }

    impl RecordingRegistry {
        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        fn deregistrations(&self) -> usize {
            self.log()
                .iter()
                .filter(|entry| entry.starts_with("deregister"))
                .count()
        }
    }

    #[async_trait]
    impl ServiceRegistry for RecordingRegistry {
        async fn register_service(&self, instance: ServiceInstance) -> Result<()> {
            self.inner.register_service(instance).await
        }

        async fn deregister_service(&self, name: &str, instance_id: Option<&str>) -> Result<usize> {
            self.log
                .lock()
                .push(format!("deregister {}", instance_id.unwrap_or(name)));
            self.inner.deregister_service(name, instance_id).await
        }

        async fn discover_service(&self, name: &str) -> Result<Vec<ServiceInstance>> {
            self.inner.discover_service(name).await
        }

        async fn select_instance(
            &self,
            name: &str,
            options: SelectOptions,
        ) -> Result<Option<ServiceInstance>> {
            self.inner.select_instance(name, options).await
        }

        async fn update_health(
            &self,
            name: &str,
            instance_id: &str,
            health: HealthStatus,
        ) -> Result<Option<HealthStatus>> {
            self.log.lock().push(format!("health {}", instance_id));
            self.inner.update_health(name, instance_id, health).await
        }
    }

    struct AlwaysHealthy;

    #[async_trait]
    impl HealthProbe for AlwaysHealthy {
        async fn probe(
            &self,
            _instance: &ServiceInstance,
            _check: &crate::config::HealthCheckConfig,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn mesh_config() -> MeshConfig {
        MeshConfig {
            name: "shop".to_string(),
            namespace: "prod".to_string(),
            version: "1.0".to_string(),
            environment: Environment::default(),
            services: vec![
                ServiceConfig::new("orders", 3, 8080).with_sidecar("envoy"),
                ServiceConfig::new("users", 1, 8081),
            ],
            policies: Vec::new(),
            gateways: vec![GatewayConfig::ingress("public", 80, &["shop.example.com"])
                .with_middleware("cors")
                .with_middleware("compression")
                .with_route(RouteConfig::new("/api/orders/*", "orders").with_methods(&["GET", "POST"]))
                .with_route(RouteConfig::new("/api/users/*", "users"))],
            monitoring: MonitoringConfig::default(),
            security: SecurityConfig::default(),
        }
    }

    fn controller(client: Arc<FakeClient>) -> (MeshController, Arc<InMemoryRegistry>) {
        let registry = Arc::new(InMemoryRegistry::new());
        let controller = MeshController::builder(registry.clone(), client)
            .health_probe(Arc::new(AlwaysHealthy))
            .build();
        (controller, registry)
    }

    fn orders_request() -> MeshRequest {
        MeshRequest::get("shop.example.com", "/api/orders/42")
    }

    #[tokio::test]
    async fn test_initialize_registers_every_replica() {
        let (controller, registry) = controller(FakeClient::new(StatusCode::OK));
        let mut rx = controller.events().subscribe();
        controller.initialize(mesh_config()).await.unwrap();

        assert!(controller.is_running());
        let orders = registry.discover_service("orders").await.unwrap();
        let ids: Vec<_> = orders.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["orders-0", "orders-1", "orders-2"]);
        assert_eq!(orders[0].host, "orders-0.prod");
        assert_eq!(orders[0].version(), Some("v1"));
        assert_eq!(registry.instance_count(), 4);
        assert_eq!(controller.sidecars().running(), 3);
        assert_eq!(controller.health_loops(), 2);

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let MeshEvent::GatewaySetup { middleware, .. } = &event {
                assert_eq!(middleware, &vec!["cors".to_string(), "compression".to_string()]);
            }
            names.push(event.name());
        }
        assert_eq!(names.last(), Some(&"mesh:initialized"));
        assert!(names.contains(&"gateway:setup"));

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_leaves_mesh_stopped() {
        let (controller, registry) = controller(FakeClient::new(StatusCode::OK));
        let mut config = mesh_config();
        config
            .policies
            .push(PolicyConfig::new("ghost", PolicyType::Timeout, "payments"));

        let err = controller.initialize(config).await.unwrap_err();
        assert!(matches!(err, MeshError::Configuration(_)));
        assert!(!controller.is_running());
        assert_eq!(registry.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_second_initialize_is_ignored() {
        let (controller, registry) = controller(FakeClient::new(StatusCode::OK));
        controller.initialize(mesh_config()).await.unwrap();
        controller.initialize(mesh_config()).await.unwrap();
        assert_eq!(registry.instance_count(), 4);
        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_route_request_before_initialize() {
        let (controller, _) = controller(FakeClient::new(StatusCode::OK));
        let err = controller.route_request(orders_request()).await.unwrap_err();
        assert!(matches!(err, MeshError::NotRunning));
    }

    #[tokio::test]
    async fn test_successful_requests_are_counted() {
        let client = FakeClient::new(StatusCode::OK);
        let (controller, _) = controller(client.clone());
        controller.initialize(mesh_config()).await.unwrap();

        for _ in 0..6 {
            let response = controller.route_request(orders_request()).await.unwrap();
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(response.service, "orders");
        }

        let metrics = controller.metrics().get("orders").unwrap();
        assert_eq!(metrics.requests_total, 6);
        assert_eq!(metrics.requests_success, 6);
        assert_eq!(metrics.requests_error, 0);

        // Equal weights spread requests evenly.
        let calls = client.calls();
        for id in ["orders-0", "orders-1", "orders-2"] {
            assert_eq!(calls.iter().filter(|(_, _, i)| i == id).count(), 2);
        }
        assert!(calls.iter().all(|(_, path, _)| path == "/api/orders/42"));

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_request_records_nothing() {
        let client = FakeClient::new(StatusCode::OK);
        let (controller, _) = controller(client.clone());
        controller.initialize(mesh_config()).await.unwrap();

        let err = controller
            .route_request(MeshRequest::get("shop.example.com", "/nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::RouteNotFound { .. }));

        let err = controller
            .route_request(MeshRequest::new(
                http::Method::DELETE,
                "shop.example.com",
                "/api/orders/42",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::RouteNotFound { .. }));

        assert_eq!(controller.metrics().get("orders").unwrap().requests_total, 0);
        assert!(client.calls().is_empty());

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_failure() {
        let (controller, _) = controller(FakeClient::new(StatusCode::NOT_FOUND));
        controller.initialize(mesh_config()).await.unwrap();

        let err = controller.route_request(orders_request()).await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(404));
        let metrics = controller.metrics().get("orders").unwrap();
        assert_eq!(metrics.requests_total, 1);
        assert_eq!(metrics.requests_error, 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_route_retries_on_retryable_status() {
        let client = FakeClient::new(StatusCode::SERVICE_UNAVAILABLE);
        let (controller, _) = controller(client.clone());
        let mut config = mesh_config();
        config.gateways = vec![GatewayConfig::ingress("public", 80, &["shop.example.com"])
            .with_route(RouteConfig::new("/api/orders/*", "orders").with_retries(2))];
        controller.initialize(config).await.unwrap();

        let err = controller.route_request(orders_request()).await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(503));
        assert_eq!(client.calls().len(), 3);
        assert_eq!(controller.metrics().get("orders").unwrap().requests_total, 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_after_limit() {
        let (controller, _) = controller(FakeClient::new(StatusCode::OK));
        let mut config = mesh_config();
        config.security.rate_limiting = Some(RateLimitingConfig::new(3, 60));
        controller.initialize(config).await.unwrap();

        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));
        for _ in 0..3 {
            controller
                .route_request(orders_request().with_client_ip(ip))
                .await
                .unwrap();
        }
        let err = controller
            .route_request(orders_request().with_client_ip(ip))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::RateLimitExceeded { .. }));

        let metrics = controller.metrics().get("orders").unwrap();
        assert_eq!(metrics.requests_total, 4);
        assert_eq!(metrics.requests_error, 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_deny_policy_added_at_runtime() {
        let client = FakeClient::new(StatusCode::OK);
        let (controller, _) = controller(client.clone());
        controller.initialize(mesh_config()).await.unwrap();

        let deny = PolicyConfig::new("block-internal", PolicyType::Security, "orders").with_rule(
            PolicyRule::new(PolicyAction::Deny).when(PolicyCondition::PathPrefix {
                prefix: "/api/orders/internal".to_string(),
            }),
        );
        controller.add_policy(deny).unwrap();

        let err = controller
            .route_request(MeshRequest::get("shop.example.com", "/api/orders/internal/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Authorization { .. }));

        // Requests the deny rule does not cover still need a credential.
        let err = controller.route_request(orders_request()).await.unwrap_err();
        assert!(matches!(err, MeshError::Authorization { .. }));
        controller
            .route_request(orders_request().with_header("authorization", "Bearer token"))
            .await
            .unwrap();

        assert!(controller.remove_policy("block-internal"));
        assert!(!controller.remove_policy("block-internal"));
        controller
            .route_request(MeshRequest::get("shop.example.com", "/api/orders/internal/x"))
            .await
            .unwrap();

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_policy_with_unknown_target() {
        let (controller, _) = controller(FakeClient::new(StatusCode::OK));
        controller.initialize(mesh_config()).await.unwrap();

        let policy = PolicyConfig::new("ghost", PolicyType::Timeout, "payments");
        assert!(matches!(
            controller.add_policy(policy),
            Err(MeshError::Configuration(_))
        ));

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let (controller, registry) = controller(FakeClient::new(StatusCode::OK));
        controller.initialize(mesh_config()).await.unwrap();

        assert!(controller.scale_service("orders", 5).await.unwrap());
        let ids: Vec<_> = registry
            .discover_service("orders")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["orders-0", "orders-1", "orders-2", "orders-3", "orders-4"]);
        assert_eq!(controller.sidecars().running(), 5);

        assert!(controller.scale_service("orders", 1).await.unwrap());
        let ids: Vec<_> = registry
            .discover_service("orders")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["orders-0"]);
        assert_eq!(controller.replicas("orders"), Some(1));
        assert_eq!(controller.sidecars().running(), 1);

        assert!(!controller.scale_service("payments", 2).await.unwrap());

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (controller, registry) = controller(FakeClient::new(StatusCode::OK));
        controller.initialize(mesh_config()).await.unwrap();
        let mut rx = controller.events().subscribe();

        controller.shutdown().await.unwrap();
        controller.shutdown().await.unwrap();

        assert!(!controller.is_running());
        assert_eq!(registry.instance_count(), 0);
        assert_eq!(controller.health_loops(), 0);
        assert_eq!(controller.sidecars().running(), 0);

        let mut shutdowns = 0;
        while let Ok(event) = rx.try_recv() {
            if event.name() == "mesh:shutdown" {
                shutdowns += 1;
            }
        }
        assert_eq!(shutdowns, 1);

        let err = controller.route_request(orders_request()).await.unwrap_err();
        assert!(matches!(err, MeshError::NotRunning));
    }

    #[tokio::test]
    async fn test_second_shutdown_deregisters_nothing() {
        let registry = Arc::new(RecordingRegistry::default());
        let controller = MeshController::builder(registry.clone(), FakeClient::new(StatusCode::OK))
            .health_probe(Arc::new(AlwaysHealthy))
            .build();
        controller.initialize(mesh_config()).await.unwrap();

        controller.shutdown().await.unwrap();
        let first = registry.deregistrations();
        assert!(first >= 1);
        assert_eq!(registry.inner.instance_count(), 0);

        controller.shutdown().await.unwrap();
        assert_eq!(registry.deregistrations(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loops_stop_before_deregistration() {
        let registry = Arc::new(RecordingRegistry::default());
        let controller = MeshController::builder(registry.clone(), FakeClient::new(StatusCode::OK))
            .health_probe(Arc::new(AlwaysHealthy))
            .build();
        controller.initialize(mesh_config()).await.unwrap();

        // Two sweeps at the default 10s interval.
        tokio::time::sleep(Duration::from_secs(25)).await;
        controller.shutdown().await.unwrap();

        let log = registry.log();
        let first_deregister = log
            .iter()
            .position(|entry| entry.starts_with("deregister"))
            .unwrap();
        assert!(log[..first_deregister].iter().any(|e| e.starts_with("health")));
        assert!(log[first_deregister..]
            .iter()
            .all(|e| e.starts_with("deregister")));

        // Nothing probes the removed instances afterwards.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(registry.log().len(), log.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_window_rolls_over() {
        let (controller, _) = controller(FakeClient::new(StatusCode::OK));
        let mut config = mesh_config();
        config.security.rate_limiting = Some(RateLimitingConfig::new(2, 1));
        controller.initialize(config).await.unwrap();

        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9));
        let request = || orders_request().with_client_ip(ip);
        controller.route_request(request()).await.unwrap();
        controller.route_request(request()).await.unwrap();
        let err = controller.route_request(request()).await.unwrap_err();
        match err {
            MeshError::RateLimitExceeded { retry_after, .. } => {
                assert!(retry_after <= Duration::from_secs(1))
            }
            other => panic!("unexpected error: {other}"),
        }

        tokio::time::advance(Duration::from_secs(1)).await;
        controller.route_request(request()).await.unwrap();
        controller.route_request(request()).await.unwrap();
        assert!(controller.route_request(request()).await.is_err());

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_response_cache_serves_repeat_gets() {
        let client = FakeClient::new(StatusCode::OK);
        let registry = Arc::new(InMemoryRegistry::new());
        let cache = Arc::new(InMemoryResponseCache::new(Duration::from_secs(60)));
        let controller = MeshController::builder(registry, client.clone())
            .health_probe(Arc::new(AlwaysHealthy))
            .response_cache(cache.clone(), Duration::from_secs(60))
            .build();
        controller.initialize(mesh_config()).await.unwrap();

        let first = controller.route_request(orders_request()).await.unwrap();
        assert!(!first.cached);
        let second = controller.route_request(orders_request()).await.unwrap();
        assert!(second.cached);
        assert_eq!(&second.body[..], b"ok");
        assert_eq!(client.calls().len(), 1);

        // Other methods and authenticated callers skip the cache.
        let post = MeshRequest::new(Method::POST, "shop.example.com", "/api/orders/42");
        assert!(!controller.route_request(post).await.unwrap().cached);
        assert_eq!(client.calls().len(), 2);

        let metrics = controller.metrics().get("orders").unwrap();
        assert_eq!(metrics.cache_hit_rate, 0.5);
        assert_eq!(metrics.requests_total, 3);
        assert_eq!(metrics.requests_success, 3);
        assert_eq!(cache.stats().hits, 1);

        controller.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_error_frees_half_open_trial() {
        let client = FakeClient::new(StatusCode::SERVICE_UNAVAILABLE);
        let (controller, _) = controller(client.clone());
        let mut config = mesh_config();
        config.policies.push(
            PolicyConfig::new("cb", PolicyType::CircuitBreaker, "orders").with_rule(
                PolicyRule::new(PolicyAction::CircuitBreaker {
                    failure_threshold: 1,
                    success_threshold: 1,
                    open_ms: 0,
                }),
            ),
        );
        controller.initialize(config).await.unwrap();

        let err = controller.route_request(orders_request()).await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(503));
        assert_eq!(controller.metrics().get("orders").unwrap().circuit_breaker_trips, 1);

        // A 404 trial says nothing about health; the next request still gets
        // a trial instead of CircuitOpen.
        *client.status.lock() = StatusCode::NOT_FOUND;
        for _ in 0..2 {
            let err = controller.route_request(orders_request()).await.unwrap_err();
            assert_eq!(err.upstream_status(), Some(404));
        }

        *client.status.lock() = StatusCode::OK;
        controller.route_request(orders_request()).await.unwrap();
        assert_eq!(client.calls().len(), 4);

        controller.shutdown().await.unwrap();
    }
}

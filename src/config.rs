//! Mesh configuration model and validation.
//!
//! A [`MeshConfig`] arrives fully typed; file loaders for TOML and JSON are
//! provided for the binary. [`MeshConfig::validate`] enforces every
//! referential invariant so that initialization either succeeds completely or
//! fails before touching any shared state.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Policy target that applies to every service.
pub const WILDCARD_TARGET: &str = "*";

/// Trailing marker that turns a route path into a prefix match.
pub const ROUTE_WILDCARD: char = '*';

/// `[A-Za-z_][A-Za-z0-9_]*`
fn is_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Configuration validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("duplicate service name: {name}")]
    DuplicateService { name: String },

    #[error("duplicate policy name: {name}")]
    DuplicatePolicy { name: String },

    #[error("duplicate gateway name: {name}")]
    DuplicateGateway { name: String },

    /// Policy target is neither a configured service nor `*`.
    #[error("policy '{policy}' targets unknown service '{target}'")]
    UnknownPolicyTarget { policy: String, target: String },

    /// Route points at a service that is not configured.
    #[error("route '{path}' on gateway '{gateway}' references unknown service '{service}'")]
    UnknownRouteService {
        gateway: String,
        path: String,
        service: String,
    },

    /// Rule action does not belong to the policy's type.
    #[error("policy '{policy}' of type {expected} contains a {found} rule")]
    RuleTypeMismatch {
        policy: String,
        expected: PolicyType,
        found: PolicyType,
    },

    #[error("invalid condition in policy '{policy}': {reason}")]
    InvalidCondition { policy: String, reason: String },

    #[error("invalid health check for service '{service}': {reason}")]
    InvalidHealthCheck { service: String, reason: String },

    #[error("invalid route '{path}' on gateway '{gateway}': {reason}")]
    InvalidRoute {
        gateway: String,
        path: String,
        reason: String,
    },

    #[error("ingress gateway '{gateway}' declares no hosts")]
    MissingIngressHosts { gateway: String },

    #[error("invalid environment key '{key}' for service '{service}'")]
    InvalidEnvironmentKey { service: String, key: String },

    #[error("invalid resources for service '{service}': {reason}")]
    InvalidResources { service: String, reason: String },

    #[error("invalid address '{addr}' for service '{service}': {reason}")]
    InvalidAddress {
        service: String,
        addr: String,
        reason: String,
    },

    #[error("invalid rate limiting: {reason}")]
    InvalidRateLimit { reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Deployment environment of the mesh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

/// Top-level mesh configuration. Loaded once; `namespace/name` is the mesh
/// identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub name: String,
    pub namespace: String,
    pub version: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl MeshConfig {
    /// Loads configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Loads configuration from a JSON string.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Returns the `namespace/name` identity of the mesh.
    pub fn identity(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Looks up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found:
    /// - duplicate service, policy or gateway names
    /// - a policy target or route service that is not a configured service
    /// - a rule whose action does not match its policy type
    /// - malformed health checks, routes, addresses, resources or env keys
    /// - a rate limit with a zero limit or window
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut service_names = HashSet::new();
        for service in &self.services {
            if !service_names.insert(service.name.as_str()) {
                return Err(ConfigError::DuplicateService {
                    name: service.name.clone(),
                });
            }
            service.validate()?;
        }

        let mut policy_names = HashSet::new();
        for policy in &self.policies {
            if !policy_names.insert(policy.name.as_str()) {
                return Err(ConfigError::DuplicatePolicy {
                    name: policy.name.clone(),
                });
            }
            policy.validate_against(|name| service_names.contains(name))?;
        }

        let mut gateway_names = HashSet::new();
        for gateway in &self.gateways {
            if !gateway_names.insert(gateway.name.as_str()) {
                return Err(ConfigError::DuplicateGateway {
                    name: gateway.name.clone(),
                });
            }
            gateway.validate_against(|name| service_names.contains(name))?;
        }

        if let Some(rate_limiting) = &self.security.rate_limiting {
            rate_limiting.validate()?;
        }

        Ok(())
    }
}

/// Transport protocol spoken on a service port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Http2,
    Grpc,
    Tcp,
}

/// A named service port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Health-check descriptor for a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Path probed on every instance.
    pub path: String,
    /// Interval between sweeps.
    pub interval_ms: u64,
    /// Per-probe timeout.
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/health".to_string(),
            interval_ms: 10_000,
            timeout_ms: 5_000,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// CPU and memory amounts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default)]
    pub cpu_millis: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
}

/// Resource requests and limits for each replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: ResourceHints,
    #[serde(default)]
    pub limits: ResourceHints,
}

/// Auxiliary process colocated with every replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarConfig {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
}

/// A service managed by the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique within the mesh.
    pub name: String,
    pub version: String,
    /// Mutated only through `scale_service`.
    pub replicas: u32,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub sidecars: Vec<SidecarConfig>,
    /// Optional static `host:port` per replica index.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl ServiceConfig {
    /// Creates a service with one HTTP port and default health checking.
    pub fn new(name: impl Into<String>, replicas: u32, port: u16) -> Self {
        Self {
            name: name.into(),
            version: "v1".to_string(),
            replicas,
            ports: vec![PortConfig {
                name: "http".to_string(),
                port,
                protocol: Protocol::Http,
            }],
            health_check: HealthCheckConfig::default(),
            resources: ResourceRequirements::default(),
            environment: BTreeMap::new(),
            sidecars: Vec::new(),
            addresses: Vec::new(),
        }
    }

    pub fn with_health_check(mut self, health_check: HealthCheckConfig) -> Self {
        self.health_check = health_check;
        self
    }

    pub fn with_addresses(mut self, addresses: Vec<String>) -> Self {
        self.addresses = addresses;
        self
    }

    pub fn with_sidecar(mut self, name: impl Into<String>) -> Self {
        self.sidecars.push(SidecarConfig {
            name: name.into(),
            image: None,
        });
        self
    }

    /// Returns the first declared port, or 80.
    pub fn primary_port(&self) -> u16 {
        self.ports.first().map(|p| p.port).unwrap_or(80)
    }

    /// Returns the protocol of the primary port.
    pub fn primary_protocol(&self) -> Protocol {
        self.ports.first().map(|p| p.protocol).unwrap_or_default()
    }

    /// Resolves the `(host, port)` for the given replica index.
    pub fn instance_address(&self, index: usize, namespace: &str) -> (String, u16) {
        if let Some((host, port)) = self.addresses.get(index).and_then(|a| split_address(a)) {
            return (host, port);
        }
        (
            format!("{}-{}.{}", self.name, index, namespace),
            self.primary_port(),
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check.interval_ms == 0 {
            return Err(ConfigError::InvalidHealthCheck {
                service: self.name.clone(),
                reason: "interval must be greater than zero".to_string(),
            });
        }
        if self.health_check.timeout_ms == 0 {
            return Err(ConfigError::InvalidHealthCheck {
                service: self.name.clone(),
                reason: "timeout must be greater than zero".to_string(),
            });
        }
        if !self.health_check.path.starts_with('/') {
            return Err(ConfigError::InvalidHealthCheck {
                service: self.name.clone(),
                reason: format!("path '{}' must start with '/'", self.health_check.path),
            });
        }

        for key in self.environment.keys() {
            if !is_env_key(key) {
                return Err(ConfigError::InvalidEnvironmentKey {
                    service: self.name.clone(),
                    key: key.clone(),
                });
            }
        }

        let ResourceRequirements { requests, limits } = self.resources;
        if let (Some(req), Some(lim)) = (requests.cpu_millis, limits.cpu_millis) {
            if req > lim {
                return Err(ConfigError::InvalidResources {
                    service: self.name.clone(),
                    reason: format!("cpu request {}m exceeds limit {}m", req, lim),
                });
            }
        }
        if let (Some(req), Some(lim)) = (requests.memory_mb, limits.memory_mb) {
            if req > lim {
                return Err(ConfigError::InvalidResources {
                    service: self.name.clone(),
                    reason: format!("memory request {}Mi exceeds limit {}Mi", req, lim),
                });
            }
        }

        for addr in &self.addresses {
            if split_address(addr).is_none() {
                return Err(ConfigError::InvalidAddress {
                    service: self.name.clone(),
                    addr: addr.clone(),
                    reason: "expected host:port".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Splits `host:port`, validating it as the authority of an HTTP URL.
fn split_address(addr: &str) -> Option<(String, u16)> {
    let url = url::Url::parse(&format!("http://{}", addr)).ok()?;
    let host = url.host_str()?.to_string();
    // `port()` is None for the scheme default; require it spelled out.
    let port = url.port().or_else(|| addr.ends_with(":80").then_some(80))?;
    Some((host, port))
}

/// Kind of policy, selecting how its rules are enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    Traffic,
    Security,
    Retry,
    CircuitBreaker,
    Timeout,
}

impl std::fmt::Display for PolicyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PolicyType::Traffic => "traffic",
            PolicyType::Security => "security",
            PolicyType::Retry => "retry",
            PolicyType::CircuitBreaker => "circuit_breaker",
            PolicyType::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// Condition for matching a header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum HeaderMatch {
    /// Header must have exactly this value.
    Exact { name: String, value: String },
    /// Header must contain this substring.
    Contains { name: String, value: String },
    /// Header must match this regex pattern.
    Regex { name: String, pattern: String },
    /// Header must be present (any value).
    Present { name: String },
    /// Header must be absent.
    Absent { name: String },
}

/// When a rule applies to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyCondition {
    #[default]
    Always,
    Header(HeaderMatch),
    PathPrefix {
        prefix: String,
    },
    Method {
        methods: Vec<String>,
    },
    SourceIp {
        ips: Vec<std::net::IpAddr>,
    },
}

fn default_backoff_ms() -> u64 {
    100
}

/// What a rule does when its condition matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PolicyAction {
    /// Selection weight for instances of `version`.
    Weight { version: String, weight: u32 },
    Allow,
    Deny,
    RequireAuthentication,
    Retry {
        attempts: u32,
        #[serde(default = "default_backoff_ms")]
        backoff_ms: u64,
        #[serde(default)]
        retry_on: Vec<u16>,
    },
    CircuitBreaker {
        failure_threshold: u64,
        success_threshold: u64,
        open_ms: u64,
    },
    Timeout {
        ms: u64,
    },
}

impl PolicyAction {
    /// Returns the policy type this action belongs to.
    pub fn policy_type(&self) -> PolicyType {
        match self {
            PolicyAction::Weight { .. } => PolicyType::Traffic,
            PolicyAction::Allow | PolicyAction::Deny | PolicyAction::RequireAuthentication => {
                PolicyType::Security
            }
            PolicyAction::Retry { .. } => PolicyType::Retry,
            PolicyAction::CircuitBreaker { .. } => PolicyType::CircuitBreaker,
            PolicyAction::Timeout { .. } => PolicyType::Timeout,
        }
    }
}

/// A single policy rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub condition: PolicyCondition,
    pub action: PolicyAction,
    /// Higher is evaluated first; rules without a priority go last.
    #[serde(default)]
    pub priority: Option<i32>,
}

impl PolicyRule {
    pub fn new(action: PolicyAction) -> Self {
        Self {
            condition: PolicyCondition::Always,
            action,
            priority: None,
        }
    }

    pub fn when(mut self, condition: PolicyCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A named policy applied to one service or to all of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    /// Service name or `*`.
    pub target: String,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl PolicyConfig {
    pub fn new(name: impl Into<String>, policy_type: PolicyType, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy_type,
            target: target.into(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Returns true if the policy targets `service` directly or via `*`.
    pub fn applies_to(&self, service: &str) -> bool {
        self.target == WILDCARD_TARGET || self.target == service
    }

    /// Validates rule types and the target using `known` to resolve service
    /// names.
    pub fn validate_against(&self, known: impl Fn(&str) -> bool) -> Result<(), ConfigError> {
        if self.target != WILDCARD_TARGET && !known(&self.target) {
            return Err(ConfigError::UnknownPolicyTarget {
                policy: self.name.clone(),
                target: self.target.clone(),
            });
        }

        for rule in &self.rules {
            let found = rule.action.policy_type();
            if found != self.policy_type {
                return Err(ConfigError::RuleTypeMismatch {
                    policy: self.name.clone(),
                    expected: self.policy_type,
                    found,
                });
            }

            match &rule.condition {
                PolicyCondition::Header(HeaderMatch::Regex { pattern, .. }) => {
                    Regex::new(pattern).map_err(|e| ConfigError::InvalidCondition {
                        policy: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                }
                PolicyCondition::Method { methods } => {
                    for method in methods {
                        http::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                            .map_err(|_| ConfigError::InvalidCondition {
                                policy: self.name.clone(),
                                reason: format!("invalid method '{}'", method),
                            })?;
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }
}

/// Direction of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayType {
    Ingress,
    Egress,
}

fn default_methods() -> Vec<String> {
    vec!["GET".to_string()]
}

fn default_route_timeout_ms() -> u64 {
    30_000
}

/// A gateway route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Exact path, or a prefix ending in `*`.
    pub path: String,
    pub service: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub rewrite: Option<String>,
    #[serde(default = "default_route_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retries: u32,
}

impl RouteConfig {
    pub fn new(path: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            service: service.into(),
            methods: default_methods(),
            rewrite: None,
            timeout_ms: default_route_timeout_ms(),
            retries: 0,
        }
    }

    pub fn with_methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_rewrite(mut self, rewrite: impl Into<String>) -> Self {
        self.rewrite = Some(rewrite.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// An ingress or egress gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub gateway_type: GatewayType,
    pub port: u16,
    /// Ingress only.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Matched in declaration order.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub middleware: Vec<String>,
}

impl GatewayConfig {
    pub fn ingress(name: impl Into<String>, port: u16, hosts: &[&str]) -> Self {
        Self {
            name: name.into(),
            gateway_type: GatewayType::Ingress,
            port,
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            routes: Vec::new(),
            middleware: Vec::new(),
        }
    }

    pub fn egress(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            gateway_type: GatewayType::Egress,
            port,
            hosts: Vec::new(),
            routes: Vec::new(),
            middleware: Vec::new(),
        }
    }

    pub fn with_route(mut self, route: RouteConfig) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_middleware(mut self, name: impl Into<String>) -> Self {
        self.middleware.push(name.into());
        self
    }

    fn validate_against(&self, known: impl Fn(&str) -> bool) -> Result<(), ConfigError> {
        if self.gateway_type == GatewayType::Ingress && self.hosts.is_empty() {
            return Err(ConfigError::MissingIngressHosts {
                gateway: self.name.clone(),
            });
        }

        for route in &self.routes {
            let invalid = |reason: String| ConfigError::InvalidRoute {
                gateway: self.name.clone(),
                path: route.path.clone(),
                reason,
            };

            if !route.path.starts_with('/') {
                return Err(invalid("path must start with '/'".to_string()));
            }
            if let Some(pos) = route.path.find(ROUTE_WILDCARD) {
                if pos != route.path.len() - 1 {
                    return Err(invalid("wildcard is only allowed at the end".to_string()));
                }
            }
            if route.methods.is_empty() {
                return Err(invalid("at least one method is required".to_string()));
            }
            for method in &route.methods {
                http::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| invalid(format!("invalid method '{}'", method)))?;
            }
            if route.timeout_ms == 0 {
                return Err(invalid("timeout must be greater than zero".to_string()));
            }
            if !known(&route.service) {
                return Err(ConfigError::UnknownRouteService {
                    gateway: self.name.clone(),
                    path: route.path.clone(),
                    service: route.service.clone(),
                });
            }
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Metrics export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsExportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

/// Tracing export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: default_sample_rate(),
        }
    }
}

/// Monitoring wiring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub metrics: MetricsExportConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// How callers present credentials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    #[default]
    None,
    Bearer,
    ApiKey,
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

/// Credential checking for `require_authentication` rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    #[serde(default)]
    pub scheme: AuthScheme,
    /// Header carrying the key for `api_key`.
    #[serde(default = "default_api_key_header")]
    pub header: String,
    /// Accepted credentials; empty accepts any non-empty credential.
    #[serde(default)]
    pub credentials: Vec<String>,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            scheme: AuthScheme::None,
            header: default_api_key_header(),
            credentials: Vec::new(),
        }
    }
}

/// Identifier a rate-limit counter is keyed by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitKey {
    #[default]
    Ip,
    User,
    Service,
}

/// Fixed-window rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests allowed per window.
    pub limit: u64,
    pub window_secs: u64,
    /// Extra requests tolerated on top of `limit`.
    #[serde(default)]
    pub burst: Option<u64>,
    #[serde(default)]
    pub key: RateLimitKey,
    /// Whether to trust X-Forwarded-For / X-Real-IP.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl RateLimitingConfig {
    pub fn new(limit: u64, window_secs: u64) -> Self {
        Self {
            enabled: true,
            limit,
            window_secs,
            burst: None,
            key: RateLimitKey::Ip,
            trust_forwarded_for: false,
        }
    }

    pub fn with_key(mut self, key: RateLimitKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    /// Enables trusting forwarded headers.
    ///
    /// **Security Warning**: Only enable this behind a trusted load balancer
    /// that sets these headers; clients can spoof them otherwise.
    pub fn with_trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Maximum requests per identifier within one window.
    pub fn capacity(&self) -> u64 {
        self.limit + self.burst.unwrap_or(0)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::InvalidRateLimit {
                reason: "limit must be greater than zero".to_string(),
            });
        }
        if self.window_secs == 0 {
            return Err(ConfigError::InvalidRateLimit {
                reason: "window must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Security settings shared by all services.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub authentication: AuthenticationConfig,
    #[serde(default)]
    pub rate_limiting: Option<RateLimitingConfig>,
}

/// Process-level settings for the `meshctl` binary.
///
/// # Environment Variables
///
/// * `MESH_CONFIG_PATH` - Mesh configuration file, TOML or JSON (default: "mesh.toml")
/// * `MESH_ADMIN_ADDR` - Admin endpoint address (default: "127.0.0.1:9090")
/// * `MESH_EVENT_CAPACITY` - Notification channel capacity (default: 1024)
/// * `MESH_CACHE_TTL_MS` - Default response cache TTL; 0 disables the cache (default: 0)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub config_path: String,
    pub admin_addr: String,
    pub event_capacity: usize,
    pub cache_ttl_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            config_path: "mesh.toml".to_string(),
            admin_addr: "127.0.0.1:9090".to_string(),
            event_capacity: 1024,
            cache_ttl_ms: 0,
        }
    }
}

impl RuntimeConfig {
    /// Loads settings from environment variables with fallback to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config_path = env::var("MESH_CONFIG_PATH").unwrap_or(defaults.config_path);
        let admin_addr = env::var("MESH_ADMIN_ADDR").unwrap_or(defaults.admin_addr);
        let event_capacity = env::var("MESH_EVENT_CAPACITY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|c| *c > 0)
            .unwrap_or(defaults.event_capacity);
        let cache_ttl_ms = env::var("MESH_CACHE_TTL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.cache_ttl_ms);

        Self {
            config_path,
            admin_addr,
            event_capacity,
            cache_ttl_ms,
        }
    }

    /// Default response cache TTL, `None` when caching is off.
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_ms > 0).then(|| Duration::from_millis(self.cache_ttl_ms))
    }

    /// Parses the mesh configuration according to the file extension.
    pub fn parse_mesh_config(&self, content: &str) -> Result<MeshConfig, ConfigError> {
        if self.config_path.ends_with(".json") {
            MeshConfig::from_json(content)
        } else {
            MeshConfig::from_toml(content)
        }
    }
}

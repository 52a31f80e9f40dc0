//! Policy enforcement.
//!
//! Policies are kept in declaration order. Applying a policy installs its
//! effect and replaces any earlier policy with the same name. At request time
//! every rule of every policy targeting the service (directly or via `*`) is
//! flattened and evaluated by descending rule priority; rules without a
//! priority come last and ties keep declaration order.
//!
//! Security rules fail closed:
//! - a matching `deny` rejects the request
//! - a matching `require_authentication` needs a valid credential
//! - if the service has `allow` rules, at least one must match
//! - a security policy none of whose access rules matched (or that has no
//!   rules) still needs a valid credential
//!
//! Rate limiting runs after the security rules, so rejected requests never
//! consume quota.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::config::{
    AuthScheme, AuthenticationConfig, HeaderMatch, PolicyAction, PolicyCondition, PolicyConfig,
    PolicyRule, PolicyType, SecurityConfig,
};
use crate::error::{MeshError, Result};
use crate::events::{EventBus, MeshEvent};
use crate::ratelimit::RateLimiter;
use crate::registry::ServiceInstance;
use crate::request::MeshRequest;
use crate::retry::RetryConfig;
use dashmap::DashMap;
use http::HeaderMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Global regex cache to avoid recompiling patterns on every request.
static REGEX_CACHE: Lazy<RwLock<HashMap<String, Arc<Regex>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Gets or compiles a regex pattern, caching the result.
fn get_or_compile_regex(pattern: &str) -> Option<Arc<Regex>> {
    {
        let cache = REGEX_CACHE.read();
        if let Some(regex) = cache.get(pattern) {
            return Some(Arc::clone(regex));
        }
    }

    match Regex::new(pattern) {
        Ok(regex) => {
            let regex = Arc::new(regex);
            REGEX_CACHE
                .write()
                .insert(pattern.to_string(), Arc::clone(&regex));
            Some(regex)
        }
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid regex pattern");
            None
        }
    }
}

impl HeaderMatch {
    /// Checks if the header matches.
    pub fn matches(&self, headers: &HeaderMap) -> bool {
        match self {
            HeaderMatch::Exact { name, value } => {
                headers.get(name.as_str()).is_some_and(|v| v == value.as_str())
            }
            HeaderMatch::Contains { name, value } => headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains(value.as_str())),
            HeaderMatch::Regex { name, pattern } => match get_or_compile_regex(pattern) {
                Some(regex) => headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| regex.is_match(v)),
                None => false,
            },
            HeaderMatch::Present { name } => headers.contains_key(name.as_str()),
            HeaderMatch::Absent { name } => !headers.contains_key(name.as_str()),
        }
    }
}

impl PolicyCondition {
    /// Checks the condition against a request.
    pub fn matches(&self, request: &MeshRequest, client_ip: Option<IpAddr>) -> bool {
        match self {
            PolicyCondition::Always => true,
            PolicyCondition::Header(header) => header.matches(&request.headers),
            PolicyCondition::PathPrefix { prefix } => request.path_only().starts_with(prefix),
            PolicyCondition::Method { methods } => methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(request.method.as_str())),
            PolicyCondition::SourceIp { ips } => client_ip.is_some_and(|ip| ips.contains(&ip)),
        }
    }
}

/// Per-request outcome of policy evaluation.
#[derive(Debug, Clone, Default)]
pub struct RequestDirectives {
    /// Overrides the route timeout.
    pub timeout: Option<Duration>,
    /// Overrides the route retry budget.
    pub retry: Option<RetryConfig>,
    /// Selection weight per instance version.
    pub weights: Vec<(String, u32)>,
    /// Breaker guarding the target service.
    pub breaker: Option<Arc<CircuitBreaker>>,
    /// Fingerprint of the authenticated credential.
    pub principal: Option<String>,
}

impl RequestDirectives {
    /// Selection weight for `instance`: the weight of its version if a
    /// traffic rule set one, else the instance's own weight.
    pub fn weight_for(&self, instance: &ServiceInstance) -> u32 {
        instance
            .version()
            .and_then(|version| {
                self.weights
                    .iter()
                    .find(|(v, _)| v == version)
                    .map(|(_, weight)| *weight)
            })
            .unwrap_or(instance.weight)
    }
}

/// Holds applied policies and the state they install.
pub struct PolicyEngine {
    policies: RwLock<Vec<PolicyConfig>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    authentication: RwLock<AuthenticationConfig>,
    rate_limiter: RwLock<Option<Arc<RateLimiter>>>,
    events: EventBus,
}

impl PolicyEngine {
    pub fn new(events: EventBus) -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            breakers: DashMap::new(),
            authentication: RwLock::new(AuthenticationConfig::default()),
            rate_limiter: RwLock::new(None),
            events,
        }
    }

    /// Installs mesh-wide authentication and rate limiting settings.
    pub fn configure_security(&self, security: &SecurityConfig) {
        *self.authentication.write() = security.authentication.clone();
        *self.rate_limiter.write() = security
            .rate_limiting
            .as_ref()
            .filter(|config| config.enabled)
            .map(|config| Arc::new(RateLimiter::new(config.clone())));
        info!(
            scheme = ?security.authentication.scheme,
            rate_limiting = security.rate_limiting.as_ref().is_some_and(|c| c.enabled),
            "security configured"
        );
    }

    /// Applies a policy, replacing any policy with the same name.
    pub fn apply_policy(&self, policy: PolicyConfig) {
        match policy.policy_type {
            PolicyType::Traffic => {
                let weights: Vec<String> = policy
                    .rules
                    .iter()
                    .filter_map(|rule| match &rule.action {
                        PolicyAction::Weight { version, weight } => {
                            Some(format!("{}={}", version, weight))
                        }
                        _ => None,
                    })
                    .collect();
                info!(policy = %policy.name, target = %policy.target, weights = ?weights, "traffic weighting applied");
            }
            PolicyType::Security => {
                info!(policy = %policy.name, target = %policy.target, rules = policy.rules.len(), "security rules applied");
            }
            PolicyType::Retry | PolicyType::Timeout => {
                info!(policy = %policy.name, target = %policy.target, policy_type = %policy.policy_type, "request directive applied");
            }
            PolicyType::CircuitBreaker => {
                info!(policy = %policy.name, target = %policy.target, "circuit breaker thresholds applied");
            }
        }

        let event = MeshEvent::PolicyApplied {
            name: policy.name.clone(),
            policy_type: policy.policy_type,
            target: policy.target.clone(),
        };

        {
            let mut policies = self.policies.write();
            if policy.policy_type == PolicyType::CircuitBreaker {
                self.reset_breakers(&policy.target);
            }
            match policies.iter_mut().find(|p| p.name == policy.name) {
                Some(existing) => {
                    if existing.policy_type == PolicyType::CircuitBreaker {
                        self.reset_breakers(&existing.target);
                    }
                    *existing = policy;
                }
                None => policies.push(policy),
            }
        }

        self.events.publish(event);
    }

    /// Removes a policy and its effect. Returns the removed policy.
    pub fn remove_policy(&self, name: &str) -> Option<PolicyConfig> {
        let mut policies = self.policies.write();
        let index = policies.iter().position(|p| p.name == name)?;
        let removed = policies.remove(index);
        if removed.policy_type == PolicyType::CircuitBreaker {
            self.reset_breakers(&removed.target);
        }
        debug!(policy = %name, "policy removed");
        Some(removed)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.policies.read().iter().any(|p| p.name == name)
    }

    /// Returns the applied policies in declaration order.
    pub fn policies(&self) -> Vec<PolicyConfig> {
        self.policies.read().clone()
    }

    /// Drops every policy and breaker.
    pub fn clear(&self) {
        self.policies.write().clear();
        self.breakers.clear();
    }

    /// Drops breakers so the next request rebuilds them from current
    /// thresholds.
    fn reset_breakers(&self, target: &str) {
        if target == crate::config::WILDCARD_TARGET {
            self.breakers.clear();
        } else {
            self.breakers.remove(target);
        }
    }

    /// Returns the breaker for `service`, creating it from the first
    /// applicable circuit breaker policy. `None` if no such policy exists.
    pub fn breaker_for(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        if let Some(breaker) = self.breakers.get(service) {
            return Some(breaker.value().clone());
        }

        let config = {
            let policies = self.policies.read();
            policies
                .iter()
                .filter(|p| p.policy_type == PolicyType::CircuitBreaker && p.applies_to(service))
                .flat_map(|p| p.rules.iter())
                .find_map(|rule| match rule.action {
                    PolicyAction::CircuitBreaker {
                        failure_threshold,
                        success_threshold,
                        open_ms,
                    } => Some(CircuitBreakerConfig {
                        failure_threshold: failure_threshold.max(1),
                        success_threshold: success_threshold.max(1),
                        open_duration: Duration::from_millis(open_ms),
                    }),
                    _ => None,
                })?
        };

        let breaker = self
            .breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, config)))
            .clone();
        Some(breaker)
    }

    /// Rules targeting `service`, in evaluation order.
    fn ordered_rules(&self, service: &str) -> Vec<(String, PolicyRule)> {
        let policies = self.policies.read();
        let mut rules: Vec<(String, PolicyRule)> = policies
            .iter()
            .filter(|p| p.applies_to(service))
            .flat_map(|p| p.rules.iter().map(move |r| (p.name.clone(), r.clone())))
            .collect();
        // Stable sort keeps declaration order among equal priorities.
        rules.sort_by(|(_, a), (_, b)| compare_priority(a.priority, b.priority));
        rules
    }

    /// Names of the security policies targeting `service`.
    fn security_policies(&self, service: &str) -> Vec<String> {
        self.policies
            .read()
            .iter()
            .filter(|p| p.policy_type == PolicyType::Security && p.applies_to(service))
            .map(|p| p.name.clone())
            .collect()
    }

    /// Evaluates every policy targeting `service` against `request`.
    ///
    /// # Errors
    ///
    /// Returns `Authorization` when a security rule rejects the request and
    /// `RateLimitExceeded` when the caller's window is exhausted.
    pub fn apply_request_policies(
        &self,
        service: &str,
        request: &MeshRequest,
    ) -> Result<RequestDirectives> {
        let rate_limiter = self.rate_limiter.read().clone();
        let client_ip = match &rate_limiter {
            Some(limiter) => limiter.extract_client_ip(&request.headers, request.client_ip),
            None => request.client_ip,
        };

        let path = request.path_only();
        let rejected = |policy: &str, reason: String| {
            warn!(service = %service, path = %path, policy = %policy, reason = %reason, "request rejected by policy");
            MeshError::Authorization {
                service: service.to_string(),
                path: path.to_string(),
                reason,
            }
        };

        let mut directives = RequestDirectives::default();
        let mut has_allow = false;
        let mut allowed = false;
        let mut undecided = self.security_policies(service);

        for (policy, rule) in self.ordered_rules(service) {
            let matched = rule.condition.matches(request, client_ip);
            if matched
                && matches!(
                    rule.action,
                    PolicyAction::Allow | PolicyAction::Deny | PolicyAction::RequireAuthentication
                )
            {
                undecided.retain(|name| *name != policy);
            }
            match &rule.action {
                PolicyAction::Allow => {
                    has_allow = true;
                    allowed |= matched;
                }
                _ if !matched => {}
                PolicyAction::Deny => {
                    let reason = format!("denied by policy {}", policy);
                    return Err(rejected(policy.as_str(), reason));
                }
                PolicyAction::RequireAuthentication => {
                    if directives.principal.is_none() {
                        let principal = self
                            .authenticate(&request.headers)
                            .map_err(|reason| rejected(policy.as_str(), reason))?;
                        directives.principal = Some(principal);
                    }
                }
                PolicyAction::Weight { version, weight } => {
                    if !directives.weights.iter().any(|(v, _)| v == version) {
                        directives.weights.push((version.clone(), *weight));
                    }
                }
                PolicyAction::Retry { .. } => {
                    if directives.retry.is_none() {
                        directives.retry = RetryConfig::from_action(&rule.action);
                    }
                }
                PolicyAction::Timeout { ms } => {
                    if directives.timeout.is_none() {
                        directives.timeout = Some(Duration::from_millis(*ms));
                    }
                }
                PolicyAction::CircuitBreaker { .. } => {}
            }
        }

        if has_allow && !allowed {
            return Err(rejected("*", "no allow rule matched".to_string()));
        }

        if let Some(policy) = undecided.first() {
            if directives.principal.is_none() {
                let principal = self
                    .authenticate(&request.headers)
                    .map_err(|reason| rejected(policy.as_str(), reason))?;
                directives.principal = Some(principal);
            }
        }

        if let Some(limiter) = rate_limiter {
            let identifier = limiter.identifier(
                service,
                &request.headers,
                client_ip,
                directives.principal.as_deref(),
            );
            limiter
                .check(&identifier)
                .map_err(|info| MeshError::RateLimitExceeded {
                    identifier: info.identifier,
                    retry_after: info.retry_after,
                })?;
        }

        directives.breaker = self.breaker_for(service);
        Ok(directives)
    }

    /// Validates the request credential. Returns a fingerprint of it.
    fn authenticate(&self, headers: &HeaderMap) -> std::result::Result<String, String> {
        let auth = self.authentication.read();
        let bearer = || {
            headers
                .get(http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::trim)
        };
        let api_key = || {
            headers
                .get(auth.header.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };

        let credential = match auth.scheme {
            AuthScheme::Bearer => bearer(),
            AuthScheme::ApiKey => api_key(),
            AuthScheme::None => bearer().or_else(api_key),
        }
        .filter(|c| !c.is_empty())
        .ok_or_else(|| "missing credential".to_string())?;

        if !auth.credentials.is_empty() && !auth.credentials.iter().any(|c| c == credential) {
            return Err("invalid credential".to_string());
        }

        let digest = Sha256::digest(credential.as_bytes());
        Ok(hex::encode(&digest[..8]))
    }
}

/// Higher priorities first; `None` after every explicit priority.
fn compare_priority(a: Option<i32>, b: Option<i32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

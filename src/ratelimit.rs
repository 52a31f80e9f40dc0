//! Fixed-window rate limiting keyed by caller identity.
//!
//! Each identifier (client IP, user or target service) gets its own counter
//! over a window of `window_secs`. The `limit + burst` request in a window is
//! the last one admitted; the next is rejected until the window rolls over.
//!
//! Supports X-Forwarded-For header parsing for clients behind proxies.

use crate::config::{RateLimitKey, RateLimitingConfig};
use dashmap::DashMap;
use http::HeaderMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Identifier used when the request carries no usable identity.
pub const ANONYMOUS: &str = "anonymous";

/// Counter for one window.
#[derive(Debug)]
struct Window {
    started: Instant,
    count: u64,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }

    /// Starts a fresh window if the current one has elapsed.
    fn roll(&mut self, now: Instant, length: Duration) {
        if now.duration_since(self.started) >= length {
            self.started = now;
            self.count = 0;
        }
    }

    fn try_acquire(&mut self, now: Instant, length: Duration, capacity: u64) -> bool {
        self.roll(now, length);
        if self.count < capacity {
            self.count += 1;
            true
        } else {
            false
        }
    }

    fn retry_after(&self, now: Instant, length: Duration) -> Duration {
        length.saturating_sub(now.duration_since(self.started))
    }
}

/// Window entry with TTL tracking.
struct ClientEntry {
    window: Mutex<Window>,
    last_access: Mutex<Instant>,
}

impl ClientEntry {
    fn new(now: Instant) -> Self {
        Self {
            window: Mutex::new(Window::new(now)),
            last_access: Mutex::new(now),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_access.lock().elapsed() > ttl
    }
}

/// Information about a rate limit rejection.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// The identifier whose window is exhausted.
    pub identifier: String,
    /// Time until the window rolls over.
    pub retry_after: Duration,
    /// Requests admitted per window.
    pub capacity: u64,
}

impl RateLimitInfo {
    /// Returns the `Retry-After` header value in seconds.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs().max(1)
    }
}

/// Rate limiter statistics.
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    /// Number of tracked identifiers.
    pub client_count: usize,
    pub limit: u64,
    pub window: Duration,
    pub capacity: u64,
}

/// Per-identifier fixed-window limiter.
pub struct RateLimiter {
    config: RateLimitingConfig,
    clients: DashMap<String, Arc<ClientEntry>>,
    last_cleanup: Mutex<Instant>,
}

impl RateLimiter {
    /// Creates a new rate limiter with the given configuration.
    pub fn new(config: RateLimitingConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &RateLimitingConfig {
        &self.config
    }

    /// Extracts the client IP from request headers.
    ///
    /// If `trust_forwarded_for` is enabled, attempts to parse the
    /// X-Forwarded-For header, then X-Real-IP. Falls back to the provided
    /// socket address.
    pub fn extract_client_ip(
        &self,
        headers: &HeaderMap,
        socket_addr: Option<IpAddr>,
    ) -> Option<IpAddr> {
        if self.config.trust_forwarded_for {
            if let Some(forwarded) = headers.get("x-forwarded-for") {
                if let Ok(value) = forwarded.to_str() {
                    // X-Forwarded-For format: client, proxy1, proxy2, ...
                    if let Some(ip_str) = value.split(',').map(|s| s.trim()).next() {
                        match IpAddr::from_str(ip_str) {
                            Ok(ip) => {
                                debug!(ip = %ip, "using X-Forwarded-For client IP");
                                return Some(ip);
                            }
                            Err(e) => {
                                warn!(
                                    header = %value,
                                    error = %e,
                                    "invalid IP in X-Forwarded-For header"
                                );
                            }
                        }
                    }
                }
            }

            if let Some(real_ip) = headers.get("x-real-ip") {
                if let Ok(value) = real_ip.to_str() {
                    match IpAddr::from_str(value.trim()) {
                        Ok(ip) => {
                            debug!(ip = %ip, "using X-Real-IP client IP");
                            return Some(ip);
                        }
                        Err(e) => {
                            warn!(
                                header = %value,
                                error = %e,
                                "invalid IP in X-Real-IP header"
                            );
                        }
                    }
                }
            }
        }

        socket_addr
    }

    /// Resolves the identifier a request is counted under.
    ///
    /// `user` is the authenticated principal when one is known.
    pub fn identifier(
        &self,
        service: &str,
        headers: &HeaderMap,
        client_ip: Option<IpAddr>,
        user: Option<&str>,
    ) -> String {
        let id = match self.config.key {
            RateLimitKey::Ip => self
                .extract_client_ip(headers, client_ip)
                .map(|ip| format!("ip:{}", ip)),
            RateLimitKey::User => user
                .map(str::to_string)
                .or_else(|| {
                    headers
                        .get("x-user-id")
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.trim().to_string())
                })
                .filter(|u| !u.is_empty())
                .map(|u| format!("user:{}", u)),
            RateLimitKey::Service => Some(format!("service:{}", service)),
        };
        id.unwrap_or_else(|| ANONYMOUS.to_string())
    }

    /// Counts one request for `identifier`.
    ///
    /// Returns `Ok(())` if admitted, `Err(RateLimitInfo)` if the window is
    /// exhausted.
    pub fn check(&self, identifier: &str) -> Result<(), RateLimitInfo> {
        self.check_at(identifier, Instant::now())
    }

    fn check_at(&self, identifier: &str, now: Instant) -> Result<(), RateLimitInfo> {
        self.maybe_cleanup();

        let entry = self
            .clients
            .entry(identifier.to_string())
            .or_insert_with(|| Arc::new(ClientEntry::new(now)))
            .clone();
        *entry.last_access.lock() = now;

        let window = self.config.window();
        let capacity = self.config.capacity();
        let mut counter = entry.window.lock();
        if counter.try_acquire(now, window, capacity) {
            return Ok(());
        }

        let retry_after = counter.retry_after(now, window);
        debug!(identifier = %identifier, capacity, "rate limit exceeded");
        Err(RateLimitInfo {
            identifier: identifier.to_string(),
            retry_after,
            capacity,
        })
    }

    /// Drops identifiers idle for several windows, at most once a minute.
    fn maybe_cleanup(&self) {
        let mut last_cleanup = self.last_cleanup.lock();
        if last_cleanup.elapsed() < Duration::from_secs(60) {
            return;
        }

        *last_cleanup = Instant::now();
        drop(last_cleanup);

        let ttl = self.config.window().max(Duration::from_secs(60)) * 2;
        let initial_count = self.clients.len();

        self.clients.retain(|_, entry| !entry.is_expired(ttl));

        let removed = initial_count.saturating_sub(self.clients.len());
        if removed > 0 {
            debug!(removed = removed, "cleaned up expired rate limit entries");
        }
    }

    /// Returns the current statistics.
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            client_count: self.clients.len(),
            limit: self.config.limit,
            window: self.config.window(),
            capacity: self.config.capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_window_admits_capacity() {
        let now = Instant::now();
        let mut window = Window::new(now);
        let length = Duration::from_secs(1);

        for _ in 0..3 {
            assert!(window.try_acquire(now, length, 3));
        }
        assert!(!window.try_acquire(now, length, 3));
        assert!(window.try_acquire(now + length, length, 3));
    }

    #[test]
    fn test_limit_plus_one_rejected() {
        let limiter = RateLimiter::new(RateLimitingConfig::new(5, 60));

        for _ in 0..5 {
            assert!(limiter.check("ip:10.0.0.1").is_ok());
        }
        let info = limiter.check("ip:10.0.0.1").unwrap_err();
        assert_eq!(info.identifier, "ip:10.0.0.1");
        assert_eq!(info.capacity, 5);
        assert!(info.retry_after <= Duration::from_secs(60));
    }

    #[test]
    fn test_new_window_admits_again() {
        let limiter = RateLimiter::new(RateLimitingConfig::new(2, 10));
        let start = Instant::now();

        assert!(limiter.check_at("user:alice", start).is_ok());
        assert!(limiter.check_at("user:alice", start).is_ok());
        assert!(limiter.check_at("user:alice", start).is_err());

        let later = start + Duration::from_secs(10);
        assert!(limiter.check_at("user:alice", later).is_ok());
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = RateLimiter::new(RateLimitingConfig::new(1, 60));
        assert!(limiter.check("ip:10.0.0.1").is_ok());
        assert!(limiter.check("ip:10.0.0.2").is_ok());
        assert!(limiter.check("ip:10.0.0.1").is_err());
        assert_eq!(limiter.stats().client_count, 2);
    }

    #[test]
    fn test_burst_extends_capacity() {
        let limiter = RateLimiter::new(RateLimitingConfig::new(2, 60).with_burst(1));
        for _ in 0..3 {
            assert!(limiter.check("service:orders").is_ok());
        }
        assert!(limiter.check("service:orders").is_err());
    }

    #[test]
    fn test_rate_limit_info() {
        let info = RateLimitInfo {
            identifier: ANONYMOUS.to_string(),
            retry_after: Duration::from_millis(500),
            capacity: 1,
        };
        assert_eq!(info.retry_after_secs(), 1);
    }

    #[test]
    fn test_extract_client_ip_no_trust() {
        let limiter = RateLimiter::new(RateLimitingConfig::new(100, 1));

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());

        let socket_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let result = limiter.extract_client_ip(&headers, Some(socket_ip));

        assert_eq!(result, Some(socket_ip));
    }

    #[test]
    fn test_extract_client_ip_trust_enabled() {
        let limiter =
            RateLimiter::new(RateLimitingConfig::new(100, 1).with_trust_forwarded_for(true));

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());

        let socket_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1));
        let result = limiter.extract_client_ip(&headers, Some(socket_ip));

        assert_eq!(result, Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))));
    }

    #[test]
    fn test_extract_client_ip_invalid_header() {
        let limiter =
            RateLimiter::new(RateLimitingConfig::new(100, 1).with_trust_forwarded_for(true));

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "not-an-ip".parse().unwrap());
        headers.insert("x-real-ip", "10.0.0.1".parse().unwrap());

        let result = limiter.extract_client_ip(&headers, None);
        assert_eq!(result, Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn test_identifier_by_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "bob".parse().unwrap());
        let ip = Some(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)));

        let by_ip = RateLimiter::new(RateLimitingConfig::new(1, 1));
        assert_eq!(by_ip.identifier("orders", &headers, ip, None), "ip:10.1.1.1");
        assert_eq!(by_ip.identifier("orders", &headers, None, None), ANONYMOUS);

        let by_user = RateLimiter::new(RateLimitingConfig::new(1, 1).with_key(RateLimitKey::User));
        assert_eq!(by_user.identifier("orders", &headers, ip, None), "user:bob");
        assert_eq!(
            by_user.identifier("orders", &headers, ip, Some("alice")),
            "user:alice"
        );

        let by_service =
            RateLimiter::new(RateLimitingConfig::new(1, 1).with_key(RateLimitKey::Service));
        assert_eq!(
            by_service.identifier("orders", &HeaderMap::new(), None, None),
            "service:orders"
        );
    }
}

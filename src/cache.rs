//! Response cache contract shared with the caching layer.
//!
//! Keys are `<prefix>:<hex(sha256("METHOD:path:sorted-query:vary-headers"))>`.
//! Any cache sitting on the same traffic path must derive keys this way so
//! entries line up across implementations.

use async_trait::async_trait;
use dashmap::DashMap;
use http::{HeaderMap, Method};
use hyper::body::Bytes;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Builds the cache key for a request.
///
/// Query pairs are decoded and sorted so parameter order does not matter.
/// `vary` lists the header names that partition the cache; they are
/// lowercased and sorted, and a missing header contributes an empty value.
pub fn cache_key(
    prefix: &str,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    vary: &[&str],
) -> String {
    let mut pairs: Vec<(String, String)> = query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default();
    pairs.sort();
    let sorted_query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();

    let names: BTreeSet<String> = vary.iter().map(|n| n.to_ascii_lowercase()).collect();
    let vary_headers = names
        .iter()
        .map(|name| {
            let value = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            format!("{}={}", name, value)
        })
        .collect::<Vec<_>>()
        .join("&");

    let material = format!(
        "{}:{}:{}:{}",
        method.as_str(),
        path,
        sorted_query,
        vary_headers
    );
    let digest = Sha256::digest(material.as_bytes());
    format!("{}:{}", prefix, hex::encode(digest))
}

/// Parsed `Cache-Control` response directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
    pub max_age: Option<Duration>,
}

impl CacheControl {
    /// Parses a header value. Unknown directives are ignored.
    pub fn parse(value: &str) -> Self {
        let mut control = Self::default();
        for directive in value.split(',').map(str::trim) {
            let (name, arg) = match directive.split_once('=') {
                Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                None => (directive, None),
            };
            match name.to_ascii_lowercase().as_str() {
                "no-store" => control.no_store = true,
                "no-cache" => control.no_cache = true,
                "private" => control.private = true,
                "max-age" => {
                    control.max_age = arg
                        .and_then(|a| a.parse::<u64>().ok())
                        .map(Duration::from_secs)
                }
                _ => {}
            }
        }
        control
    }

    /// Reads the directives from response headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        headers
            .get_all(http::header::CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(Self::parse)
            .fold(Self::default(), |acc, next| Self {
                no_store: acc.no_store || next.no_store,
                no_cache: acc.no_cache || next.no_cache,
                private: acc.private || next.private,
                max_age: next.max_age.or(acc.max_age),
            })
    }

    /// How long a shared cache may keep the response, or `None` if it must
    /// not be stored.
    pub fn ttl(&self, default_ttl: Duration) -> Option<Duration> {
        if self.no_store || self.no_cache || self.private {
            return None;
        }
        match self.max_age {
            Some(age) if age.is_zero() => None,
            Some(age) => Some(age),
            None => Some(default_ttl),
        }
    }
}

/// Storage operations expected from a response cache.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Stores `value`; `ttl` of `None` uses the cache default.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>);

    async fn delete(&self, key: &str) -> bool;

    /// Deletes every key matching a glob with `*` wildcards. Returns the
    /// number of keys removed.
    async fn delete_pattern(&self, pattern: &str) -> usize;

    /// Adds `member` to the set stored at `key`.
    async fn add_to_set(&self, key: &str, member: &str);
}

struct Entry {
    value: Bytes,
    expires_at: Instant,
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Process-local [`ResponseCache`] with per-entry TTL.
pub struct InMemoryResponseCache {
    default_ttl: Duration,
    entries: DashMap<String, Entry>,
    sets: DashMap<String, BTreeSet<String>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: DashMap::new(),
            sets: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Members of the set stored at `key`.
    pub fn members(&self, key: &str) -> Vec<String> {
        self.sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    /// Drops expired entries.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    let source = format!("^{}$", escaped.join(".*"));
    match Regex::new(&source) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!(pattern = %pattern, error = %e, "invalid cache key pattern");
            None
        }
    }
}

#[async_trait]
impl ResponseCache for InMemoryResponseCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let found = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            _ => None,
        };

        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "caching response");
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn delete(&self, key: &str) -> bool {
        let removed_entry = self.entries.remove(key).is_some();
        let removed_set = self.sets.remove(key).is_some();
        removed_entry || removed_set
    }

    async fn delete_pattern(&self, pattern: &str) -> usize {
        let Some(regex) = glob_to_regex(pattern) else {
            return 0;
        };
        let before = self.entries.len() + self.sets.len();
        self.entries.retain(|key, _| !regex.is_match(key));
        self.sets.retain(|key, _| !regex.is_match(key));
        before.saturating_sub(self.entries.len() + self.sets.len())
    }

    async fn add_to_set(&self, key: &str, member: &str) {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
    }
}

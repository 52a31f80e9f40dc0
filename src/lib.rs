//! Service mesh control plane.
//!
//! Manages the topology of a mesh (services and their replicas), keeps
//! instance health current, enforces traffic and security policies, and
//! routes gateway requests to healthy instances while collecting
//! per-service metrics.

pub mod admin;
pub mod admin_listener;
pub mod balancer;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod policy;
pub mod ratelimit;
pub mod registry;
pub mod request;
pub mod retry;
pub mod router;
pub mod sidecar;

pub use controller::MeshController;
pub use error::{MeshError, Result};

//! Instance selection.
//!
//! Smooth weighted round robin: every pick adds each candidate's weight to
//! its running score, takes the highest score, then subtracts the total
//! weight from the winner. Equal weights degrade to plain round robin.

use crate::registry::ServiceInstance;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{trace, warn};

/// Weighted round-robin state, one score table per service.
#[derive(Default)]
pub struct WeightedRoundRobin {
    scores: DashMap<String, Mutex<HashMap<String, i64>>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks one of `candidates` for `service`.
    ///
    /// Candidates with weight 0 are skipped. If every weight is 0 the
    /// candidates are treated as equally weighted.
    pub fn select(
        &self,
        service: &str,
        candidates: &[ServiceInstance],
        weight: impl Fn(&ServiceInstance) -> u32,
    ) -> Option<ServiceInstance> {
        if candidates.is_empty() {
            warn!(service = %service, "no healthy instances available");
            return None;
        }

        let mut weighted: Vec<(&ServiceInstance, i64)> = candidates
            .iter()
            .map(|instance| (instance, i64::from(weight(instance))))
            .filter(|(_, w)| *w > 0)
            .collect();
        if weighted.is_empty() {
            weighted = candidates.iter().map(|instance| (instance, 1)).collect();
        }

        let table = self.scores.entry(service.to_string()).or_default();
        let mut scores = table.lock();
        scores.retain(|id, _| weighted.iter().any(|(i, _)| &i.id == id));

        let total: i64 = weighted.iter().map(|(_, w)| w).sum();
        let mut best: Option<(&ServiceInstance, i64)> = None;
        for (instance, w) in &weighted {
            let score = scores.entry(instance.id.clone()).or_insert(0);
            *score += w;
            if best.map_or(true, |(_, s)| *score > s) {
                best = Some((*instance, *score));
            }
        }

        let (chosen, _) = best?;
        if let Some(score) = scores.get_mut(&chosen.id) {
            *score -= total;
        }
        trace!(service = %service, instance = %chosen.id, "selected instance");
        Some(chosen.clone())
    }

    /// Forgets the state of `service`.
    pub fn reset(&self, service: &str) {
        self.scores.remove(service);
    }
}

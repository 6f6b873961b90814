//! Load balancing: one interface, four strategies.
//!
//! `select` picks one backend among the already-filtered candidates;
//! `update_stats` feeds the outcome back. Stats maps are touched only
//! inside short critical sections so selection stays cheap under load.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::registry::Backend;

/// Strategy selector, configuration-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancerStrategy {
    /// Deterministic cyclic selection
    #[default]
    RoundRobin,
    /// Fewest active connections wins
    LeastConnections,
    /// Sampling proportional to effective weight
    Weighted,
    /// Uniform random
    Random,
}

/// The balancing contract.
pub trait LoadBalancer: Send + Sync {
    /// Choose one candidate. Empty candidates is `ServiceUnavailable`.
    fn select(&self, candidates: &[Backend]) -> GatewayResult<Backend>;

    /// Feed back the outcome of a proxied request.
    fn update_stats(&self, backend_id: Uuid, success: bool, latency: Duration) {
        let _ = (backend_id, success, latency);
    }
}

/// Build the configured strategy.
pub fn build(strategy: BalancerStrategy) -> Box<dyn LoadBalancer> {
    match strategy {
        BalancerStrategy::RoundRobin => Box::new(RoundRobin::new()),
        BalancerStrategy::LeastConnections => Box::new(LeastConnections::new()),
        BalancerStrategy::Weighted => Box::new(Weighted::new()),
        BalancerStrategy::Random => Box::new(Random),
    }
}

fn no_candidates() -> GatewayError {
    GatewayError::ServiceUnavailable("no healthy backend available".to_string())
}

/// Deterministic cyclic selection. The cursor is process-local and ignores
/// stats entirely.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<usize>,
}

impl RoundRobin {
    /// Create with the cursor at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, candidates: &[Backend]) -> GatewayResult<Backend> {
        if candidates.is_empty() {
            return Err(no_candidates());
        }
        let mut cursor = self.cursor.lock();
        let chosen = candidates[*cursor % candidates.len()].clone();
        *cursor = cursor.wrapping_add(1);
        trace!(backend_id = %chosen.id, "round-robin pick");
        Ok(chosen)
    }
}

/// Tracks in-flight connections per backend; the least-loaded candidate
/// wins, ties broken by first encountered.
#[derive(Debug, Default)]
pub struct LeastConnections {
    active: Mutex<HashMap<Uuid, usize>>,
}

impl LeastConnections {
    /// Create with no tracked connections.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn active_count(&self, id: Uuid) -> usize {
        self.active.lock().get(&id).copied().unwrap_or(0)
    }
}

impl LoadBalancer for LeastConnections {
    fn select(&self, candidates: &[Backend]) -> GatewayResult<Backend> {
        if candidates.is_empty() {
            return Err(no_candidates());
        }
        let mut active = self.active.lock();
        let chosen = candidates
            .iter()
            .min_by_key(|b| active.get(&b.id).copied().unwrap_or(0))
            .cloned()
            .ok_or_else(no_candidates)?;
        *active.entry(chosen.id).or_insert(0) += 1;
        Ok(chosen)
    }

    fn update_stats(&self, backend_id: Uuid, _success: bool, _latency: Duration) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&backend_id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WeightedStats {
    error_rate: f64,
    latency_ms: f64,
}

impl Default for WeightedStats {
    fn default() -> Self {
        Self {
            error_rate: 0.0,
            latency_ms: 0.0,
        }
    }
}

/// Sampling proportional to effective weight:
/// `w_eff = w · (1 − error_rate) / max(1, latency / 100ms)`, clamped to at
/// least 1 so a struggling backend keeps a trickle of traffic — unless its
/// declared weight is 0, which excludes it outright.
#[derive(Debug, Default)]
pub struct Weighted {
    stats: Mutex<HashMap<Uuid, WeightedStats>>,
}

impl Weighted {
    /// Create with neutral stats.
    pub fn new() -> Self {
        Self::default()
    }

    fn effective_weight(&self, backend: &Backend) -> f64 {
        if backend.weight == 0 {
            return 0.0;
        }
        let stats = self
            .stats
            .lock()
            .get(&backend.id)
            .copied()
            .unwrap_or_default();
        let latency_penalty = (stats.latency_ms / 100.0).max(1.0);
        let weight = f64::from(backend.weight) * (1.0 - stats.error_rate) / latency_penalty;
        weight.max(1.0)
    }
}

impl LoadBalancer for Weighted {
    fn select(&self, candidates: &[Backend]) -> GatewayResult<Backend> {
        if candidates.is_empty() {
            return Err(no_candidates());
        }
        let weights: Vec<f64> = candidates.iter().map(|b| self.effective_weight(b)).collect();
        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            return Err(no_candidates());
        }
        let mut point = fastrand::f64() * total;
        for (backend, weight) in candidates.iter().zip(&weights) {
            if *weight <= 0.0 {
                continue;
            }
            point -= weight;
            if point <= 0.0 {
                return Ok(backend.clone());
            }
        }
        // Floating point slack: fall back to the last weighted candidate.
        candidates
            .iter()
            .zip(&weights)
            .filter(|(_, w)| **w > 0.0)
            .next_back()
            .map(|(b, _)| b.clone())
            .ok_or_else(no_candidates)
    }

    fn update_stats(&self, backend_id: Uuid, success: bool, latency: Duration) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(backend_id).or_default();
        // Error rate decays by 0.9 per success; failures blend in at 0.1.
        entry.error_rate = if success {
            entry.error_rate * 0.9
        } else {
            entry.error_rate * 0.9 + 0.1
        };
        // Latency is an EMA with alpha = 0.1.
        let observed = latency.as_secs_f64() * 1000.0;
        entry.latency_ms = if entry.latency_ms == 0.0 {
            observed
        } else {
            entry.latency_ms * 0.9 + observed * 0.1
        };
    }
}

/// Uniform random selection; ignores stats.
#[derive(Debug, Default)]
pub struct Random;

impl LoadBalancer for Random {
    fn select(&self, candidates: &[Backend]) -> GatewayResult<Backend> {
        if candidates.is_empty() {
            return Err(no_candidates());
        }
        Ok(candidates[fastrand::usize(..candidates.len())].clone())
    }
}

//! Selection-fairness properties of the load balancer strategies.

use std::collections::HashMap;
use std::time::Duration;

use meshgate_gateway::balancer::{LeastConnections, LoadBalancer, RoundRobin, Weighted};
use meshgate_gateway::registry::{
    Backend, BackendEndpoint, BackendProtocol, BackendStatus, HealthSnapshot,
};
use proptest::prelude::*;
use uuid::Uuid;

fn backend(name: &str, weight: u32) -> Backend {
    Backend {
        id: Uuid::new_v4(),
        tenant: "t".into(),
        name: name.into(),
        protocol: BackendProtocol::Http,
        endpoint: BackendEndpoint::Url("http://127.0.0.1:9000/".parse().unwrap()),
        capabilities: HashMap::new(),
        weight,
        timeout: Duration::from_secs(30),
        max_retries: 3,
        tags: Default::default(),
        status: BackendStatus::Active,
        health: HealthSnapshot::default(),
        metadata: HashMap::new(),
    }
}

proptest! {
    /// Round-robin over a stable candidate set: among any `k·n`
    /// consecutive selections, every backend appears exactly `k` times.
    #[test]
    fn round_robin_is_exactly_fair(n in 1usize..8, k in 1usize..12) {
        let candidates: Vec<Backend> =
            (0..n).map(|i| backend(&format!("b{i}"), 100)).collect();
        let balancer = RoundRobin::new();

        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for _ in 0..(k * n) {
            let chosen = balancer.select(&candidates).unwrap();
            *counts.entry(chosen.id).or_default() += 1;
        }
        for candidate in &candidates {
            prop_assert_eq!(counts.get(&candidate.id).copied().unwrap_or(0), k);
        }
    }

    /// A zero-weight backend is never selected while positive-weight
    /// candidates exist, regardless of recorded stats.
    #[test]
    fn weighted_never_picks_zero_weight(
        positive_weights in prop::collection::vec(1u32..1000, 1..6),
        rounds in 1usize..200,
        failures in prop::collection::vec(any::<bool>(), 0..32),
    ) {
        let zero = backend("zero", 0);
        let mut candidates = vec![zero.clone()];
        for (i, weight) in positive_weights.iter().enumerate() {
            candidates.push(backend(&format!("b{i}"), *weight));
        }

        let balancer = Weighted::new();
        // Arbitrary stat history must not resurrect the excluded backend.
        for (i, success) in failures.iter().enumerate() {
            let id = candidates[i % candidates.len()].id;
            balancer.update_stats(id, *success, Duration::from_millis(50));
        }
        for _ in 0..rounds {
            let chosen = balancer.select(&candidates).unwrap();
            prop_assert_ne!(chosen.id, zero.id);
        }
    }

    /// Least-connections never lets any backend's in-flight count exceed
    /// the fair share by more than one when releases interleave evenly.
    #[test]
    fn least_connections_spreads_load(n in 1usize..6, picks in 1usize..48) {
        let candidates: Vec<Backend> =
            (0..n).map(|i| backend(&format!("b{i}"), 100)).collect();
        let balancer = LeastConnections::new();

        let mut counts: HashMap<Uuid, usize> = HashMap::new();
        for _ in 0..picks {
            let chosen = balancer.select(&candidates).unwrap();
            *counts.entry(chosen.id).or_default() += 1;
        }
        let max = counts.values().copied().max().unwrap_or(0);
        let min = candidates
            .iter()
            .map(|c| counts.get(&c.id).copied().unwrap_or(0))
            .min()
            .unwrap_or(0);
        prop_assert!(max - min <= 1);
    }
}

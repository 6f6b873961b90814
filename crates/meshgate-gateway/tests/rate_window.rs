//! Sliding-window admission property: for any request sequence, the
//! number of `Allow` outcomes inside any window never exceeds the limit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use meshgate_gateway::ratelimit::{
    MemoryStore, RateDecision, RateLimitConfig, RateLimiter, RateRule,
};
use proptest::prelude::*;

fn limiter(limit: u64, window_secs: u64) -> RateLimiter {
    let config = RateLimitConfig {
        rules: vec![RateRule { limit, window_secs }],
        ..Default::default()
    };
    RateLimiter::with_stores(config, None, Arc::new(MemoryStore::new()))
}

fn at(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).expect("valid timestamp")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Run an arbitrary non-decreasing timestamp sequence through the
    /// limiter and check every window position against the limit.
    #[test]
    fn allows_within_any_window_never_exceed_limit(
        gaps in prop::collection::vec(0i64..800, 1..80),
        limit in 1u64..10,
        window_secs in 1u64..3,
    ) {
        let limiter = limiter(limit, window_secs);
        let window_ms = (window_secs as i64) * 1000;

        let mut now = 1_000;
        let mut allowed_at: Vec<i64> = Vec::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            for gap in &gaps {
                now += gap;
                if limiter.check("10.0.0.1", at(now)).await == RateDecision::Allow {
                    allowed_at.push(now);
                }
            }
        });

        // Every trailing window anchored at an allowed instant holds at
        // most `limit` allows.
        for (i, anchor) in allowed_at.iter().enumerate() {
            let in_window = allowed_at[..=i]
                .iter()
                .filter(|ts| **ts > anchor - window_ms)
                .count() as u64;
            prop_assert!(
                in_window <= limit,
                "{in_window} allows inside one {window_ms}ms window (limit {limit})"
            );
        }
    }

    /// Distinct ips never share a window.
    #[test]
    fn ips_do_not_interfere(count in 1usize..20) {
        let limiter = limiter(1, 60);
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");
        runtime.block_on(async {
            for i in 0..count {
                let decision = limiter.check(&format!("10.0.0.{i}"), at(5_000)).await;
                prop_assert_eq!(decision, RateDecision::Allow);
            }
            Ok(())
        })?;
    }
}

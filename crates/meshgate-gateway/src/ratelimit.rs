//! Per-IP sliding-window rate limiting.
//!
//! Two stores implement one narrow contract — trim old entries, append the
//! current request, count per window — atomically per key. The primary is
//! a Redis sorted set driven by a Lua script so the three steps cannot
//! interleave across processes; the fallback is an in-memory deque behind
//! a per-key lock. A small circuit breaker fails the limiter over to the
//! fallback when Redis misbehaves and probes its way back after a
//! cooldown. Denied requests still consume a window slot.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// One `(limit, window)` enforcement pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateRule {
    /// Requests admitted per window
    pub limit: u64,
    /// Window length in seconds
    pub window_secs: u64,
}

impl RateRule {
    fn window_ms(&self) -> i64 {
        (self.window_secs as i64).saturating_mul(1000)
    }
}

/// Admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request admitted
    Allow,
    /// Request rejected; retry after the window has room
    Deny {
        /// Earliest time the window has room again
        retry_after: Duration,
    },
}

/// Count observed for one window after recording the current request.
#[derive(Debug, Clone, Copy)]
pub struct WindowCount {
    /// Entries in the window, including the one just appended
    pub count: u64,
    /// Oldest timestamp still inside the window (ms)
    pub oldest_ms: i64,
}

/// Errors from a window store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend failure
    #[error("rate-limit store error: {0}")]
    Backend(String),
}

/// The narrow store contract both backends implement: atomically trim
/// entries older than the largest window, append `now`, and report the
/// count and oldest entry for each requested window.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Record the current request and count each window.
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        windows_ms: &[i64],
    ) -> Result<Vec<WindowCount>, StoreError>;
}

/// In-memory fallback: per-key timestamp deques behind per-key locks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: DashMap<String, Arc<Mutex<VecDeque<i64>>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop keys whose newest entry is older than the largest window.
    pub fn sweep(&self, now_ms: i64, max_window_ms: i64) {
        self.keys.retain(|_, entries| {
            entries
                .lock()
                .back()
                .is_some_and(|newest| *newest >= now_ms - max_window_ms)
        });
    }

    /// Number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        windows_ms: &[i64],
    ) -> Result<Vec<WindowCount>, StoreError> {
        let entries = self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone();
        let mut entries = entries.lock();

        let max_window = windows_ms.iter().copied().max().unwrap_or(0);
        while entries.front().is_some_and(|ts| *ts < now_ms - max_window) {
            entries.pop_front();
        }
        entries.push_back(now_ms);

        Ok(windows_ms
            .iter()
            .map(|window| {
                let floor = now_ms - window;
                let count = entries.iter().filter(|ts| **ts >= floor).count() as u64;
                let oldest = entries
                    .iter()
                    .find(|ts| **ts >= floor)
                    .copied()
                    .unwrap_or(now_ms);
                WindowCount {
                    count,
                    oldest_ms: oldest,
                }
            })
            .collect())
    }
}

/// Redis primary: one sorted set per ip, scripted so trim/append/count are
/// atomic for the key across processes.
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
    script: redis::Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

const WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local maxw = tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', key, 0, now - maxw - 1)
redis.call('ZADD', key, now, ARGV[3])
redis.call('PEXPIRE', key, maxw)
local res = {}
for i = 4, #ARGV do
  local floor = now - tonumber(ARGV[i])
  res[#res+1] = redis.call('ZCOUNT', key, floor, '+inf')
  local oldest = redis.call('ZRANGEBYSCORE', key, floor, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
  if oldest[2] then
    res[#res+1] = math.floor(tonumber(oldest[2]))
  else
    res[#res+1] = now
  end
end
return res
"#;

impl RedisStore {
    /// Connect to Redis. The connection manager reconnects on its own.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            manager,
            script: redis::Script::new(WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        windows_ms: &[i64],
    ) -> Result<Vec<WindowCount>, StoreError> {
        let max_window = windows_ms.iter().copied().max().unwrap_or(0);
        // A unique member keeps same-millisecond requests distinct.
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());

        let mut invocation = self.script.key(key);
        invocation.arg(now_ms).arg(max_window).arg(member);
        for window in windows_ms {
            invocation.arg(*window);
        }
        let mut conn = self.manager.clone();
        let raw: Vec<i64> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if raw.len() != windows_ms.len() * 2 {
            return Err(StoreError::Backend(format!(
                "script returned {} values for {} windows",
                raw.len(),
                windows_ms.len()
            )));
        }
        Ok(raw
            .chunks_exact(2)
            .map(|pair| WindowCount {
                count: pair[0].max(0) as u64,
                oldest_ms: pair[1],
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    Healthy { consecutive_failures: u32 },
    Degraded { until: Instant },
}

/// Per-process primary-health breaker: N consecutive failures flip to
/// degraded for a cooldown; the first call after cooldown is the probe.
#[derive(Debug)]
struct Breaker {
    state: Mutex<BreakerState>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl Breaker {
    fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::Healthy {
                consecutive_failures: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn allow_primary(&self) -> bool {
        match *self.state.lock() {
            BreakerState::Healthy { .. } => true,
            BreakerState::Degraded { until } => Instant::now() >= until,
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, BreakerState::Healthy { consecutive_failures: 0 }) {
            debug!("rate-limit primary healthy");
        }
        *state = BreakerState::Healthy {
            consecutive_failures: 0,
        };
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            BreakerState::Healthy {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.failure_threshold {
                    warn!(failures, "rate-limit primary degraded");
                    BreakerState::Degraded {
                        until: Instant::now() + self.cooldown,
                    }
                } else {
                    BreakerState::Healthy {
                        consecutive_failures: failures,
                    }
                }
            }
            // A failed probe starts a fresh cooldown.
            BreakerState::Degraded { .. } => BreakerState::Degraded {
                until: Instant::now() + self.cooldown,
            },
        };
    }

    fn is_degraded(&self) -> bool {
        matches!(*self.state.lock(), BreakerState::Degraded { .. })
    }
}

/// Limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Master switch
    pub enabled: bool,
    /// Enforcement pairs; every request must fit all of them
    pub rules: Vec<RateRule>,
    /// Redis URL for the primary store; memory-only when unset
    pub redis_url: Option<String>,
    /// Deadline for one primary call before failing over (ms)
    pub primary_timeout_ms: u64,
    /// Consecutive primary failures before the breaker degrades
    pub failure_threshold: u32,
    /// Degraded cooldown before a probe (seconds)
    pub cooldown_secs: u64,
    /// Tokens that bypass rate limiting (admin / service)
    pub bypass_tokens: HashSet<String>,
    /// In-memory sweep cadence (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: vec![RateRule {
                limit: 300,
                window_secs: 60,
            }],
            redis_url: None,
            primary_timeout_ms: 50,
            failure_threshold: 5,
            cooldown_secs: 30,
            bypass_tokens: HashSet::new(),
            sweep_interval_secs: 60,
        }
    }
}

impl RateLimitConfig {
    /// Validate rule coherence: a longer window may never admit fewer
    /// requests than a shorter one.
    pub fn validate(&self) -> Result<(), String> {
        let mut sorted = self.rules.clone();
        sorted.sort_by_key(|r| r.window_secs);
        for pair in sorted.windows(2) {
            if pair[1].limit < pair[0].limit {
                return Err(format!(
                    "rule {}req/{}s admits fewer than {}req/{}s",
                    pair[1].limit, pair[1].window_secs, pair[0].limit, pair[0].window_secs
                ));
            }
        }
        for rule in &self.rules {
            if rule.limit == 0 || rule.window_secs == 0 {
                return Err("rate rules need a positive limit and window".to_string());
            }
        }
        Ok(())
    }
}

/// Observable limiter state for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct LimiterState {
    /// Whether enforcement is on
    pub enabled: bool,
    /// Which store served the last decisions
    pub backend: &'static str,
    /// Whether the breaker is currently degraded
    pub degraded: bool,
    /// Keys tracked by the in-memory fallback
    pub fallback_keys: usize,
}

/// The rate limiter facade.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows_ms: Vec<i64>,
    primary: Option<Arc<dyn WindowStore>>,
    fallback: Arc<MemoryStore>,
    breaker: Breaker,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("enabled", &self.config.enabled)
            .field("rules", &self.config.rules)
            .field("has_primary", &self.primary.is_some())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Build the limiter, connecting the Redis primary when configured.
    /// A primary that cannot connect at boot leaves the limiter on the
    /// fallback; the breaker will probe Redis once traffic flows.
    pub async fn new(config: RateLimitConfig) -> Self {
        let primary: Option<Arc<dyn WindowStore>> = match &config.redis_url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => {
                    info!("rate-limit primary connected");
                    Some(Arc::new(store))
                }
                Err(e) => {
                    warn!("rate-limit primary unavailable, using fallback: {e}");
                    None
                }
            },
            None => None,
        };
        Self::with_stores(config, primary, Arc::new(MemoryStore::new()))
    }

    /// Build with explicit stores (used by tests).
    pub fn with_stores(
        config: RateLimitConfig,
        primary: Option<Arc<dyn WindowStore>>,
        fallback: Arc<MemoryStore>,
    ) -> Self {
        let windows_ms = config.rules.iter().map(|r| r.window_ms()).collect();
        let breaker = Breaker::new(
            config.failure_threshold,
            Duration::from_secs(config.cooldown_secs),
        );
        Self {
            config,
            windows_ms,
            primary,
            fallback,
            breaker,
        }
    }

    /// Whether a presented token bypasses rate limiting entirely.
    pub fn is_bypassed(&self, token: Option<&str>) -> bool {
        token.is_some_and(|t| self.config.bypass_tokens.contains(t))
    }

    /// Admission check for one request from `ip` at `now`.
    pub async fn check(&self, ip: &str, now: DateTime<Utc>) -> RateDecision {
        if !self.config.enabled || self.config.rules.is_empty() {
            return RateDecision::Allow;
        }
        let key = format!("meshgate:ratelimit:ip:{ip}");
        let now_ms = now.timestamp_millis();

        let counts = match self.record(&key, now_ms).await {
            Ok(counts) => counts,
            Err(e) => {
                // Both stores failing is effectively impossible (the
                // fallback is infallible); fail open but loudly.
                warn!("rate-limit stores unavailable, admitting: {e}");
                return RateDecision::Allow;
            }
        };
        self.evaluate(&counts, now_ms)
    }

    async fn record(&self, key: &str, now_ms: i64) -> Result<Vec<WindowCount>, StoreError> {
        if let Some(primary) = &self.primary {
            if self.breaker.allow_primary() {
                let deadline = Duration::from_millis(self.config.primary_timeout_ms);
                match tokio::time::timeout(deadline, primary.record(key, now_ms, &self.windows_ms))
                    .await
                {
                    Ok(Ok(counts)) => {
                        self.breaker.on_success();
                        return Ok(counts);
                    }
                    Ok(Err(e)) => {
                        warn!("rate-limit primary error: {e}");
                        self.breaker.on_failure();
                    }
                    Err(_) => {
                        warn!(
                            timeout_ms = self.config.primary_timeout_ms,
                            "rate-limit primary timed out"
                        );
                        self.breaker.on_failure();
                    }
                }
            }
        }
        self.fallback.record(key, now_ms, &self.windows_ms).await
    }

    fn evaluate(&self, counts: &[WindowCount], now_ms: i64) -> RateDecision {
        let mut earliest_retry: Option<i64> = None;
        for (rule, window) in self.config.rules.iter().zip(counts) {
            if window.count > rule.limit {
                let retry_ms = (window.oldest_ms + rule.window_ms() - now_ms).max(1);
                earliest_retry = Some(match earliest_retry {
                    Some(current) => current.min(retry_ms),
                    None => retry_ms,
                });
            }
        }
        match earliest_retry {
            Some(retry_ms) => RateDecision::Deny {
                retry_after: Duration::from_millis(retry_ms as u64),
            },
            None => RateDecision::Allow,
        }
    }

    /// Observable state for the status surface.
    pub fn state(&self) -> LimiterState {
        let degraded = self.breaker.is_degraded();
        LimiterState {
            enabled: self.config.enabled,
            backend: if self.primary.is_some() && !degraded {
                "redis"
            } else {
                "memory"
            },
            degraded,
            fallback_keys: self.fallback.key_count(),
        }
    }

    /// Run the in-memory sweeper until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let max_window = self.windows_ms.iter().copied().max().unwrap_or(0);
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.fallback.sweep(Utc::now().timestamp_millis(), max_window);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

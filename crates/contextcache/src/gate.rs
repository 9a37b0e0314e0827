// crates/contextcache/src/gate.rs
// Usage/Rate Gate (spec 4.11): burst rate limiting plus daily quotas, gating
// every recall/write/ingest request before it reaches the rest of the
// pipeline. In-process by default; a `redis-gate` feature swaps the burst
// limiter for a Redis-backed one without changing the call contract, per
// SPEC_FULL 11 ("burst rate limiting posture").

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::env::GateConfig;

/// A structured refusal (spec 4.11): callers surface this as
/// `ContextCacheError::GateRefused`.
#[derive(Debug, Clone, PartialEq)]
pub struct GateRefusal {
    pub reason: String,
    pub retry_after_seconds: u64,
}

/// The dimension being gated, each with its own burst window and counter
/// bucket (spec 4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateKind {
    RecallPerIp,
    RecallPerAccount,
    WritePerIp,
    WritePerAccount,
    IngestPerIp,
    IngestPerAccount,
}

impl GateKind {
    fn window(self) -> Duration {
        match self {
            GateKind::RecallPerIp | GateKind::RecallPerAccount => Duration::from_secs(3600),
            GateKind::WritePerIp
            | GateKind::WritePerAccount
            | GateKind::IngestPerIp
            | GateKind::IngestPerAccount => Duration::from_secs(60),
        }
    }

    fn limit(self, cfg: &GateConfig) -> u32 {
        match self {
            GateKind::RecallPerIp => cfg.recall_per_ip_per_hour,
            GateKind::RecallPerAccount => cfg.recall_per_account_per_hour,
            GateKind::WritePerIp => cfg.write_per_ip_per_minute,
            GateKind::WritePerAccount => cfg.write_per_account_per_minute,
            GateKind::IngestPerIp => cfg.ingest_per_ip_per_minute,
            GateKind::IngestPerAccount => cfg.ingest_per_account_per_minute,
        }
    }

    fn label(self) -> &'static str {
        match self {
            GateKind::RecallPerIp => "recall_per_ip",
            GateKind::RecallPerAccount => "recall_per_account",
            GateKind::WritePerIp => "write_per_ip",
            GateKind::WritePerAccount => "write_per_account",
            GateKind::IngestPerIp => "ingest_per_ip",
            GateKind::IngestPerAccount => "ingest_per_account",
        }
    }
}

/// The daily quota dimension (spec 4.11 "Daily quotas"), keyed on
/// `(user_id, day)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaKind {
    Memory,
    Recall,
    Project,
}

impl QuotaKind {
    fn limit(self, cfg: &GateConfig) -> i64 {
        match self {
            QuotaKind::Memory => cfg.daily_memory_limit,
            QuotaKind::Recall => cfg.daily_recall_limit,
            QuotaKind::Project => cfg.daily_project_limit,
        }
    }

    fn label(self) -> &'static str {
        match self {
            QuotaKind::Memory => "daily_memory_limit",
            QuotaKind::Recall => "daily_recall_limit",
            QuotaKind::Project => "daily_project_limit",
        }
    }
}

/// Pluggable burst-limiter backend (SPEC_FULL 11 "burst rate limiting
/// posture"): the in-process implementation below is always available and is
/// what ships active; a `redis-gate`-featured implementation swaps it for a
/// shared backend without changing `UsageGate`'s call contract.
pub trait RateLimitBackend: Send + Sync {
    /// Returns `Ok(())` if the request is admitted, or the seconds until the
    /// oldest entry in the window expires.
    fn check_and_record(&self, kind: GateKind, key: &str, limit: u32, now: std::time::Instant) -> Result<(), u64>;
}

/// Sliding-window burst limiter: one `VecDeque<Instant>` per `(kind, key)`.
/// Entries older than the window are dropped before counting (spec 4.11).
struct InProcessBurstLimiter {
    windows: Mutex<HashMap<(GateKind, String), VecDeque<std::time::Instant>>>,
}

impl InProcessBurstLimiter {
    fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimitBackend for InProcessBurstLimiter {
    fn check_and_record(&self, kind: GateKind, key: &str, limit: u32, now: std::time::Instant) -> Result<(), u64> {
        if limit == 0 {
            // A configured limit of zero means unlimited for this dimension.
            return Ok(());
        }
        let window = kind.window();
        let mut guard = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let entry = guard.entry((kind, key.to_string())).or_insert_with(VecDeque::new);

        while let Some(front) = entry.front() {
            if now.duration_since(*front) > window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() as u32 >= limit {
            let oldest = *entry.front().expect("len >= limit > 0 implies non-empty");
            let remaining = window.saturating_sub(now.duration_since(oldest));
            return Err(remaining.as_secs().max(1));
        }

        entry.push_back(now);
        Ok(())
    }
}

#[cfg(feature = "redis-gate")]
mod redis_backend {
    //! Redis-backed burst limiter (behind `redis-gate`, off by default).
    //! Mirrors the in-process sliding window with a per-`(kind, key)` sorted
    //! set: each admitted request is `ZADD`ed under a millisecond score,
    //! expired entries are trimmed with `ZREMRANGEBYSCORE`, and the
    //! remaining cardinality is compared against `limit`. A single
    //! synchronous connection guarded by a mutex is sufficient here — this
    //! backend exists to prove the shape of a shared-state gate, not to
    //! carry production throughput (see SPEC_FULL 11).

    use super::{GateKind, RateLimitBackend};
    use redis::Commands;
    use std::sync::Mutex;
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    pub struct RedisBurstLimiter {
        conn: Mutex<redis::Connection>,
        epoch_instant: Instant,
        epoch_unix_ms: u128,
    }

    impl RedisBurstLimiter {
        /// Opens a connection to `redis_url` (e.g. `redis://127.0.0.1/`).
        pub fn connect(redis_url: &str) -> redis::RedisResult<Self> {
            let client = redis::Client::open(redis_url)?;
            let conn = client.get_connection()?;
            Ok(Self {
                conn: Mutex::new(conn),
                epoch_instant: Instant::now(),
                epoch_unix_ms: SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis(),
            })
        }

        /// Bridges the monotonic `Instant` the gate call sites pass in to a
        /// wall-clock millisecond score Redis can sort on.
        fn unix_ms(&self, now: Instant) -> i64 {
            let delta_ms = now.saturating_duration_since(self.epoch_instant).as_millis();
            (self.epoch_unix_ms + delta_ms) as i64
        }
    }

    impl RateLimitBackend for RedisBurstLimiter {
        fn check_and_record(&self, kind: GateKind, key: &str, limit: u32, now: Instant) -> Result<(), u64> {
            if limit == 0 {
                return Ok(());
            }
            let redis_key = format!("contextcache:burst:{}:{key}", kind.label());
            let window_ms = kind.window().as_millis() as i64;
            let now_ms = self.unix_ms(now);
            let cutoff_ms = now_ms - window_ms;

            let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            let _: () = conn
                .zrembyscore(&redis_key, "-inf", cutoff_ms)
                .map_err(|_| kind.window().as_secs().max(1))?;
            let count: u32 = conn.zcard(&redis_key).map_err(|_| kind.window().as_secs().max(1))?;

            if count >= limit {
                let oldest: Vec<(String, i64)> =
                    conn.zrange_withscores(&redis_key, 0, 0).map_err(|_| kind.window().as_secs().max(1))?;
                let remaining_ms = oldest.first().map(|(_, score)| (window_ms - (now_ms - score)).max(1000)).unwrap_or(1000);
                return Err((remaining_ms / 1000).max(1) as u64);
            }

            let member = format!("{now_ms}-{:x}", fastrand_like(now));
            let _: () = conn.zadd(&redis_key, member, now_ms).map_err(|_| kind.window().as_secs().max(1))?;
            let _: () = conn.expire(&redis_key, kind.window().as_secs() as i64).unwrap_or(());
            Ok(())
        }
    }

    /// Cheap per-call nonce so concurrent requests in the same millisecond
    /// don't collide on the sorted-set member name. Not a general-purpose
    /// RNG — just enough entropy to keep members distinct.
    fn fastrand_like(now: Instant) -> u64 {
        let ptr = &now as *const Instant as u64;
        ptr.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(now.elapsed().subsec_nanos() as u64)
    }
}

#[cfg(feature = "redis-gate")]
pub use redis_backend::RedisBurstLimiter;

/// Daily quota counters, grain `(user_id, day)` (spec 4.11, SPEC_FULL 11).
struct QuotaCounters {
    counts: Mutex<HashMap<(i64, QuotaKind, NaiveDate), i64>>,
}

impl QuotaCounters {
    fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn check_and_increment(
        &self,
        user_id: i64,
        kind: QuotaKind,
        day: NaiveDate,
        limit: i64,
        is_unlimited: bool,
    ) -> Result<(), ()> {
        if is_unlimited || limit == 0 {
            return Ok(());
        }
        let mut guard = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        let count = guard.entry((user_id, kind, day)).or_insert(0);
        if *count >= limit {
            return Err(());
        }
        *count += 1;
        Ok(())
    }

    fn current(&self, user_id: i64, kind: QuotaKind, day: NaiveDate) -> i64 {
        let guard = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *guard.get(&(user_id, kind, day)).unwrap_or(&0)
    }
}

/// Handle to the gate; cheap to clone (`Arc` around two mutex-protected
/// maps), threaded through `AppState` rather than held as a global.
#[derive(Clone)]
pub struct UsageGate {
    burst: Arc<dyn RateLimitBackend>,
    quotas: Arc<QuotaCounters>,
    config: GateConfig,
}

impl UsageGate {
    /// In-process burst limiter (the default, active backend).
    pub fn new(config: GateConfig) -> Self {
        Self {
            burst: Arc::new(InProcessBurstLimiter::new()),
            quotas: Arc::new(QuotaCounters::new()),
            config,
        }
    }

    /// Swap in an alternate burst-limiter backend (e.g. `RedisBurstLimiter`
    /// behind `redis-gate`) without changing the rest of the gate's contract.
    pub fn with_backend(config: GateConfig, burst: Arc<dyn RateLimitBackend>) -> Self {
        Self {
            burst,
            quotas: Arc::new(QuotaCounters::new()),
            config,
        }
    }

    /// Check a burst-rate dimension. `now` is `std::time::Instant` since the
    /// sliding window only cares about elapsed wall-clock duration, not
    /// calendar time. Unlimited users bypass burst limiting too (spec 4.11:
    /// "users marked unlimited bypass both layers").
    pub fn check_burst(
        &self,
        kind: GateKind,
        key: &str,
        now: std::time::Instant,
        is_unlimited: bool,
    ) -> Result<(), GateRefusal> {
        if is_unlimited {
            return Ok(());
        }
        let limit = kind.limit(&self.config);
        self.burst.check_and_record(kind, key, limit, now).map_err(|retry_after_seconds| GateRefusal {
            reason: format!("rate limit exceeded: {}", kind.label()),
            retry_after_seconds,
        })
    }

    /// Check and consume one unit of a daily quota for `user_id` on `day`.
    pub fn check_quota(
        &self,
        user_id: i64,
        kind: QuotaKind,
        day: NaiveDate,
        is_unlimited: bool,
    ) -> Result<(), GateRefusal> {
        let limit = kind.limit(&self.config);
        self.quotas
            .check_and_increment(user_id, kind, day, limit, is_unlimited)
            .map_err(|_| GateRefusal {
                reason: format!("daily quota exceeded: {}", kind.label()),
                retry_after_seconds: seconds_until_next_day(day),
            })
    }

    pub fn current_quota_usage(&self, user_id: i64, kind: QuotaKind, day: NaiveDate) -> i64 {
        self.quotas.current(user_id, kind, day)
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }
}

fn seconds_until_next_day(day: NaiveDate) -> u64 {
    let tomorrow = day.succ_opt().unwrap_or(day);
    let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc();
    let now = Utc::now();
    (midnight - now).num_seconds().max(1) as u64
}

/// Helper used by request handlers to read "today" in UTC (spec 4.11 grain
/// is `(user_id, day)` where day is a UTC calendar date).
pub fn today(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn burst_limiter_admits_up_to_limit_then_refuses() {
        let gate = UsageGate::new(GateConfig {
            write_per_ip_per_minute: 2,
            ..GateConfig::default()
        });
        let now = Instant::now();
        assert!(gate.check_burst(GateKind::WritePerIp, "1.2.3.4", now, false).is_ok());
        assert!(gate.check_burst(GateKind::WritePerIp, "1.2.3.4", now, false).is_ok());
        let refusal = gate.check_burst(GateKind::WritePerIp, "1.2.3.4", now, false);
        assert!(refusal.is_err());
        assert!(refusal.unwrap_err().retry_after_seconds > 0);
    }

    #[test]
    fn burst_limiter_window_expiry_frees_capacity() {
        let gate = UsageGate::new(GateConfig {
            write_per_ip_per_minute: 1,
            ..GateConfig::default()
        });
        let t0 = Instant::now();
        assert!(gate.check_burst(GateKind::WritePerIp, "1.2.3.4", t0, false).is_ok());
        assert!(gate.check_burst(GateKind::WritePerIp, "1.2.3.4", t0, false).is_err());
        let t1 = t0 + Duration::from_secs(61);
        assert!(gate.check_burst(GateKind::WritePerIp, "1.2.3.4", t1, false).is_ok());
    }

    #[test]
    fn burst_limiter_keys_are_independent() {
        let gate = UsageGate::new(GateConfig {
            write_per_ip_per_minute: 1,
            ..GateConfig::default()
        });
        let now = Instant::now();
        assert!(gate.check_burst(GateKind::WritePerIp, "1.2.3.4", now, false).is_ok());
        assert!(gate.check_burst(GateKind::WritePerIp, "5.6.7.8", now, false).is_ok());
    }

    #[test]
    fn quota_blocks_after_limit_but_unlimited_bypasses() {
        let gate = UsageGate::new(GateConfig {
            daily_memory_limit: 1,
            ..GateConfig::default()
        });
        let day = NaiveDate::from_ymd_opt(2026, 7, 27).unwrap();
        assert!(gate.check_quota(1, QuotaKind::Memory, day, false).is_ok());
        assert!(gate.check_quota(1, QuotaKind::Memory, day, false).is_err());
        assert!(gate.check_quota(1, QuotaKind::Memory, day, true).is_ok());
    }

    #[test]
    fn quota_is_scoped_per_user_and_day() {
        let gate = UsageGate::new(GateConfig {
            daily_memory_limit: 1,
            ..GateConfig::default()
        });
        let day1 = NaiveDate::from_ymd_opt(2026, 7, 27).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2026, 7, 28).unwrap();
        assert!(gate.check_quota(1, QuotaKind::Memory, day1, false).is_ok());
        assert!(gate.check_quota(2, QuotaKind::Memory, day1, false).is_ok());
        assert!(gate.check_quota(1, QuotaKind::Memory, day2, false).is_ok());
    }
}

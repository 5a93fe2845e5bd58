//! Per-User Rate Limiting
//!
//! Every inbound message is screened by [`UserRateLimiter::allow`] before any
//! model call is made.
//!
//! Features:
//! - Two token buckets per user (hourly and daily), refilled continuously
//! - Hard window resets: a full hour (day) after the last reset the bucket is refilled
//! - Temporary ban once either bucket runs dry; nothing is consumed while banned
//! - Go-style ban durations (`"90s"`, `"1h30m"`) with a 24h fallback

use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Ban applied when the configured duration cannot be used
pub const DEFAULT_BAN_HOURS: i64 = 24;

static DURATION_PART: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+(?:\.[0-9]*)?|\.[0-9]+)(ns|us|µs|μs|ms|s|m|h)").unwrap()
});

/// Parse a Go-style duration string (`"300ms"`, `"1.5h"`, `"2h45m"`, `"-1m"`).
///
/// Returns `None` for anything Go's `time.ParseDuration` would reject.
pub fn parse_go_duration(input: &str) -> Option<Duration> {
    let (negative, mut rest) = match input.as_bytes().first() {
        Some(b'-') => (true, &input[1..]),
        Some(b'+') => (false, &input[1..]),
        _ => (false, input),
    };

    if rest == "0" {
        return Some(Duration::zero());
    }
    if rest.is_empty() {
        return None;
    }

    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let caps = DURATION_PART.captures(rest)?;
        let value: f64 = caps[1].parse().ok()?;
        let unit_nanos = match &caps[2] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        total_nanos += value * unit_nanos;
        rest = &rest[caps[0].len()..];
    }

    if total_nanos > i64::MAX as f64 {
        return None;
    }
    let nanos = total_nanos.round() as i64;
    Some(Duration::nanoseconds(if negative { -nanos } else { nanos }))
}

/// Resolve the configured ban duration. Unparseable and negative values
/// yield `None`.
pub fn ban_duration(raw: &str) -> Option<Duration> {
    parse_go_duration(raw).filter(|d| *d >= Duration::zero())
}

/// Rate limiter configuration (immutable per bot instance)
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Permits per rolling hour
    pub messages_per_hour: u32,
    /// Permits per rolling day
    pub messages_per_day: u32,
    /// Ban applied once a budget is exhausted
    pub temp_ban: Duration,
    /// Configured ban duration that was rejected in favour of the default
    pub rejected_ban: Option<String>,
}

impl RateLimitConfig {
    pub fn new(messages_per_hour: u32, messages_per_day: u32, temp_ban_duration: &str) -> Self {
        let (temp_ban, rejected_ban) = match ban_duration(temp_ban_duration) {
            Some(ban) => (ban, None),
            None => (
                Duration::hours(DEFAULT_BAN_HOURS),
                Some(temp_ban_duration.to_string()),
            ),
        };

        Self {
            messages_per_hour,
            messages_per_day,
            temp_ban,
            rejected_ban,
        }
    }
}

/// Which budget ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Hourly,
    Daily,
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitDecision {
    /// Permit consumed from both budgets
    Allowed {
        hourly_remaining: u32,
        daily_remaining: u32,
    },
    /// An earlier ban is still in effect
    Banned { until: DateTime<Utc> },
    /// A budget just ran out and a new ban was issued
    Exceeded {
        window: Window,
        banned_until: DateTime<Utc>,
    },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

/// Continuously refilling token bucket
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    period: Duration,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn full(capacity: u32, period: Duration, now: DateTime<Utc>) -> Self {
        Self {
            capacity: f64::from(capacity),
            tokens: f64::from(capacity),
            period,
            last_refill: now,
        }
    }

    fn reset(&mut self, now: DateTime<Utc>) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        if now <= self.last_refill {
            return;
        }
        let elapsed_ms = (now - self.last_refill).num_milliseconds() as f64;
        let period_ms = self.period.num_milliseconds() as f64;
        self.tokens = (self.tokens + elapsed_ms * self.capacity / period_ms).min(self.capacity);
        self.last_refill = now;
    }

    fn has_permit(&self) -> bool {
        self.tokens >= 1.0
    }

    fn take(&mut self) {
        self.tokens -= 1.0;
    }

    fn remaining(&self) -> u32 {
        self.tokens.max(0.0).floor() as u32
    }
}

/// Limiter state for one user
#[derive(Debug, Clone)]
struct UserLimitState {
    hourly: TokenBucket,
    daily: TokenBucket,
    last_hourly_reset: DateTime<Utc>,
    last_daily_reset: DateTime<Utc>,
    banned_until: Option<DateTime<Utc>>,
}

impl UserLimitState {
    fn new(config: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            hourly: TokenBucket::full(config.messages_per_hour, Duration::hours(1), now),
            daily: TokenBucket::full(config.messages_per_day, Duration::hours(24), now),
            last_hourly_reset: now,
            last_daily_reset: now,
            banned_until: None,
        }
    }

    fn is_banned(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.banned_until.filter(|until| now < *until)
    }
}

/// Per-user hourly/daily limiter with temporary bans
pub struct UserRateLimiter {
    bot_id: String,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    /// user_id -> state; one lock serializes every decision
    users: Mutex<HashMap<i64, UserLimitState>>,
}

impl UserRateLimiter {
    pub fn new(bot_id: &str, config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        if let Some(raw) = &config.rejected_ban {
            warn!(
                bot = %bot_id,
                "Invalid temp_ban_duration {:?}, using {}h default",
                raw, DEFAULT_BAN_HOURS
            );
        }

        Self {
            bot_id: bot_id.to_string(),
            config,
            clock,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `user_id` may proceed. Never blocks.
    pub fn allow(&self, user_id: i64) -> bool {
        self.check(user_id).is_allowed()
    }

    /// Screen a request and report why it was (not) allowed
    pub fn check(&self, user_id: i64) -> RateLimitDecision {
        let mut users = self.users.lock();
        let now = self.clock.now();
        let state = users
            .entry(user_id)
            .or_insert_with(|| UserLimitState::new(&self.config, now));

        if let Some(until) = state.is_banned(now) {
            debug!(bot = %self.bot_id, "User {} is banned until {}", user_id, until);
            return RateLimitDecision::Banned { until };
        }

        if now - state.last_hourly_reset >= Duration::hours(1) {
            state.hourly.reset(now);
            state.last_hourly_reset = now;
        }
        if now - state.last_daily_reset >= Duration::hours(24) {
            state.daily.reset(now);
            state.last_daily_reset = now;
        }

        state.hourly.refill(now);
        state.daily.refill(now);

        let exhausted = if !state.hourly.has_permit() {
            Some(Window::Hourly)
        } else if !state.daily.has_permit() {
            Some(Window::Daily)
        } else {
            None
        };

        if let Some(window) = exhausted {
            let banned_until = now + self.config.temp_ban;
            state.banned_until = Some(banned_until);
            warn!(
                bot = %self.bot_id,
                "User {} exceeded {:?} limit, banned until {}",
                user_id, window, banned_until
            );
            return RateLimitDecision::Exceeded {
                window,
                banned_until,
            };
        }

        state.hourly.take();
        state.daily.take();

        let decision = RateLimitDecision::Allowed {
            hourly_remaining: state.hourly.remaining(),
            daily_remaining: state.daily.remaining(),
        };
        debug!(bot = %self.bot_id, "User {} allowed: {:?}", user_id, decision);
        decision
    }

    /// Current limiter statistics
    pub fn stats(&self) -> RateLimitStats {
        let users = self.users.lock();
        let now = self.clock.now();

        RateLimitStats {
            tracked_users: users.len(),
            banned_users: users.values().filter(|s| s.is_banned(now).is_some()).count(),
        }
    }
}

/// Rate limit statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStats {
    pub tracked_users: usize,
    pub banned_users: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::capture_logs;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 1, 0, 0, 0).unwrap()
    }

    fn limiter(per_hour: u32, per_day: u32, ban: &str) -> (UserRateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let limiter = UserRateLimiter::new(
            "test",
            RateLimitConfig::new(per_hour, per_day, ban),
            clock.clone(),
        );
        (limiter, clock)
    }

    #[test]
    fn test_parse_go_duration() {
        let cases = [
            ("1h", Some(Duration::hours(1))),
            ("1m", Some(Duration::minutes(1))),
            ("90s", Some(Duration::seconds(90))),
            ("1h30m", Some(Duration::minutes(90))),
            ("1.5h", Some(Duration::minutes(90))),
            ("500ms", Some(Duration::milliseconds(500))),
            ("0", Some(Duration::zero())),
            ("-2m", Some(Duration::minutes(-2))),
            ("", None),
            ("1d", None),
            ("one hour", None),
            ("10", None),
            ("1h ", None),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_go_duration(input), expected, "input {:?}", input);
        }
    }

    #[test]
    fn test_ban_duration_fallback() {
        assert_eq!(ban_duration("45m"), Some(Duration::minutes(45)));
        assert_eq!(ban_duration("garbage"), None);
        assert_eq!(ban_duration(""), None);
        assert_eq!(ban_duration("-1h"), None);

        let config = RateLimitConfig::new(5, 10, "-1h");
        assert_eq!(config.temp_ban, Duration::hours(24));
        assert_eq!(config.rejected_ban.as_deref(), Some("-1h"));
        assert_eq!(RateLimitConfig::new(5, 10, "45m").rejected_ban, None);
    }

    #[test]
    fn test_ban_fallback_warning_names_bot() {
        let logs = capture_logs(|| {
            UserRateLimiter::new(
                "support_bot",
                RateLimitConfig::new(5, 10, "forever"),
                Arc::new(ManualClock::new(t0())),
            );
        });

        assert!(logs.contains("Invalid temp_ban_duration \"forever\""), "{}", logs);
        assert!(logs.contains("bot=support_bot"), "{}", logs);

        let quiet = capture_logs(|| {
            UserRateLimiter::new(
                "support_bot",
                RateLimitConfig::new(5, 10, "1h"),
                Arc::new(ManualClock::new(t0())),
            );
        });
        assert!(quiet.is_empty(), "{}", quiet);
    }

    #[test]
    fn test_hourly_limit_then_ban() {
        let (limiter, _clock) = limiter(5, 10, "1h");

        for i in 0..5 {
            assert!(limiter.allow(42), "Request {} should be allowed", i);
        }

        match limiter.check(42) {
            RateLimitDecision::Exceeded {
                window,
                banned_until,
            } => {
                assert_eq!(window, Window::Hourly);
                assert_eq!(banned_until, t0() + Duration::hours(1));
            }
            other => panic!("expected Exceeded, got {:?}", other),
        }

        assert_eq!(
            limiter.check(42),
            RateLimitDecision::Banned {
                until: t0() + Duration::hours(1)
            }
        );
    }

    #[test]
    fn test_ban_lifted_and_hourly_refreshed() {
        let (limiter, clock) = limiter(5, 10, "30m");

        for _ in 0..5 {
            assert!(limiter.allow(1));
        }
        assert!(!limiter.allow(1));

        clock.advance(Duration::minutes(30) + Duration::hours(1));
        assert!(limiter.allow(1));
    }

    #[test]
    fn test_hourly_then_daily_sequence() {
        let (limiter, clock) = limiter(5, 10, "1m");

        for i in 0..5 {
            assert!(limiter.allow(12345), "Expected message {} to be allowed", i + 1);
        }
        assert!(!limiter.allow(12345), "hourly limit exceeded");
        assert!(!limiter.allow(12345), "still banned");

        clock.advance(Duration::minutes(1));
        clock.advance(Duration::hours(1));

        assert!(limiter.allow(12345), "allowed after ban and hourly reset");
        for i in 0..4 {
            assert!(limiter.allow(12345), "Expected message {} towards daily limit", i + 1);
        }
        assert!(!limiter.allow(12345));
    }

    #[test]
    fn test_no_budget_consumed_while_banned() {
        let (limiter, clock) = limiter(2, 100, "10m");

        assert!(limiter.allow(7));
        assert!(limiter.allow(7));
        assert!(!limiter.allow(7));

        for _ in 0..20 {
            assert!(!limiter.allow(7));
        }

        // Hourly window resets one hour after the first request
        clock.advance(Duration::hours(1));
        assert!(limiter.allow(7));
        assert!(limiter.allow(7));
        assert!(!limiter.allow(7));
    }

    #[test]
    fn test_expired_ban_resumes_budget_evaluation() {
        let (limiter, clock) = limiter(3, 100, "1m");

        for _ in 0..3 {
            assert!(limiter.allow(9));
        }
        assert!(!limiter.allow(9));

        clock.advance(Duration::seconds(59));
        assert!(matches!(limiter.check(9), RateLimitDecision::Banned { .. }));

        // Ban is over but the hourly bucket has barely refilled
        clock.advance(Duration::seconds(1));
        match limiter.check(9) {
            RateLimitDecision::Exceeded {
                window,
                banned_until,
            } => {
                assert_eq!(window, Window::Hourly);
                assert_eq!(banned_until, t0() + Duration::minutes(2));
            }
            other => panic!("expected a fresh ban, got {:?}", other),
        }
    }

    #[test]
    fn test_default_ban_is_exactly_24h() {
        let (limiter, clock) = limiter(1, 10, "not-a-duration");

        assert!(limiter.allow(5));
        assert!(!limiter.allow(5));

        clock.advance(Duration::hours(24) - Duration::seconds(1));
        assert!(!limiter.allow(5));

        clock.advance(Duration::seconds(1));
        assert!(limiter.allow(5));
    }

    #[test]
    fn test_hourly_reset_independent_of_daily() {
        let (limiter, clock) = limiter(2, 100, "1s");

        assert!(limiter.allow(3));
        assert!(limiter.allow(3));

        clock.advance(Duration::hours(1));
        assert!(limiter.allow(3));
        assert!(limiter.allow(3));
    }

    #[test]
    fn test_daily_limit_and_reset() {
        let (limiter, clock) = limiter(10, 3, "1m");

        for _ in 0..3 {
            assert!(limiter.allow(11));
        }
        match limiter.check(11) {
            RateLimitDecision::Exceeded { window, .. } => assert_eq!(window, Window::Daily),
            other => panic!("expected daily exhaustion, got {:?}", other),
        }

        // Hourly resets, daily has not refilled a full permit yet
        clock.advance(Duration::hours(1));
        assert!(!limiter.allow(11));

        clock.set(t0() + Duration::hours(24));
        assert!(limiter.allow(11));
        assert!(limiter.allow(11));
        assert!(limiter.allow(11));
    }

    #[test]
    fn test_continuous_refill_between_resets() {
        let (limiter, clock) = limiter(4, 100, "0s");

        for _ in 0..4 {
            assert!(limiter.allow(8));
        }
        // Zero-length ban: denied once, then evaluated normally
        assert!(!limiter.allow(8));

        // 4 per hour -> one permit every 15 minutes
        clock.advance(Duration::minutes(15));
        assert!(limiter.allow(8));
        assert!(!limiter.allow(8));
    }

    #[test]
    fn test_ban_never_moves_backward() {
        let (limiter, clock) = limiter(1, 1, "2h");

        assert!(limiter.allow(4));
        let first = match limiter.check(4) {
            RateLimitDecision::Exceeded { banned_until, .. } => banned_until,
            other => panic!("unexpected {:?}", other),
        };

        // Hourly budget is back, daily is not: banned again from the expiry point
        clock.advance(Duration::hours(2));
        let second = match limiter.check(4) {
            RateLimitDecision::Exceeded {
                window,
                banned_until,
            } => {
                assert_eq!(window, Window::Daily);
                banned_until
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(second > first);
        assert_eq!(second, t0() + Duration::hours(4));
    }

    #[test]
    fn test_user_isolation() {
        let (limiter, _clock) = limiter(2, 10, "1h");

        assert!(limiter.allow(1));
        assert!(limiter.allow(1));
        assert!(!limiter.allow(1));

        assert!(limiter.allow(2));

        let stats = limiter.stats();
        assert_eq!(stats.tracked_users, 2);
        assert_eq!(stats.banned_users, 1);
    }

    #[test]
    fn test_concurrent_requests_respect_budget() {
        let (limiter, _clock) = limiter(20, 1000, "1h");

        let allowed: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| (0..10).filter(|_| limiter.allow(77)).count()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(allowed, 20);
    }
}

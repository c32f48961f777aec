// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};

/// Per-provider request quota. `max_per_second` drives a continuously
/// refilled token bucket capped at `burst`; the minute and hour limits
/// are enforced with sliding event-time windows.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitRule {
    pub max_per_second: u32,
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    pub burst: u32,
}

impl Default for RateLimitRule {
    fn default() -> Self {
        RateLimitRule {
            max_per_second: 1,
            max_per_minute: 30,
            max_per_hour: 500,
            burst: 2,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RateLimiterStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub throttled_requests: u64,
    pub last_request: Option<SystemTime>,
    pub last_throttle: Option<SystemTime>,
}

struct TokenBucket {
    rule: RateLimitRule,

    // Token bucket state for the per-second gate. Refill is computed
    // lazily from elapsed wall-clock time; no background thread.
    tokens: f64,
    last_refill: Instant,

    // Sliding windows hold the completion timestamps still inside
    // their span.
    minute_window: VecDeque<Instant>,
    hour_window: VecDeque<Instant>,

    // Absolute instant before which the provider is blocked, as
    // imposed by a server Retry-After response.
    retry_after_until: Option<Instant>,

    stats: RateLimiterStats,
}

impl TokenBucket {
    fn new(rule: RateLimitRule) -> Self {
        TokenBucket {
            rule,
            tokens: rule.burst as f64,
            last_refill: Instant::now(),
            minute_window: VecDeque::new(),
            hour_window: VecDeque::new(),
            retry_after_until: None,
            stats: RateLimiterStats::default(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let added = elapsed * self.rule.max_per_second as f64;
        self.tokens = (self.tokens + added).min(self.rule.burst as f64);
        // Skip the bookkeeping for sub-token refills so time keeps
        // accumulating toward the next whole token.
        if added > 0.1 {
            self.last_refill = now;
        }
    }

    fn token_wait(&self) -> Duration {
        let needed = 1.0 - self.tokens;
        let secs = if self.rule.max_per_second == 0 {
            1.0
        } else {
            needed / self.rule.max_per_second as f64
        };
        round_up_to_millisecond(Duration::from_secs_f64(secs.max(0.0)))
    }
}

fn round_up_to_millisecond(d: Duration) -> Duration {
    let millis = d.as_secs_f64() * 1000.0;
    Duration::from_millis(millis.ceil().max(1.0) as u64)
}

fn evict_window(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(oldest) = window.front() {
        if now.duration_since(*oldest) > span {
            window.pop_front();
        } else {
            break;
        }
    }
}

fn window_wait(window: &VecDeque<Instant>, now: Instant, span: Duration) -> Duration {
    match window.front() {
        None => Duration::ZERO,
        Some(oldest) => {
            let reset_at = *oldest + span;
            if reset_at <= now {
                Duration::ZERO
            } else {
                round_up_to_millisecond(reset_at - now)
            }
        }
    }
}

/// Per-provider rate limiter combining a token bucket with minute and
/// hour sliding windows plus a server-imposed retry-after gate.
///
/// `try_acquire` only *checks*; the caller commits consumption with
/// `complete` once the request has actually been issued. Both take the
/// same mutex, so the worst case under contention is a one-request
/// overshoot between a passed check and its completion.
pub struct ApiRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl Default for ApiRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiRateLimiter {
    pub fn new() -> Self {
        ApiRateLimiter {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Installs or replaces the quota for `provider`.
    pub fn set_provider_limit(&self, provider: &str, rule: RateLimitRule) {
        let mut buckets = self.buckets.lock().unwrap();
        match buckets.get_mut(provider) {
            Some(bucket) => {
                bucket.rule = rule;
                info!(
                    "Updated rate limit for {}: {}/s, {}/min, {}/h, burst={}",
                    provider, rule.max_per_second, rule.max_per_minute,
                    rule.max_per_hour, rule.burst);
            }
            None => {
                buckets.insert(provider.to_string(), TokenBucket::new(rule));
                info!(
                    "Initialized rate limit for {}: {}/s, {}/min, {}/h, burst={}",
                    provider, rule.max_per_second, rule.max_per_minute,
                    rule.max_per_hour, rule.burst);
            }
        }
    }

    /// Non-blocking admission check. Returns None when the request may
    /// proceed, or the wait until the earliest gate opens. Gates are
    /// evaluated in order: retry-after, per-second tokens, per-minute
    /// window, per-hour window. Nothing is consumed here.
    pub fn try_acquire(&self, provider: &str) -> Option<Duration> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = match buckets.get_mut(provider) {
            Some(b) => b,
            // No limit configured for this provider.
            None => return None,
        };
        let now = Instant::now();

        if let Some(until) = bucket.retry_after_until {
            if now < until {
                let wait = round_up_to_millisecond(until - now);
                debug!("{} blocked by Retry-After for {:?}", provider, wait);
                bucket.stats.throttled_requests += 1;
                bucket.stats.last_throttle = Some(SystemTime::now());
                return Some(wait);
            }
            bucket.retry_after_until = None;
        }

        bucket.refill(now);
        if bucket.tokens < 1.0 {
            let wait = bucket.token_wait();
            debug!("{} per-second limit reached, wait {:?}", provider, wait);
            bucket.stats.throttled_requests += 1;
            bucket.stats.last_throttle = Some(SystemTime::now());
            return Some(wait);
        }

        evict_window(&mut bucket.minute_window, now, Duration::from_secs(60));
        if bucket.minute_window.len() >= bucket.rule.max_per_minute as usize {
            let wait = window_wait(&bucket.minute_window, now, Duration::from_secs(60));
            debug!("{} per-minute limit reached, wait {:?}", provider, wait);
            bucket.stats.throttled_requests += 1;
            bucket.stats.last_throttle = Some(SystemTime::now());
            return Some(wait);
        }

        evict_window(&mut bucket.hour_window, now, Duration::from_secs(3600));
        if bucket.hour_window.len() >= bucket.rule.max_per_hour as usize {
            let wait = window_wait(&bucket.hour_window, now, Duration::from_secs(3600));
            debug!("{} per-hour limit reached, wait {:?}", provider, wait);
            bucket.stats.throttled_requests += 1;
            bucket.stats.last_throttle = Some(SystemTime::now());
            return Some(wait);
        }

        None
    }

    /// Blocking acquire: sleeps out each reported wait until admitted.
    pub fn acquire(&self, provider: &str) {
        loop {
            match self.try_acquire(provider) {
                None => return,
                Some(wait) => std::thread::sleep(wait),
            }
        }
    }

    /// Records a server 429 / Retry-After response. The provider is
    /// blocked until the absolute instant `now + retry_after`.
    pub fn record_rate_limit_response(&self, provider: &str, retry_after: Duration) {
        let mut buckets = self.buckets.lock().unwrap();
        match buckets.get_mut(provider) {
            Some(bucket) => {
                bucket.retry_after_until = Some(Instant::now() + retry_after);
                warn!(
                    "{} returned rate limit response, honoring Retry-After {:?}",
                    provider, retry_after);
            }
            None => warn!("Rate limit response for unknown provider {}", provider),
        }
    }

    /// Commits a completed request: consumes one token, stamps both
    /// sliding windows, and updates statistics. Called after the HTTP
    /// exchange regardless of outcome.
    pub fn complete(&self, provider: &str, success: bool) {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = match buckets.get_mut(provider) {
            Some(b) => b,
            None => {
                warn!("Request completion for unknown provider {}", provider);
                return;
            }
        };
        let now = Instant::now();
        bucket.refill(now);
        bucket.tokens -= 1.0;
        bucket.minute_window.push_back(now);
        bucket.hour_window.push_back(now);
        bucket.stats.total_requests += 1;
        bucket.stats.last_request = Some(SystemTime::now());
        if success {
            bucket.stats.successful_requests += 1;
        }
    }

    pub fn stats(&self, provider: &str) -> RateLimiterStats {
        let buckets = self.buckets.lock().unwrap();
        buckets
            .get(provider)
            .map(|b| b.stats.clone())
            .unwrap_or_default()
    }

    /// True when the provider would currently be denied.
    pub fn is_rate_limited(&self, provider: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = match buckets.get_mut(provider) {
            Some(b) => b,
            None => return false,
        };
        let now = Instant::now();
        if let Some(until) = bucket.retry_after_until {
            if now < until {
                return true;
            }
        }
        bucket.refill(now);
        bucket.tokens < 1.0
    }

    /// Wait until the provider's earliest gate opens, zero if open now.
    pub fn time_until_reset(&self, provider: &str) -> Duration {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = match buckets.get_mut(provider) {
            Some(b) => b,
            None => return Duration::ZERO,
        };
        let now = Instant::now();
        if let Some(until) = bucket.retry_after_until {
            if now < until {
                return round_up_to_millisecond(until - now);
            }
        }
        bucket.refill(now);
        if bucket.tokens < 1.0 {
            return bucket.token_wait();
        }
        Duration::ZERO
    }

    /// Clears one provider's state, preserving its rule.
    pub fn reset(&self, provider: &str) {
        let mut buckets = self.buckets.lock().unwrap();
        match buckets.get_mut(provider) {
            Some(bucket) => {
                let rule = bucket.rule;
                *bucket = TokenBucket::new(rule);
                info!("Reset rate limiter state for {}", provider);
            }
            None => warn!("Attempted to reset unknown provider {}", provider),
        }
    }

    /// Clears all providers' state, preserving their rules.
    pub fn reset_all(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        for bucket in buckets.values_mut() {
            let rule = bucket.rule;
            *bucket = TokenBucket::new(rule);
        }
        info!("Reset rate limiter state for all providers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter_with(provider: &str, rule: RateLimitRule) -> ApiRateLimiter {
        let limiter = ApiRateLimiter::new();
        limiter.set_provider_limit(provider, rule);
        limiter
    }

    #[test]
    fn test_unknown_provider_is_unlimited() {
        let limiter = ApiRateLimiter::new();
        assert_eq!(limiter.try_acquire("anything"), None);
        assert!(!limiter.is_rate_limited("anything"));
    }

    #[test]
    fn test_burst_then_throttle() {
        let limiter = limiter_with("p", RateLimitRule {
            max_per_second: 1,
            max_per_minute: 100,
            max_per_hour: 1000,
            burst: 1,
        });

        // First request admitted, then committed.
        assert_eq!(limiter.try_acquire("p"), None);
        limiter.complete("p", /*success=*/true);

        // Second immediate request must wait out the token refill:
        // between ~0.5s and 1s depending on elapsed time.
        let wait = limiter.try_acquire("p").expect("should be throttled");
        assert!(wait >= Duration::from_millis(500), "wait {:?}", wait);
        assert!(wait <= Duration::from_millis(1000), "wait {:?}", wait);

        let stats = limiter.stats("p");
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.throttled_requests, 1);
    }

    #[test]
    fn test_wait_scales_with_backlog() {
        // With rps=R, after N completes inside one second the wait is
        // at least (N-R)/R seconds.
        let limiter = limiter_with("p", RateLimitRule {
            max_per_second: 2,
            max_per_minute: 100,
            max_per_hour: 1000,
            burst: 2,
        });
        let n = 5u32;
        for _ in 0..n {
            limiter.complete("p", true);
        }
        let wait = limiter.try_acquire("p").expect("should be throttled");
        let floor = Duration::from_secs_f64((n as f64 - 2.0) / 2.0);
        assert!(wait >= floor, "wait {:?} < floor {:?}", wait, floor);
    }

    #[test]
    fn test_minute_window() {
        let limiter = limiter_with("p", RateLimitRule {
            max_per_second: 100,
            max_per_minute: 2,
            max_per_hour: 1000,
            burst: 100,
        });
        limiter.complete("p", true);
        limiter.complete("p", true);
        let wait = limiter.try_acquire("p").expect("minute window full");
        // The window opens when the oldest entry ages out, within 60s.
        assert!(wait <= Duration::from_secs(60));
        assert!(wait > Duration::from_secs(55));
    }

    #[test]
    fn test_retry_after_blocks_until_instant() {
        let limiter = limiter_with("p", RateLimitRule {
            max_per_second: 100,
            max_per_minute: 100,
            max_per_hour: 1000,
            burst: 100,
        });
        limiter.record_rate_limit_response("p", Duration::from_millis(120));

        let wait = limiter.try_acquire("p").expect("blocked by retry-after");
        assert!(wait <= Duration::from_millis(121));
        assert!(limiter.is_rate_limited("p"));

        std::thread::sleep(Duration::from_millis(130));
        assert_eq!(limiter.try_acquire("p"), None);
        assert!(!limiter.is_rate_limited("p"));
    }

    #[test]
    fn test_token_refill_over_time() {
        let limiter = limiter_with("p", RateLimitRule {
            max_per_second: 10,
            max_per_minute: 100,
            max_per_hour: 1000,
            burst: 1,
        });
        limiter.complete("p", true);
        assert!(limiter.try_acquire("p").is_some());

        // 10/s refills a full token within 100ms.
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(limiter.try_acquire("p"), None);
    }

    #[test]
    fn test_reset_preserves_rule() {
        let rule = RateLimitRule {
            max_per_second: 1,
            max_per_minute: 100,
            max_per_hour: 1000,
            burst: 1,
        };
        let limiter = limiter_with("p", rule);
        limiter.complete("p", true);
        assert!(limiter.try_acquire("p").is_some());

        limiter.reset("p");
        assert_eq!(limiter.try_acquire("p"), None);
        assert_eq!(limiter.stats("p").total_requests, 0);
    }

    #[test]
    fn test_acquire_blocks_then_admits() {
        let limiter = limiter_with("p", RateLimitRule {
            max_per_second: 20,
            max_per_minute: 100,
            max_per_hour: 1000,
            burst: 1,
        });
        limiter.complete("p", true);
        let start = Instant::now();
        limiter.acquire("p");
        // One token at 20/s takes up to 50ms to refill.
        assert!(start.elapsed() <= Duration::from_millis(500));
    }

}  // mod tests.

//! Outbound request pacing.
//!
//! Two modes: a constant spacing between consecutive requests, and a
//! quota-header mode that follows GitHub-style `x-ratelimit-*` headers. In
//! quota mode the governor keeps a running request/elapsed ratio and slows
//! down before the upstream quota runs out. When it does run out, the governor
//! waits for the advertised reset and retries the same request a bounded
//! number of times.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{FetchError, FetchedResponse, HttpFetcher};

/// Wait used when an exhausted response carries no reset header.
const FALLBACK_RESET_WAIT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaPolicy {
    /// Known hourly quota, used until the upstream reports `x-ratelimit-limit`.
    pub hourly_limit: u64,
    /// Fraction of the quota considered safe to consume.
    pub safe_fraction: f64,
    /// Fraction of the safe rate the backoff converges to.
    pub target_fraction: f64,
    pub reset_buffer: Duration,
    pub max_retries: usize,
    /// Wait for reset whenever remaining/limit drops to `strict_threshold`.
    pub strict: bool,
    pub strict_threshold: f64,
}

impl QuotaPolicy {
    /// GitHub REST quotas: 60/hour anonymous, 5000/hour with a token.
    pub fn github(authenticated: bool) -> Self {
        Self {
            hourly_limit: if authenticated { 5000 } else { 60 },
            safe_fraction: 0.8,
            target_fraction: 0.9,
            reset_buffer: Duration::from_secs(2),
            max_retries: 3,
            strict: false,
            strict_threshold: 0.2,
        }
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GovernorMode {
    FixedInterval(Duration),
    QuotaHeader(QuotaPolicy),
}

/// Quota state reported by one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaSnapshot {
    pub remaining: u64,
    pub limit: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl QuotaSnapshot {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let remaining = header_number::<i64>(headers, "x-ratelimit-remaining")?.max(0) as u64;
        let limit = header_number::<u64>(headers, "x-ratelimit-limit");
        let reset_at = header_number::<i64>(headers, "x-ratelimit-reset")
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        Some(Self {
            remaining,
            limit,
            reset_at,
        })
    }
}

fn header_number<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[derive(Debug, Error)]
pub enum GovernorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("rate limit exceeded for {url} after {attempts} attempts")]
    RateLimitExceeded { url: String, attempts: usize },
}

#[derive(Debug, Default)]
struct GovernorState {
    first_request: Option<Instant>,
    last_request: Option<Instant>,
    requests: u64,
    quota: Option<QuotaSnapshot>,
}

#[derive(Debug)]
pub struct RateGovernor {
    mode: GovernorMode,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(mode: GovernorMode) -> Self {
        Self {
            mode,
            state: Mutex::new(GovernorState::default()),
        }
    }

    pub fn fixed_interval(delay: Duration) -> Self {
        Self::new(GovernorMode::FixedInterval(delay))
    }

    pub fn quota_header(policy: QuotaPolicy) -> Self {
        Self::new(GovernorMode::QuotaHeader(policy))
    }

    pub async fn requests_made(&self) -> u64 {
        self.state.lock().await.requests
    }

    /// Start a new pacing window. The last quota snapshot is kept so an
    /// exhausted quota still blocks until its reset.
    pub async fn begin_run(&self) {
        let mut state = self.state.lock().await;
        debug!(mode = ?self.mode, previous_requests = state.requests, "starting governor run");
        state.first_request = None;
        state.last_request = None;
        state.requests = 0;
    }

    /// Record the quota reported by a response.
    pub async fn record_quota(&self, snapshot: QuotaSnapshot) {
        self.state.lock().await.quota = Some(snapshot);
    }

    /// Suspend until the next request is allowed, then count it.
    pub async fn pace(&self) {
        let delay = {
            let state = self.state.lock().await;
            self.delay_before_next(&state, Instant::now(), Utc::now())
        };
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, "pacing outbound request");
            tokio::time::sleep(delay).await;
        }

        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.first_request.get_or_insert(now);
        state.last_request = Some(now);
        state.requests += 1;
    }

    fn delay_before_next(&self, state: &GovernorState, now: Instant, wall_now: DateTime<Utc>) -> Duration {
        match self.mode {
            GovernorMode::FixedInterval(interval) => state
                .last_request
                .map(|last| interval.saturating_sub(now.saturating_duration_since(last)))
                .unwrap_or(Duration::ZERO),
            GovernorMode::QuotaHeader(policy) => {
                let limit = state
                    .quota
                    .and_then(|q| q.limit)
                    .unwrap_or(policy.hourly_limit);

                let reset_wait = match state.quota {
                    Some(q) if q.remaining == 0 => reset_wait(&q, &policy, wall_now),
                    Some(q) if policy.strict && limit > 0
                        && (q.remaining as f64 / limit as f64) <= policy.strict_threshold =>
                    {
                        reset_wait(&q, &policy, wall_now)
                    }
                    _ => Duration::ZERO,
                };

                let elapsed = state
                    .first_request
                    .map(|first| now.saturating_duration_since(first))
                    .unwrap_or(Duration::ZERO);
                let pacing = pacing_delay(state.requests, elapsed, limit, &policy);

                reset_wait.max(pacing)
            }
        }
    }

    /// Paced GET. In quota mode, exhausted responses are retried after the reset.
    pub async fn get(
        &self,
        http: &HttpFetcher,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<FetchedResponse, GovernorError> {
        let policy = match self.mode {
            GovernorMode::FixedInterval(_) => {
                self.pace().await;
                return Ok(http.get(url, headers).await?);
            }
            GovernorMode::QuotaHeader(policy) => policy,
        };

        let mut attempt = 0;
        loop {
            self.pace().await;
            let resp = http.get(url, headers).await?;
            let snapshot = QuotaSnapshot::from_headers(&resp.headers);
            if let Some(snapshot) = snapshot {
                self.record_quota(snapshot).await;
            }

            if !is_exhausted(resp.status) {
                return Ok(resp);
            }

            attempt += 1;
            if attempt > policy.max_retries {
                return Err(GovernorError::RateLimitExceeded {
                    url: url.to_string(),
                    attempts: attempt,
                });
            }

            let exhausted = snapshot.unwrap_or(QuotaSnapshot {
                remaining: 0,
                limit: None,
                reset_at: None,
            });
            let wait = reset_wait(&exhausted, &policy, Utc::now());
            warn!(
                url,
                status = resp.status.as_u16(),
                attempt,
                wait_secs = wait.as_secs(),
                "upstream quota exhausted; waiting for reset"
            );
            self.record_quota(QuotaSnapshot {
                remaining: 0,
                ..exhausted
            })
            .await;
            // pace() performs the actual reset wait before the retry.
        }
    }
}

fn is_exhausted(status: StatusCode) -> bool {
    status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS
}

fn reset_wait(snapshot: &QuotaSnapshot, policy: &QuotaPolicy, wall_now: DateTime<Utc>) -> Duration {
    match snapshot.reset_at {
        Some(reset_at) => (reset_at - wall_now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_add(policy.reset_buffer),
        None => FALLBACK_RESET_WAIT,
    }
}

/// Delay that brings the effective hourly rate back under the safe fraction.
///
/// When `requests` over `elapsed` projects above `safe_fraction * hourly_limit`,
/// the result is the extra wait needed for the observed rate to equal
/// `target_fraction` of that safe rate. Otherwise zero.
pub fn pacing_delay(requests: u64, elapsed: Duration, hourly_limit: u64, policy: &QuotaPolicy) -> Duration {
    if requests == 0 || hourly_limit == 0 {
        return Duration::ZERO;
    }
    let safe_per_hour = hourly_limit as f64 * policy.safe_fraction;
    let elapsed_secs = elapsed.as_secs_f64();
    let projected_per_hour = if elapsed_secs > 0.0 {
        requests as f64 / elapsed_secs * 3600.0
    } else {
        f64::INFINITY
    };
    if projected_per_hour <= safe_per_hour {
        return Duration::ZERO;
    }

    let target_per_sec = safe_per_hour * policy.target_fraction / 3600.0;
    if target_per_sec <= 0.0 {
        return Duration::ZERO;
    }
    let required_secs = requests as f64 / target_per_sec;
    Duration::from_secs_f64((required_secs - elapsed_secs).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(remaining: &str, limit: &str, reset: i64) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("x-ratelimit-remaining", HeaderValue::from_str(remaining).unwrap());
        map.insert("x-ratelimit-limit", HeaderValue::from_str(limit).unwrap());
        map.insert("x-ratelimit-reset", HeaderValue::from_str(&reset.to_string()).unwrap());
        map
    }

    #[test]
    fn quota_headers_parse() {
        let snapshot = QuotaSnapshot::from_headers(&headers("42", "5000", 1_700_000_000)).unwrap();
        assert_eq!(snapshot.remaining, 42);
        assert_eq!(snapshot.limit, Some(5000));
        assert_eq!(snapshot.reset_at, DateTime::from_timestamp(1_700_000_000, 0));
        assert!(QuotaSnapshot::from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn negative_remaining_clamps_to_zero() {
        let snapshot = QuotaSnapshot::from_headers(&headers("-1", "60", 0)).unwrap();
        assert_eq!(snapshot.remaining, 0);
    }

    #[test]
    fn pacing_is_zero_under_the_safe_rate() {
        let policy = QuotaPolicy::github(true);
        // 100 requests in 10 minutes projects to 600/hour, well under 4000.
        assert_eq!(
            pacing_delay(100, Duration::from_secs(600), 5000, &policy),
            Duration::ZERO
        );
    }

    #[test]
    fn pacing_converges_to_ninety_percent_of_safe_rate() {
        let policy = QuotaPolicy::github(false);
        // Safe = 48/hour, target = 43.2/hour. 10 requests need 10 / 43.2 hours.
        let delay = pacing_delay(10, Duration::from_secs(60), 60, &policy);
        let expected = 10.0 / (48.0 * 0.9) * 3600.0 - 60.0;
        assert!((delay.as_secs_f64() - expected).abs() < 0.01, "{delay:?}");
    }

    #[test]
    fn fixed_interval_only_waits_for_the_remainder() {
        let governor = RateGovernor::fixed_interval(Duration::from_millis(150));
        let now = Instant::now();
        let state = GovernorState {
            first_request: Some(now),
            last_request: Some(now),
            requests: 1,
            quota: None,
        };
        let delay = governor.delay_before_next(&state, now + Duration::from_millis(100), Utc::now());
        assert_eq!(delay, Duration::from_millis(50));
        let delay = governor.delay_before_next(&state, now + Duration::from_millis(400), Utc::now());
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn strict_mode_waits_at_twenty_percent() {
        let policy = QuotaPolicy::github(true).with_strict(true);
        let governor = RateGovernor::quota_header(policy);
        let wall_now = Utc::now();
        let state = GovernorState {
            quota: Some(QuotaSnapshot {
                remaining: 1000,
                limit: Some(5000),
                reset_at: Some(wall_now + chrono::Duration::seconds(30)),
            }),
            ..Default::default()
        };
        let delay = governor.delay_before_next(&state, Instant::now(), wall_now);
        assert_eq!(delay, Duration::from_secs(32));

        let lenient = RateGovernor::quota_header(QuotaPolicy::github(true));
        assert_eq!(
            lenient.delay_before_next(&state, Instant::now(), wall_now),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_quota_blocks_until_reset() {
        let governor = RateGovernor::quota_header(QuotaPolicy::github(true));
        governor
            .record_quota(QuotaSnapshot {
                remaining: 0,
                limit: Some(5000),
                reset_at: Some(Utc::now() + chrono::Duration::seconds(10)),
            })
            .await;

        let started = Instant::now();
        governor.pace().await;
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert_eq!(governor.requests_made().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn new_run_paces_as_if_fresh_after_a_long_idle_gap() {
        let governor = RateGovernor::quota_header(QuotaPolicy::github(false));
        governor.pace().await;
        tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;

        governor.begin_run().await;
        assert_eq!(governor.requests_made().await, 0);
        governor.pace().await;
        let started = Instant::now();
        governor.pace().await;

        // 60/hour quota: safe 48/hour, target 43.2/hour.
        let min_gap = Duration::from_secs_f64(3600.0 / (0.9 * 0.8 * 60.0));
        assert!(started.elapsed() >= min_gap, "{:?}", started.elapsed());
        assert_eq!(governor.requests_made().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn new_run_keeps_an_exhausted_quota() {
        let governor = RateGovernor::quota_header(QuotaPolicy::github(true));
        governor
            .record_quota(QuotaSnapshot {
                remaining: 0,
                limit: Some(5000),
                reset_at: Some(Utc::now() + chrono::Duration::seconds(10)),
            })
            .await;
        governor.begin_run().await;

        let started = Instant::now();
        governor.pace().await;
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn repeated_exhaustion_fails_with_rate_limit_exceeded() {
        use axum::{http::StatusCode as AxumStatus, routing::get, Router};

        let router = Router::new().route(
            "/quota",
            get(|| async {
                let reset = Utc::now().timestamp().to_string();
                (
                    AxumStatus::FORBIDDEN,
                    [
                        ("x-ratelimit-remaining", "0".to_string()),
                        ("x-ratelimit-limit", "1000000".to_string()),
                        ("x-ratelimit-reset", reset),
                    ],
                    "rate limited",
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let http = HttpFetcher::new(crate::HttpClientConfig::default()).unwrap();
        let governor = RateGovernor::quota_header(QuotaPolicy {
            reset_buffer: Duration::from_millis(5),
            max_retries: 2,
            ..QuotaPolicy::github(true)
        });
        let err = governor
            .get(&http, &format!("http://{addr}/quota"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, GovernorError::RateLimitExceeded { attempts: 3, .. }));
        assert_eq!(governor.requests_made().await, 3);
    }
}

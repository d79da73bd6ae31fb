//! Retry policy for GitHub REST calls
//!
//! Only requests that are safe to repeat go through here: reads, and the
//! content-addressed blob/tree/commit creation. GitHub reports throttling in
//! three ways, all of which are waited out when the wait is short enough:
//! - 403 or 429 with `x-ratelimit-remaining: 0` and an `x-ratelimit-reset`
//!   epoch (primary limit)
//! - 403 or 429 with `retry-after` seconds (secondary limit)
//! - 429 with neither header, or any 5xx (backoff with jitter)

use reqwest::header::HeaderMap;
use reqwest::{Client, Request, Response, StatusCode};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Cap for computed backoff
    pub max_backoff: Duration,
    /// Longer rate-limit waits are not attempted; the error goes to the caller
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            max_rate_limit_wait: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    Done,
    RetryAfter(Duration),
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Wait requested by GitHub's rate-limit headers, if any
fn rate_limit_wait(headers: &HeaderMap, now_epoch: u64) -> Option<Duration> {
    if let Some(secs) = header_u64(headers, "retry-after") {
        return Some(Duration::from_secs(secs));
    }
    if header_u64(headers, "x-ratelimit-remaining") == Some(0) {
        let reset = header_u64(headers, "x-ratelimit-reset")?;
        // One extra second so the window has really rolled over
        return Some(Duration::from_secs(reset.saturating_sub(now_epoch) + 1));
    }
    None
}

fn backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let exp = policy.base_delay.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(policy.max_backoff);
    capped.mul_f64(1.0 + rand::random::<f64>() * 0.25)
}

/// Decide whether a response with `status`/`headers` is worth another try
pub fn verdict(
    status: StatusCode,
    headers: &HeaderMap,
    attempt: u32,
    policy: &RetryPolicy,
    now_epoch: u64,
) -> Verdict {
    if attempt >= policy.max_retries {
        return Verdict::Done;
    }
    let throttled = status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS;
    if throttled {
        if let Some(wait) = rate_limit_wait(headers, now_epoch) {
            return if wait <= policy.max_rate_limit_wait {
                Verdict::RetryAfter(wait)
            } else {
                Verdict::Done
            };
        }
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Verdict::RetryAfter(backoff(attempt, policy));
    }
    Verdict::Done
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Send `request`, retrying throttled and 5xx responses per `policy`.
///
/// Requests with streaming bodies can not be cloned and are sent once.
pub async fn send_with_retry(
    client: &Client,
    request: Request,
    policy: &RetryPolicy,
) -> Result<Response, reqwest::Error> {
    let mut attempt = 0;
    let mut pending = request;
    loop {
        let spare = pending.try_clone();
        let response = client.execute(pending).await?;
        let Some(next) = spare else {
            return Ok(response);
        };

        match verdict(response.status(), response.headers(), attempt, policy, now_epoch()) {
            Verdict::Done => return Ok(response),
            Verdict::RetryAfter(wait) => {
                tracing::debug!(
                    "[GITHUB] {} {} returned {}, retry {}/{} in {:?}",
                    next.method(),
                    next.url().path(),
                    response.status(),
                    attempt + 1,
                    policy.max_retries,
                    wait
                );
                tokio::time::sleep(wait).await;
            }
        }
        attempt += 1;
        pending = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_primary_rate_limit_waits_for_reset() {
        let policy = RetryPolicy::default();
        let h = headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "1030")]);
        assert_eq!(
            verdict(StatusCode::FORBIDDEN, &h, 0, &policy, 1000),
            Verdict::RetryAfter(Duration::from_secs(31))
        );

        // Reset too far away: hand the 403 back
        let far = headers(&[("x-ratelimit-remaining", "0"), ("x-ratelimit-reset", "4600")]);
        assert_eq!(verdict(StatusCode::FORBIDDEN, &far, 0, &policy, 1000), Verdict::Done);
    }

    #[test]
    fn test_secondary_rate_limit_uses_retry_after() {
        let policy = RetryPolicy::default();
        let h = headers(&[("retry-after", "7")]);
        assert_eq!(
            verdict(StatusCode::FORBIDDEN, &h, 1, &policy, 0),
            Verdict::RetryAfter(Duration::from_secs(7))
        );
        assert_eq!(
            verdict(StatusCode::TOO_MANY_REQUESTS, &h, 0, &policy, 0),
            Verdict::RetryAfter(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_plain_forbidden_and_client_errors_not_retried() {
        let policy = RetryPolicy::default();
        let none = HeaderMap::new();
        let remaining = headers(&[("x-ratelimit-remaining", "4999")]);
        assert_eq!(verdict(StatusCode::FORBIDDEN, &none, 0, &policy, 0), Verdict::Done);
        assert_eq!(verdict(StatusCode::FORBIDDEN, &remaining, 0, &policy, 0), Verdict::Done);
        for status in [StatusCode::OK, StatusCode::NOT_FOUND, StatusCode::UNPROCESSABLE_ENTITY] {
            assert_eq!(verdict(status, &none, 0, &policy, 0), Verdict::Done);
        }
    }

    #[test]
    fn test_server_errors_back_off_until_budget_spent() {
        let policy = RetryPolicy::default();
        let none = HeaderMap::new();
        for attempt in 0..policy.max_retries {
            match verdict(StatusCode::BAD_GATEWAY, &none, attempt, &policy, 0) {
                Verdict::RetryAfter(wait) => {
                    assert!(wait >= policy.base_delay);
                    assert!(wait <= policy.max_backoff.mul_f64(1.25));
                }
                Verdict::Done => panic!("attempt {} should retry", attempt),
            }
        }
        assert_eq!(
            verdict(StatusCode::BAD_GATEWAY, &none, policy.max_retries, &policy, 0),
            Verdict::Done
        );
    }
}

use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

/// `base * 2^attempt`, capped at `max`.
#[inline]
#[must_use]
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let shift = attempt.min(20);
    let multiplier = 1_u32 << shift;
    base.saturating_mul(multiplier).min(max)
}

/// Server-suggested delay: the body's `error.details[].retryDelay` when
/// present, else the `Retry-After` header. Capped at `max`.
#[must_use]
pub fn server_retry_delay(headers: &http::HeaderMap, body: &str, max: Duration) -> Option<Duration> {
    parse_body_retry_delay(body)
        .or_else(|| parse_retry_after_delay(headers))
        .map(|delay| delay.min(max))
}

#[inline]
pub(crate) fn parse_retry_after_delay(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let target = httpdate::parse_http_date(raw).ok()?;
    Some(target.duration_since(SystemTime::now()).unwrap_or_default())
}

/// The largest `retryDelay` found under `error.details[]`.
pub(crate) fn parse_body_retry_delay(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body.trim()).ok()?;
    let details = value.get("error")?.get("details")?.as_array()?;
    details
        .iter()
        .filter_map(|detail| detail.get("retryDelay")?.as_str())
        .filter_map(parse_duration_string)
        .max()
}

/// Parse Google-style durations: `"5s"`, `"1.5s"`, `"200ms"`, `"1m30s"`.
/// A bare number is seconds.
pub(crate) fn parse_duration_string(raw: &str) -> Option<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<f64>() {
        return (secs.is_finite() && secs > 0.0).then(|| secs_to_duration(secs));
    }

    let mut total_ms = 0.0_f64;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if number.is_empty() {
            return None;
        }
        let value: f64 = number.parse().ok()?;

        let mut unit = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphabetic() {
                unit.push(c);
                chars.next();
            } else {
                break;
            }
        }
        total_ms += match unit.as_str() {
            "h" => value * 3_600_000.0,
            "m" => value * 60_000.0,
            "s" | "" => value * 1_000.0,
            "ms" => value,
            _ => return None,
        };
    }

    (total_ms.is_finite() && total_ms > 0.0).then(|| secs_to_duration(total_ms / 1_000.0))
}

/// Values too large for `Duration` saturate; callers cap them.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

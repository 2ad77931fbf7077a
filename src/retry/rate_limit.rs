//! Rate-limit delay strategy driven by the `Retry-After` header.

use std::time::{Duration, SystemTime};

use http::StatusCode;

use crate::error::Error;
use crate::introspect::{Meta, MetaKind};
use crate::response::Response;
use crate::retry::DelayStrategy;

/// Waits out a 429's `Retry-After` hint.
///
/// Accepts both delta-seconds and HTTP-date forms. Returns `None` for any
/// other status or a missing/unparseable header, letting the next strategy
/// (typically exponential backoff) decide.
#[derive(Debug, Clone, Default)]
pub struct RetryAfter;

impl RetryAfter {
    /// Creates the strategy.
    pub fn new() -> Self {
        Self
    }
}

impl DelayStrategy for RetryAfter {
    fn delay(
        &self,
        response: Option<&Response>,
        _error: Option<&Error>,
        _attempt: u32,
    ) -> Option<Duration> {
        let response = response?;
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return None;
        }
        let value = response.header_str("retry-after")?.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Some(Duration::from_secs(seconds));
        }
        let instant = httpdate::parse_http_date(value).ok()?;
        Some(
            instant
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO),
        )
    }

    fn meta(&self) -> Meta {
        Meta::new("retry-after", MetaKind::Strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    use crate::response::Payload;

    fn resp(status: StatusCode, retry_after: Option<&'static str>) -> Response {
        let mut response = Response::new(status, Payload::Empty);
        if let Some(value) = retry_after {
            response = response
                .with_header(http::header::RETRY_AFTER, HeaderValue::from_static(value));
        }
        response
    }

    #[test]
    fn parses_delta_seconds() {
        let response = resp(StatusCode::TOO_MANY_REQUESTS, Some("2"));
        let delay = RetryAfter::new().delay(Some(&response), None, 0);
        assert_eq!(delay, Some(Duration::from_secs(2)));
    }

    #[test]
    fn parses_http_dates_in_the_past_as_zero() {
        let response = resp(
            StatusCode::TOO_MANY_REQUESTS,
            Some("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        let delay = RetryAfter::new().delay(Some(&response), None, 0);
        assert_eq!(delay, Some(Duration::ZERO));
    }

    #[test]
    fn defers_on_other_statuses_or_missing_header() {
        let other = resp(StatusCode::SERVICE_UNAVAILABLE, Some("2"));
        assert_eq!(RetryAfter::new().delay(Some(&other), None, 0), None);
        let missing = resp(StatusCode::TOO_MANY_REQUESTS, None);
        assert_eq!(RetryAfter::new().delay(Some(&missing), None, 0), None);
    }
}

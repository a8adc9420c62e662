//! Pure classification and state-transition logic for the fetch cycle.
//!
//! No I/O, no clock access beyond the `now` parameter callers pass in. This
//! keeps the five terminal outcomes (success, not-modified, stop, backoff,
//! parse-failure) testable without a database or a network.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::StatusCode;

use super::models::{Feed, FETCH_STATUS_STOPPED};

/// Base delay for the first backoff step.
pub const BASE_BACKOFF_MINUTES: i64 = 30;
/// Backoff never grows past this, regardless of how many failures precede it.
pub const MAX_BACKOFF_MINUTES: i64 = 12 * 60;
/// `consecutive_errors` at or above this value forces a permanent stop.
/// Shared between HTTP-backoff failures and parse failures (see
/// DESIGN.md for the Open Question about whether this coupling is intended).
pub const PARSE_FAILURE_STOP_THRESHOLD: i64 = 10;

/// Classification of an HTTP response status, per §4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    NotModified,
    Stop,
    Backoff,
    Unknown,
}

/// Maps a status code to its retry-policy class. `Unknown` is treated as
/// `Backoff` by the fetcher, but kept distinct here so the reason string can
/// note the surprising code.
pub fn classify_status(status: StatusCode) -> StatusClass {
    match status.as_u16() {
        200 => StatusClass::Ok,
        304 => StatusClass::NotModified,
        404 | 410 | 401 | 403 => StatusClass::Stop,
        429 => StatusClass::Backoff,
        s if (500..600).contains(&s) => StatusClass::Backoff,
        _ => StatusClass::Unknown,
    }
}

/// Delay before the next attempt, given the number of consecutive failures
/// that preceded the one currently being scheduled (i.e. the count BEFORE
/// this failure is added). Sequence: 30, 60, 120, 240, 480, 720 (capped).
pub fn backoff_delay_minutes(consecutive_errors_before: i64) -> i64 {
    let doublings = consecutive_errors_before.max(0).min(10);
    let delay = BASE_BACKOFF_MINUTES.saturating_mul(1i64 << doublings);
    delay.min(MAX_BACKOFF_MINUTES)
}

/// The five terminal outcomes a fetch attempt can resolve to.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// 200, parsed successfully.
    Success {
        interval_minutes: i64,
        etag: Option<String>,
        last_modified: Option<String>,
    },
    /// 304 in response to a conditional GET.
    NotModified { interval_minutes: i64 },
    /// 404/410/401/403, or an SSRF rejection. Terminal.
    Stop { reason: String },
    /// 429/5xx/unknown status, or a network-level error.
    Backoff { reason: String },
    /// Body did not parse as a recognizable feed, exceeded the size cap, or
    /// the item upsert call failed.
    ParseFailure { reason: String },
}

impl FetchOutcome {
    /// Short label matching `FetchLog::outcome`, for logging and the fetch
    /// log table.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success { .. } => "success",
            FetchOutcome::NotModified { .. } => "not_modified",
            FetchOutcome::Stop { .. } => "stop",
            FetchOutcome::Backoff { .. } => "backoff",
            FetchOutcome::ParseFailure { .. } => "parse_failure",
        }
    }
}

/// Computes the feed row that should be persisted after `outcome`, given the
/// snapshot read at the start of the cycle and the current time. Does not
/// mutate `feed`; returns a new value so the caller's snapshot stays
/// inspectable in logs/tests.
pub fn apply(feed: &Feed, outcome: FetchOutcome, now: DateTime<Utc>) -> Feed {
    let mut next = feed.clone();
    next.updated_at = now;

    match outcome {
        FetchOutcome::Success {
            interval_minutes,
            etag,
            last_modified,
        } => {
            next.consecutive_errors = 0;
            next.error_message = None;
            next.next_fetch_at = now + ChronoDuration::minutes(interval_minutes.max(1));
            if etag.is_some() {
                next.etag = etag;
            }
            if last_modified.is_some() {
                next.last_modified = last_modified;
            }
        }
        FetchOutcome::NotModified { interval_minutes } => {
            next.consecutive_errors = 0;
            next.error_message = None;
            next.next_fetch_at = now + ChronoDuration::minutes(interval_minutes.max(1));
            // etag/last_modified are deliberately untouched: a 304 carries no
            // validator update worth trusting over what we already have.
        }
        FetchOutcome::Stop { reason } => {
            next.fetch_status = FETCH_STATUS_STOPPED.to_string();
            next.error_message = Some(reason);
            // next_fetch_at is not advanced; fetch_status is the sole gate.
        }
        FetchOutcome::Backoff { reason } => {
            let delay = backoff_delay_minutes(feed.consecutive_errors);
            next.consecutive_errors = feed.consecutive_errors + 1;
            next.error_message = Some(reason);
            next.next_fetch_at = now + ChronoDuration::minutes(delay);
        }
        FetchOutcome::ParseFailure { reason } => {
            let new_count = feed.consecutive_errors + 1;
            next.consecutive_errors = new_count;
            next.error_message = Some(reason);
            if new_count >= PARSE_FAILURE_STOP_THRESHOLD {
                next.fetch_status = FETCH_STATUS_STOPPED.to_string();
            } else {
                let delay = backoff_delay_minutes(feed.consecutive_errors);
                next.next_fetch_at = now + ChronoDuration::minutes(delay);
            }
        }
    }

    next
}

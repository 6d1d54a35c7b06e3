//! Request statistics.
//!
//! Every request a simulated user completes is handed to [`Stats`], which
//! keeps one [`StatsEntry`] per `(method, name)` pair plus an aggregate of all
//! of them, and counts failures by their error text. The user never reads any
//! of this back, the harness does when it logs progress and builds the final
//! [`Report`].
//!
//! ## Metrics
//!
//! `requests_sent`: Total number of requests completed, successful or not
//! `request_ok`: Successful requests, labelled by `status_code`
//! `request_failure`: Failed requests, labelled by `error`
//! `bytes_written`: Total request body bytes sent
//! `request_latency_seconds`: Histogram of response times
//!

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Percentiles shown in reports, as fractions.
pub const PERCENTILES: [f64; 11] = [
    0.50, 0.66, 0.75, 0.80, 0.90, 0.95, 0.98, 0.99, 0.999, 0.9999, 1.0,
];

/// Column headings for [`PERCENTILES`].
const PERCENTILE_LABELS: [&str; 11] = [
    "50%", "66%", "75%", "80%", "90%", "95%", "98%", "99%", "99.9%", "99.99%", "100%",
];

/// Name given to the entry that aggregates every request.
pub const AGGREGATED: &str = "Aggregated";

/// Seconds at the tail of the run left out of the current-rps window, they
/// are likely still filling up.
const CURRENT_RPS_LAG_SECS: u64 = 2;
/// Width of the current-rps window, in seconds.
const CURRENT_RPS_WINDOW_SECS: u64 = 10;

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The target answered with a status below 400.
    Success {
        /// HTTP status code of the response.
        status: u16,
    },
    /// The client failed or the target answered with a status of 400 or
    /// above.
    Failure {
        /// HTTP status code of the response, if one arrived.
        status: Option<u16>,
        /// Human readable description, used to group failures.
        error: String,
    },
}

impl Outcome {
    /// Classify a response status.
    #[must_use]
    pub fn from_status(status: http::StatusCode) -> Self {
        if status.is_client_error() || status.is_server_error() {
            Self::Failure {
                status: Some(status.as_u16()),
                error: format!("HTTP {status}"),
            }
        } else {
            Self::Success {
                status: status.as_u16(),
            }
        }
    }

    /// Whether the request counts as a failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }
}

/// One completed request, as reported by a simulated user.
#[derive(Debug, Clone)]
pub struct Record<'a> {
    /// HTTP method of the request.
    pub method: &'a str,
    /// Name the request is grouped under, usually its path.
    pub name: &'a str,
    /// Time from sending the request to reading the full response.
    pub response_time: Duration,
    /// Bytes in the request body.
    pub request_length: u64,
    /// Bytes in the response body.
    pub content_length: u64,
    /// How the request ended.
    pub outcome: Outcome,
}

/// Round a response time, in milliseconds, into its histogram bucket.
///
/// Precision drops as times grow: exact below 100ms, then to the nearest 10,
/// 100 and 1000 milliseconds.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn round_response_time(millis: f64) -> u64 {
    let millis = millis.max(0.0);
    let rounded = if millis < 100.0 {
        millis.round()
    } else if millis < 1_000.0 {
        (millis / 10.0).round() * 10.0
    } else if millis < 10_000.0 {
        (millis / 100.0).round() * 100.0
    } else {
        (millis / 1_000.0).round() * 1_000.0
    };
    rounded as u64
}

/// Statistics for one `(method, name)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsEntry {
    num_requests: u64,
    num_failures: u64,
    /// Sum of response times, milliseconds.
    total_response_time: f64,
    min_response_time: Option<f64>,
    max_response_time: f64,
    /// Rounded response time to number of requests.
    response_times: BTreeMap<u64, u64>,
    /// Second since the start of the run to requests completed in it.
    num_reqs_per_sec: BTreeMap<u64, u64>,
    num_fail_per_sec: BTreeMap<u64, u64>,
    total_content_length: u64,
    first_request: Option<Duration>,
    last_request: Option<Duration>,
}

impl StatsEntry {
    /// Record a completed request that took `response_time_ms` and finished
    /// `at` into the run.
    pub fn log(&mut self, response_time_ms: f64, content_length: u64, at: Duration) {
        self.num_requests += 1;
        *self.num_reqs_per_sec.entry(at.as_secs()).or_default() += 1;
        self.first_request = Some(self.first_request.map_or(at, |first| first.min(at)));
        self.last_request = Some(self.last_request.map_or(at, |last| last.max(at)));

        self.total_response_time += response_time_ms;
        self.min_response_time = Some(
            self.min_response_time
                .map_or(response_time_ms, |min| min.min(response_time_ms)),
        );
        self.max_response_time = self.max_response_time.max(response_time_ms);
        *self
            .response_times
            .entry(round_response_time(response_time_ms))
            .or_default() += 1;

        self.total_content_length += content_length;
    }

    /// Mark the most recent request finishing `at` into the run as failed.
    pub fn log_error(&mut self, at: Duration) {
        self.num_failures += 1;
        *self.num_fail_per_sec.entry(at.as_secs()).or_default() += 1;
    }

    /// Fold `other` into this entry.
    pub fn extend(&mut self, other: &StatsEntry) {
        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_time += other.total_response_time;
        self.min_response_time = match (self.min_response_time, other.min_response_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_response_time = self.max_response_time.max(other.max_response_time);
        for (bucket, count) in &other.response_times {
            *self.response_times.entry(*bucket).or_default() += count;
        }
        for (sec, count) in &other.num_reqs_per_sec {
            *self.num_reqs_per_sec.entry(*sec).or_default() += count;
        }
        for (sec, count) in &other.num_fail_per_sec {
            *self.num_fail_per_sec.entry(*sec).or_default() += count;
        }
        self.total_content_length += other.total_content_length;
        self.first_request = match (self.first_request, other.first_request) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_request = match (self.last_request, other.last_request) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Requests recorded, failed ones included.
    #[must_use]
    pub fn num_requests(&self) -> u64 {
        self.num_requests
    }

    /// Failed requests recorded.
    #[must_use]
    pub fn num_failures(&self) -> u64 {
        self.num_failures
    }

    /// Mean response time in milliseconds, zero without requests.
    #[must_use]
    pub fn avg_response_time(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_response_time / self.num_requests as f64
        }
    }

    /// Fastest response time in milliseconds, zero without requests.
    #[must_use]
    pub fn min_response_time(&self) -> f64 {
        self.min_response_time.unwrap_or(0.0)
    }

    /// Slowest response time in milliseconds.
    #[must_use]
    pub fn max_response_time(&self) -> f64 {
        self.max_response_time
    }

    /// Median of the rounded response times.
    #[must_use]
    pub fn median_response_time(&self) -> u64 {
        self.percentile(0.5)
    }

    /// Rounded response time under which `percent` of requests fall, `percent`
    /// being a fraction in `[0, 1]`. Zero without requests.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn percentile(&self, percent: f64) -> u64 {
        if self.num_requests == 0 {
            return 0;
        }
        let wanted = (self.num_requests as f64 * percent.clamp(0.0, 1.0)) as u64;
        let mut processed = 0;
        for (bucket, count) in self.response_times.iter().rev() {
            processed += count;
            if self.num_requests - processed <= wanted {
                return *bucket;
            }
        }
        0
    }

    /// Share of requests that failed, zero without requests.
    #[must_use]
    pub fn fail_ratio(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.num_failures as f64 / self.num_requests as f64
        }
    }

    /// Mean response body length in bytes.
    #[must_use]
    pub fn avg_content_length(&self) -> f64 {
        if self.num_requests == 0 {
            0.0
        } else {
            self.total_content_length as f64 / self.num_requests as f64
        }
    }

    /// Requests per second over a run lasting `elapsed`.
    #[must_use]
    pub fn total_rps(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.num_requests as f64 / secs
        } else {
            0.0
        }
    }

    /// Failures per second over a run lasting `elapsed`.
    #[must_use]
    pub fn total_fail_per_sec(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.num_failures as f64 / secs
        } else {
            0.0
        }
    }

    /// Requests per second over the trailing window that ends a couple of
    /// seconds before the latest request. Zero until the run is long enough
    /// to fill any of the window.
    #[must_use]
    pub fn current_rps(&self) -> f64 {
        let (Some(first), Some(last)) = (self.first_request, self.last_request) else {
            return 0.0;
        };
        let last = last.as_secs();
        let end = last.saturating_sub(CURRENT_RPS_LAG_SECS);
        let start = last
            .saturating_sub(CURRENT_RPS_LAG_SECS + CURRENT_RPS_WINDOW_SECS)
            .max(first.as_secs());
        if end <= start {
            return 0.0;
        }
        let requests: u64 = self.num_reqs_per_sec.range(start..end).map(|(_, c)| c).sum();
        requests as f64 / (end - start) as f64
    }

    fn report(&self, method: &str, name: &str, elapsed: Duration) -> EntryReport {
        EntryReport {
            method: method.to_string(),
            name: name.to_string(),
            requests: self.num_requests,
            failures: self.num_failures,
            average_ms: self.avg_response_time(),
            min_ms: self.min_response_time(),
            max_ms: self.max_response_time(),
            median_ms: self.median_response_time(),
            average_content_length: self.avg_content_length(),
            requests_per_second: self.total_rps(elapsed),
            failures_per_second: self.total_fail_per_sec(elapsed),
            fail_ratio: self.fail_ratio(),
            percentiles: PERCENTILES
                .iter()
                .map(|p| PercentileReport {
                    percentile: *p,
                    millis: self.percentile(*p),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct EntryKey {
    name: String,
    method: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ErrorKey {
    method: String,
    name: String,
    error: String,
}

/// Every [`StatsEntry`] of a run plus the aggregate and the error tally.
#[derive(Debug, Default)]
pub struct RequestStats {
    entries: FxHashMap<EntryKey, StatsEntry>,
    errors: FxHashMap<ErrorKey, u64>,
    total: StatsEntry,
}

impl RequestStats {
    /// Record `record` as finishing `at` into the run.
    pub fn log_request(&mut self, record: &Record<'_>, at: Duration) {
        let millis = record.response_time.as_secs_f64() * 1_000.0;
        let key = EntryKey {
            name: record.name.to_string(),
            method: record.method.to_string(),
        };
        let entry = self.entries.entry(key).or_default();
        entry.log(millis, record.content_length, at);
        self.total.log(millis, record.content_length, at);

        if let Outcome::Failure { error, .. } = &record.outcome {
            entry.log_error(at);
            self.total.log_error(at);
            *self
                .errors
                .entry(ErrorKey {
                    method: record.method.to_string(),
                    name: record.name.to_string(),
                    error: error.clone(),
                })
                .or_default() += 1;
        }
    }

    /// The entry for `method` and `name`, if any request was recorded for it.
    #[must_use]
    pub fn entry(&self, method: &str, name: &str) -> Option<&StatsEntry> {
        self.entries.get(&EntryKey {
            name: name.to_string(),
            method: method.to_string(),
        })
    }

    /// The aggregate of every entry.
    #[must_use]
    pub fn total(&self) -> &StatsEntry {
        &self.total
    }

    /// Build a report of a run with `users` users lasting `elapsed`.
    #[must_use]
    pub fn report(&self, users: u32, elapsed: Duration) -> Report {
        let mut keys: Vec<&EntryKey> = self.entries.keys().collect();
        keys.sort();
        let entries = keys
            .into_iter()
            .filter_map(|key| {
                self.entries
                    .get(key)
                    .map(|entry| entry.report(&key.method, &key.name, elapsed))
            })
            .collect();

        let mut errors: Vec<ErrorReport> = self
            .errors
            .iter()
            .map(|(key, occurrences)| ErrorReport {
                method: key.method.clone(),
                name: key.name.clone(),
                error: key.error.clone(),
                occurrences: *occurrences,
            })
            .collect();
        errors.sort_by(|a, b| {
            b.occurrences
                .cmp(&a.occurrences)
                .then_with(|| a.error.cmp(&b.error))
        });

        Report {
            users,
            duration_seconds: elapsed.as_secs_f64(),
            entries,
            total: self.total.report("", AGGREGATED, elapsed),
            errors,
        }
    }
}

/// Shared handle through which simulated users record their requests.
#[derive(Debug, Clone)]
pub struct Stats {
    inner: Arc<Mutex<RequestStats>>,
    start: Instant,
    labels: Vec<(String, String)>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Stats {
    /// Create a new, empty, `Stats`. `labels` are attached to every metric
    /// emitted.
    #[must_use]
    pub fn new(labels: Vec<(String, String)>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RequestStats::default())),
            start: Instant::now(),
            labels,
        }
    }

    fn lock(&self) -> MutexGuard<'_, RequestStats> {
        // A panic while holding the lock leaves counters that are still
        // meaningful, keep using them.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since this `Stats` was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record one completed request.
    pub fn record(&self, record: &Record<'_>) {
        let mut labels = self.labels.clone();
        labels.push(("method".to_string(), record.method.to_string()));
        labels.push(("name".to_string(), record.name.to_string()));

        counter!("requests_sent", &labels).increment(1);
        counter!("bytes_written", &labels).increment(record.request_length);
        histogram!("request_latency_seconds", &labels).record(record.response_time.as_secs_f64());
        match &record.outcome {
            Outcome::Success { status } => {
                labels.push(("status_code".to_string(), status.to_string()));
                counter!("request_ok", &labels).increment(1);
            }
            Outcome::Failure { error, .. } => {
                labels.push(("error".to_string(), error.clone()));
                counter!("request_failure", &labels).increment(1);
            }
        }

        let at = self.elapsed();
        self.lock().log_request(record, at);
    }

    /// A copy of the aggregate entry.
    #[must_use]
    pub fn total(&self) -> StatsEntry {
        self.lock().total().clone()
    }

    /// A copy of the entry for `method` and `name`.
    #[must_use]
    pub fn entry(&self, method: &str, name: &str) -> Option<StatsEntry> {
        self.lock().entry(method, name).cloned()
    }

    /// Build a report of the run so far, ran with `users` users.
    #[must_use]
    pub fn report(&self, users: u32) -> Report {
        let elapsed = self.elapsed();
        self.lock().report(users, elapsed)
    }
}

/// One percentile of an [`EntryReport`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileReport {
    /// The percentile, as a fraction.
    pub percentile: f64,
    /// Rounded response time, milliseconds.
    pub millis: u64,
}

/// Serializable summary of one [`StatsEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryReport {
    /// HTTP method, empty for the aggregate.
    pub method: String,
    /// Request name.
    pub name: String,
    /// Requests recorded.
    pub requests: u64,
    /// Failed requests recorded.
    pub failures: u64,
    /// Mean response time, milliseconds.
    pub average_ms: f64,
    /// Fastest response time, milliseconds.
    pub min_ms: f64,
    /// Slowest response time, milliseconds.
    pub max_ms: f64,
    /// Median rounded response time, milliseconds.
    pub median_ms: u64,
    /// Mean response body length, bytes.
    pub average_content_length: f64,
    /// Requests per second over the run.
    pub requests_per_second: f64,
    /// Failures per second over the run.
    pub failures_per_second: f64,
    /// Share of failed requests.
    pub fail_ratio: f64,
    /// Response time percentiles, see [`PERCENTILES`].
    pub percentiles: Vec<PercentileReport>,
}

/// Serializable tally of one kind of failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// HTTP method of the failed requests.
    pub method: String,
    /// Name of the failed requests.
    pub name: String,
    /// Failure description.
    pub error: String,
    /// Times this failure happened.
    pub occurrences: u64,
}

/// The summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Users that took part in the run.
    pub users: u32,
    /// Length of the run, seconds.
    pub duration_seconds: f64,
    /// One report per `(method, name)`, ordered by name then method.
    pub entries: Vec<EntryReport>,
    /// The aggregate of every entry.
    pub total: EntryReport,
    /// Failures, most frequent first.
    pub errors: Vec<ErrorReport>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<8} {:<24} {:>8} {:>12} | {:>8} {:>8} {:>8} {:>8} | {:>8} {:>10}",
            "Type",
            "Name",
            "# reqs",
            "# fails",
            "Avg",
            "Min",
            "Max",
            "Med",
            "req/s",
            "failures/s"
        )?;
        for entry in self.entries.iter().chain(std::iter::once(&self.total)) {
            writeln!(
                f,
                "{:<8} {:<24} {:>8} {:>5}({:>5.2}%) | {:>8.0} {:>8.0} {:>8.0} {:>8} | {:>8.2} {:>10.2}",
                entry.method,
                entry.name,
                entry.requests,
                entry.failures,
                entry.fail_ratio * 100.0,
                entry.average_ms,
                entry.min_ms,
                entry.max_ms,
                entry.median_ms,
                entry.requests_per_second,
                entry.failures_per_second,
            )?;
        }

        writeln!(f)?;
        writeln!(f, "Response time percentiles (approximated)")?;
        write!(f, "{:<8} {:<24}", "Type", "Name")?;
        for label in PERCENTILE_LABELS {
            write!(f, " {label:>7}")?;
        }
        writeln!(f, " {:>8}", "# reqs")?;
        for entry in self.entries.iter().chain(std::iter::once(&self.total)) {
            write!(f, "{:<8} {:<24}", entry.method, entry.name)?;
            for p in &entry.percentiles {
                write!(f, " {:>7}", p.millis)?;
            }
            writeln!(f, " {:>8}", entry.requests)?;
        }

        if !self.errors.is_empty() {
            writeln!(f)?;
            writeln!(f, "Error report")?;
            writeln!(f, "{:>13}  Error", "# occurrences")?;
            for error in &self.errors {
                writeln!(
                    f,
                    "{:>13}  {} {}: {}",
                    error.occurrences, error.method, error.name, error.error
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use proptest::prelude::*;

    use super::*;

    fn record(millis: u64, outcome: Outcome) -> Record<'static> {
        Record {
            method: "POST",
            name: "/ingest",
            response_time: Duration::from_millis(millis),
            request_length: 80,
            content_length: 3,
            outcome,
        }
    }

    fn ok() -> Outcome {
        Outcome::Success { status: 200 }
    }

    #[test]
    fn rounds_into_coarser_buckets() {
        assert_eq!(round_response_time(0.4), 0);
        assert_eq!(round_response_time(42.6), 43);
        assert_eq!(round_response_time(147.0), 150);
        assert_eq!(round_response_time(3_432.0), 3_400);
        assert_eq!(round_response_time(58_760.0), 59_000);
        assert_eq!(round_response_time(-3.0), 0);
    }

    #[test]
    fn percentiles_walk_the_histogram() {
        let mut entry = StatsEntry::default();
        for millis in 1..=100 {
            entry.log(f64::from(millis), 0, Duration::ZERO);
        }
        assert_eq!(entry.percentile(0.0), 1);
        assert_eq!(entry.median_response_time(), 51);
        assert_eq!(entry.percentile(0.9), 91);
        assert_eq!(entry.percentile(1.0), 100);
        assert!((entry.avg_response_time() - 50.5).abs() < f64::EPSILON);
        assert!((entry.min_response_time() - 1.0).abs() < f64::EPSILON);
        assert!((entry.max_response_time() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_entry_reports_zeroes() {
        let entry = StatsEntry::default();
        assert_eq!(entry.percentile(0.5), 0);
        assert!(entry.avg_response_time().abs() < f64::EPSILON);
        assert!(entry.fail_ratio().abs() < f64::EPSILON);
        assert!(entry.current_rps().abs() < f64::EPSILON);
        assert!(entry.total_rps(Duration::ZERO).abs() < f64::EPSILON);
    }

    #[test]
    fn current_rps_skips_the_last_seconds() {
        let mut entry = StatsEntry::default();
        for sec in 0..20 {
            for _ in 0..5 {
                entry.log(1.0, 0, Duration::from_secs(sec));
            }
        }
        // Window is [7, 17): ten full seconds of five requests.
        assert!((entry.current_rps() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failures_are_counted_and_grouped() {
        let mut stats = RequestStats::default();
        let at = Duration::from_millis(1_500);
        stats.log_request(&record(10, ok()), at);
        stats.log_request(
            &record(
                12,
                Outcome::from_status(http::StatusCode::INTERNAL_SERVER_ERROR),
            ),
            at,
        );
        stats.log_request(
            &record(
                14,
                Outcome::from_status(http::StatusCode::INTERNAL_SERVER_ERROR),
            ),
            at,
        );

        let entry = stats.entry("POST", "/ingest").expect("entry exists");
        assert_eq!(entry.num_requests(), 3);
        assert_eq!(entry.num_failures(), 2);
        assert_eq!(stats.total().num_failures(), 2);

        let report = stats.report(1, Duration::from_secs(2));
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.total.name, AGGREGATED);
        assert_eq!(report.total.requests, 3);
        assert!((report.total.requests_per_second - 1.5).abs() < f64::EPSILON);
        assert_eq!(
            report.errors,
            vec![ErrorReport {
                method: "POST".to_string(),
                name: "/ingest".to_string(),
                error: "HTTP 500 Internal Server Error".to_string(),
                occurrences: 2,
            }]
        );
    }

    #[test]
    fn status_classification() {
        assert!(!Outcome::from_status(http::StatusCode::OK).is_failure());
        assert!(!Outcome::from_status(http::StatusCode::MOVED_PERMANENTLY).is_failure());
        assert!(Outcome::from_status(http::StatusCode::NOT_FOUND).is_failure());
        assert!(Outcome::from_status(http::StatusCode::SERVICE_UNAVAILABLE).is_failure());
    }

    #[test]
    fn report_renders_every_section() {
        let stats = Stats::default();
        stats.record(&record(5, ok()));
        stats.record(&record(
            7,
            Outcome::Failure {
                status: None,
                error: "connection refused".to_string(),
            },
        ));
        let rendered = stats.report(2).to_string();
        assert!(rendered.contains("/ingest"));
        assert!(rendered.contains(AGGREGATED));
        assert!(rendered.contains("Response time percentiles"));
        assert!(rendered.contains("99.99%"));
        assert!(rendered.contains("connection refused"));

        let json = serde_json::to_string(&stats.report(2)).expect("serializes");
        let back: Report = serde_json::from_str(&json).expect("deserializes");
        assert_eq!(back.users, 2);
        assert_eq!(back.total.failures, 1);
    }

    #[test]
    fn record_emits_metrics() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let stats = Stats::default();

        metrics::with_local_recorder(&recorder, || {
            stats.record(&record(5, ok()));
            stats.record(&record(
                5,
                Outcome::from_status(http::StatusCode::BAD_GATEWAY),
            ));
        });

        let mut sent = 0;
        let mut ok_count = 0;
        let mut failed = 0;
        for (key, _, _, value) in snapshotter.snapshot().into_vec() {
            if let DebugValue::Counter(count) = value {
                match key.key().name() {
                    "requests_sent" => sent += count,
                    "request_ok" => ok_count += count,
                    "request_failure" => failed += count,
                    _ => {}
                }
            }
        }
        assert_eq!((sent, ok_count, failed), (2, 1, 1));
    }

    proptest! {
        #[test]
        fn extend_matches_logging_into_one_entry(
            times in proptest::collection::vec(0.0..20_000.0f64, 0..64),
            split in 0..64usize,
        ) {
            let split = split.min(times.len());
            let mut left = StatsEntry::default();
            let mut right = StatsEntry::default();
            let mut whole = StatsEntry::default();
            for (idx, t) in times.iter().enumerate() {
                let at = Duration::from_millis(idx as u64 * 100);
                whole.log(*t, 1, at);
                if idx < split { left.log(*t, 1, at) } else { right.log(*t, 1, at) }
            }
            left.extend(&right);
            prop_assert_eq!(left.num_requests(), whole.num_requests());
            for p in PERCENTILES {
                prop_assert_eq!(left.percentile(p), whole.percentile(p));
            }
            prop_assert_eq!(left.min_response_time(), whole.min_response_time());
            prop_assert_eq!(left.max_response_time(), whole.max_response_time());
        }

        #[test]
        fn percentiles_are_monotonic(times in proptest::collection::vec(0.0..60_000.0f64, 1..128)) {
            let mut entry = StatsEntry::default();
            for t in &times {
                entry.log(*t, 0, Duration::ZERO);
            }
            let mut previous = 0;
            for p in PERCENTILES {
                let value = entry.percentile(p);
                prop_assert!(value >= previous);
                previous = value;
            }
            prop_assert_eq!(entry.percentile(1.0), round_response_time(entry.max_response_time()));
        }
    }
}

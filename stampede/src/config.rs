//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.
use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf, time::Duration};

use http::{HeaderMap, Uri};
use rustc_hash::FxHashMap;
use serde::Deserialize;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// The payload section is invalid.
    #[error("Invalid payload: {0}")]
    Payload(#[from] stampede_payload::Error),
    /// The wait time section is invalid.
    #[error("Invalid wait time: {0}")]
    WaitTime(#[from] stampede_throttle::Error),
    /// The spawn rate is zero, negative or not finite.
    #[error("spawn_rate must be positive and finite, got {0}")]
    SpawnRate(f64),
    /// The scenario path is not absolute.
    #[error("scenario path must start with '/', got {0:?}")]
    Path(String),
    /// The target URI lacks a scheme or an authority.
    #[error("target_uri must be absolute, got {0}")]
    TargetUri(Uri),
    /// The joined request URI does not parse.
    #[error("Failed to build request URI: {0}")]
    RequestUri(#[from] http::uri::InvalidUri),
}

fn default_target_uri() -> Uri {
    Uri::from_static("http://127.0.0.1:8080")
}

fn default_users() -> NonZeroU32 {
    NonZeroU32::MIN
}

fn default_spawn_rate() -> f64 {
    1.0
}

fn default_path() -> String {
    "/ingest".to_string()
}

fn default_log_interval() -> u64 {
    2
}

fn default_exit_code_on_error() -> i32 {
    1
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URI of the target, the scenario path is joined onto it.
    #[serde(with = "http_serde::uri", default = "default_target_uri")]
    pub target_uri: Uri,
    /// Number of simulated users once ramp-up completes.
    #[serde(default = "default_users")]
    pub users: NonZeroU32,
    /// Users started per second during ramp-up.
    #[serde(default = "default_spawn_rate")]
    pub spawn_rate: f64,
    /// Seed for every random decision of the run. Runs with the same seed
    /// draw the same payloads and waits per user.
    pub seed: Option<[u8; 32]>,
    /// What each simulated user sends.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map_recursive")]
    pub scenario: Scenario,
    /// How long each simulated user pauses between requests.
    #[serde(default)]
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub wait_time: stampede_throttle::Config,
    /// Per-request timeout. Requests are not timed out when absent.
    pub request_timeout_millis: Option<u64>,
    /// Statistics logging and reporting.
    #[serde(default)]
    pub stats: StatsConfig,
    /// The method by which to express telemetry
    pub telemetry: Option<Telemetry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_uri: default_target_uri(),
            users: default_users(),
            spawn_rate: default_spawn_rate(),
            seed: None,
            scenario: Scenario::default(),
            wait_time: stampede_throttle::Config::default(),
            request_timeout_millis: None,
            stats: StatsConfig::default(),
            telemetry: None,
        }
    }
}

impl Config {
    /// Parse and validate a YAML configuration document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not deserialize or if
    /// [`Config::validate`] rejects it.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field constraints serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first problem found, see [`Error`].
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.spawn_rate.is_finite() && self.spawn_rate > 0.0) {
            return Err(Error::SpawnRate(self.spawn_rate));
        }
        if self.target_uri.scheme().is_none() || self.target_uri.authority().is_none() {
            return Err(Error::TargetUri(self.target_uri.clone()));
        }
        if !self.scenario.path.starts_with('/') {
            return Err(Error::Path(self.scenario.path.clone()));
        }
        stampede_payload::Payload::new(&self.scenario.payload)?;
        self.wait_time.validate()?;
        self.request_uri()?;
        Ok(())
    }

    /// The URI every simulated user posts to: the scenario path joined onto
    /// the target URI.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RequestUri`] if the joined URI does not parse.
    pub fn request_uri(&self) -> Result<Uri, Error> {
        let base = self.target_uri.to_string();
        let uri = format!("{}{}", base.trim_end_matches('/'), self.scenario.path);
        Ok(uri.parse()?)
    }

    /// The per-request timeout, if any.
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_millis.map(Duration::from_millis)
    }
}

/// The request each simulated user repeats.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Path posted to, relative to the target URI.
    #[serde(default = "default_path")]
    pub path: String,
    /// Name requests are grouped under in statistics. Defaults to the path.
    pub name: Option<String>,
    /// Headers added to every request.
    #[serde(default, with = "http_serde::header_map")]
    pub headers: HeaderMap,
    /// The body of every request.
    #[serde(default)]
    pub payload: stampede_payload::Config,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            path: default_path(),
            name: None,
            headers: HeaderMap::new(),
            payload: stampede_payload::Config::default(),
        }
    }
}

impl Scenario {
    /// Name requests are grouped under in statistics.
    #[must_use]
    pub fn request_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.path)
    }
}

/// Statistics logging and reporting.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StatsConfig {
    /// Seconds between progress log lines while the run is going. Zero
    /// disables them.
    #[serde(default = "default_log_interval")]
    pub log_interval_seconds: u64,
    /// Where to write the final report as JSON.
    pub report_path: Option<PathBuf>,
    /// Process exit code when any request failed.
    #[serde(default = "default_exit_code_on_error")]
    pub exit_code_on_error: i32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            log_interval_seconds: default_log_interval(),
            report_path: None,
            exit_code_on_error: default_exit_code_on_error(),
        }
    }
}

/// Defines the manner of metric exposition
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Telemetry {
    /// Address and port for prometheus exporter
    pub prometheus_addr: SocketAddr,
    /// Additional labels to include in every metric
    #[serde(default)]
    pub global_labels: FxHashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;
    use stampede_payload::ConfRange;

    use super::*;

    #[test]
    fn empty_document_is_the_default_scenario() {
        let config = Config::from_yaml("{}").expect("valid config");
        assert_eq!(config, Config::default());
        assert_eq!(
            config.request_uri().expect("joins"),
            Uri::from_static("http://127.0.0.1:8080/ingest")
        );
        assert_eq!(config.scenario.request_name(), "/ingest");
        assert_eq!(
            config.wait_time,
            stampede_throttle::Config::Between {
                min_millis: 1,
                max_millis: 5
            }
        );
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.stats.exit_code_on_error, 1);
    }

    #[test]
    fn config_deserializes() {
        let contents = r#"
target_uri: "http://ingest.local:9000/api/"
users: 25
spawn_rate: 5.0
request_timeout_millis: 250
wait_time:
  constant_throughput:
    tasks_per_second: 10.0
scenario:
  path: /ingest
  name: ingest
  headers:
    x-tenant: acme
  payload:
    telemetry:
      devices:
        inclusive:
          min: 1
          max: 10
stats:
  log_interval_seconds: 0
  report_path: /tmp/report.json
telemetry:
  prometheus_addr: "0.0.0.0:9000"
  global_labels:
    run: smoke
"#;
        let config = Config::from_yaml(contents).expect("valid config");

        assert_eq!(config.users.get(), 25);
        assert!((config.spawn_rate - 5.0).abs() < f64::EPSILON);
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(
            config.wait_time,
            stampede_throttle::Config::ConstantThroughput {
                tasks_per_second: 10.0
            }
        );
        assert_eq!(
            config.request_uri().expect("joins"),
            Uri::from_static("http://ingest.local:9000/api/ingest")
        );
        assert_eq!(config.scenario.request_name(), "ingest");
        assert_eq!(
            config.scenario.headers.get("x-tenant"),
            Some(&HeaderValue::from_static("acme"))
        );
        let stampede_payload::Config::Telemetry(payload) = config.scenario.payload;
        assert_eq!(payload.devices, ConfRange::Inclusive { min: 1, max: 10 });
        assert_eq!(
            config.stats.report_path,
            Some(PathBuf::from("/tmp/report.json"))
        );
        let telemetry = config.telemetry.expect("telemetry configured");
        assert_eq!(telemetry.prometheus_addr.port(), 9000);
        assert_eq!(
            telemetry.global_labels.get("run").map(String::as_str),
            Some("smoke")
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Config::from_yaml("userz: 3"),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn zero_users_are_rejected() {
        assert!(matches!(
            Config::from_yaml("users: 0"),
            Err(Error::SerdeYaml(_))
        ));
    }

    #[test]
    fn validation_errors() {
        assert!(matches!(
            Config::from_yaml("spawn_rate: 0.0"),
            Err(Error::SpawnRate(_))
        ));
        assert!(matches!(
            Config::from_yaml("scenario:\n  path: ingest"),
            Err(Error::Path(_))
        ));
        assert!(matches!(
            Config::from_yaml("target_uri: /relative"),
            Err(Error::TargetUri(_))
        ));
        assert!(matches!(
            Config::from_yaml("wait_time:\n  between:\n    min_millis: 9\n    max_millis: 1"),
            Err(Error::WaitTime(_))
        ));
        let inverted = r"
scenario:
  payload:
    telemetry:
      rps:
        inclusive:
          min: 150
          max: 50
";
        assert!(matches!(
            Config::from_yaml(inverted),
            Err(Error::Payload(_))
        ));
    }
}

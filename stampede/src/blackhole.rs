//! The ingest sink.
//!
//! A small HTTP server that speaks the target's ingest protocol: it accepts
//! telemetry samples on `POST /ingest`, answers `/health`, and reports on
//! `/stats` how many distinct devices it has seen. It stands in for the real
//! target in local runs and in tests, where `status` forces every ingest to
//! fail.
//!
//! Every accepted sample's `rps` joins a rolling window of that device's last
//! [`WINDOW_SIZE`] readings. Once the window is full, a reading more than
//! [`ANOMALY_Z_SCORE`] standard deviations from the window mean counts as an
//! anomaly.
//!
//! ## Metrics
//!
//! `bytes_received`: Total bytes received
//! `requests_received`: Total requests received
//! `service_rps_total`: Sum of the `rps` of every accepted sample
//! `service_anomalies_total`: Readings flagged as anomalous
//! `service_handle_latency_seconds`: Time spent handling each ingest
//!

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use stampede_payload::telemetry::Sample;
use stampede_signal::Watcher;
use tokio::{
    net::TcpListener,
    pin,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
    time,
};
use tracing::{debug, error, info, warn};

/// Readings kept per device.
pub const WINDOW_SIZE: usize = 50;
/// Distance from the window mean, in standard deviations, past which a
/// reading is anomalous.
pub const ANOMALY_Z_SCORE: f64 = 2.0;

fn default_concurrent_requests_max() -> usize {
    100
}

fn default_binding_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

/// Errors produced by [`Blackhole`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The configured status code was not valid.
    #[error("The configured status code was not valid: {0}")]
    InvalidStatusCode(#[from] http::status::InvalidStatusCode),
}

/// Configuration for [`Blackhole`].
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address and port to listen on.
    #[serde(default = "default_binding_addr")]
    pub binding_addr: SocketAddr,
    /// Connections served at once, further connections are shed.
    #[serde(default = "default_concurrent_requests_max")]
    pub concurrent_requests_max: usize,
    /// Answer every ingest with this status instead of processing it.
    pub status: Option<u16>,
    /// Delay before answering an ingest, in milliseconds.
    #[serde(default)]
    pub response_delay_millis: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binding_addr: default_binding_addr(),
            concurrent_requests_max: default_concurrent_requests_max(),
            status: None,
            response_delay_millis: 0,
        }
    }
}

/// A device's most recent readings with their running sums.
#[derive(Debug, Clone)]
struct Window {
    values: [f64; WINDOW_SIZE],
    sum: f64,
    sum_sq: f64,
    next: usize,
    len: usize,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            values: [0.0; WINDOW_SIZE],
            sum: 0.0,
            sum_sq: 0.0,
            next: 0,
            len: 0,
        }
    }
}

impl Window {
    /// Add `value`, evicting the oldest reading once full. Returns the mean
    /// and population standard deviation of the window including `value`.
    fn push(&mut self, value: f64) -> (f64, f64) {
        if self.len < WINDOW_SIZE {
            self.len += 1;
        } else {
            let evicted = self.values[self.next];
            self.sum -= evicted;
            self.sum_sq -= evicted * evicted;
        }
        self.values[self.next] = value;
        self.sum += value;
        self.sum_sq += value * value;
        self.next = (self.next + 1) % WINDOW_SIZE;

        let len = self.len as f64;
        let mean = self.sum / len;
        let std_dev = if self.len > 1 {
            // Running sums can drift a hair below zero.
            (self.sum_sq / len - mean * mean).max(0.0).sqrt()
        } else {
            0.0
        };
        (mean, std_dev)
    }

    fn is_full(&self) -> bool {
        self.len >= WINDOW_SIZE
    }
}

#[derive(Debug)]
struct State {
    windows: Mutex<FxHashMap<String, Window>>,
    status: Option<StatusCode>,
    response_delay: Duration,
    labels: Vec<(String, String)>,
}

impl State {
    fn new(status: Option<StatusCode>, response_delay: Duration) -> Self {
        Self {
            windows: Mutex::new(FxHashMap::default()),
            status,
            response_delay,
            labels: vec![("component".to_string(), "blackhole".to_string())],
        }
    }

    fn devices_tracked(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Feed `sample` into its device's window. Returns the reading's z-score
    /// when it is anomalous.
    fn analyze(&self, sample: &Sample) -> Option<f64> {
        counter!("service_rps_total", &self.labels).increment(u64::from(sample.rps));

        let rps = f64::from(sample.rps);
        let (z, judged) = {
            let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
            let window = windows.entry(sample.device.clone()).or_default();
            let (mean, std_dev) = window.push(rps);
            let z = if std_dev > 0.0 {
                (rps - mean) / std_dev
            } else {
                0.0
            };
            (z, window.is_full())
        };

        if judged && z.abs() > ANOMALY_Z_SCORE {
            counter!("service_anomalies_total", &self.labels).increment(1);
            debug!(device = %sample.device, rps = sample.rps, z, "Anomalous reading");
            Some(z)
        } else {
            None
        }
    }

    async fn ingest(
        &self,
        method: &Method,
        body: &[u8],
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let started = Instant::now();
        let response = self.handle_ingest(method, body).await;
        histogram!("service_handle_latency_seconds", &self.labels)
            .record(started.elapsed().as_secs_f64());
        response
    }

    async fn handle_ingest(
        &self,
        method: &Method,
        body: &[u8],
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if *method != Method::POST {
            return build_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
        }
        if !self.response_delay.is_zero() {
            time::sleep(self.response_delay).await;
        }
        if let Some(status) = self.status {
            return build_response(status, "ok\n");
        }

        match serde_json::from_slice::<Sample>(body) {
            Ok(sample) => {
                self.analyze(&sample);
                build_response(StatusCode::OK, "ok\n")
            }
            Err(e) => {
                debug!("Rejecting ingest payload: {e}");
                build_response(StatusCode::BAD_REQUEST, "bad payload\n")
            }
        }
    }
}

async fn srv(
    req: Request<Incoming>,
    state: Arc<State>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    counter!("requests_received", &state.labels).increment(1);

    let (parts, body) = req.into_parts();
    let bytes = body.collect().await?.to_bytes();
    counter!("bytes_received", &state.labels).increment(bytes.len() as u64);

    let response = match parts.uri.path() {
        "/ingest" => state.ingest(&parts.method, &bytes).await,
        "/health" => build_response(StatusCode::OK, "ok\n"),
        "/stats" => build_response(
            StatusCode::OK,
            format!("devices_tracked={}\n", state.devices_tracked()),
        ),
        _ => build_response(StatusCode::NOT_FOUND, "not found\n"),
    };
    Ok(response)
}

fn build_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(crate::full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// The ingest sink server.
#[derive(Debug)]
pub struct Blackhole {
    listener: TcpListener,
    local_addr: SocketAddr,
    concurrency_limit: usize,
    state: Arc<State>,
    shutdown: Watcher,
}

impl Blackhole {
    /// Bind a new `Blackhole` to `config.binding_addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the status is not a valid HTTP status or the
    /// address cannot be bound.
    pub async fn bind(config: Config, shutdown: Watcher) -> Result<Self, Error> {
        let status = config.status.map(StatusCode::from_u16).transpose()?;
        let listener = TcpListener::bind(config.binding_addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            concurrency_limit: config.concurrent_requests_max.max(1),
            state: Arc::new(State::new(
                status,
                Duration::from_millis(config.response_delay_millis),
            )),
            shutdown,
        })
    }

    /// The address this sink listens on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown signal fires, then close every open
    /// connection.
    ///
    /// # Errors
    ///
    /// None are known, accept failures are logged and skipped.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            listener,
            local_addr,
            concurrency_limit,
            state,
            shutdown,
        } = self;
        let sem = Arc::new(Semaphore::new(concurrency_limit));
        let mut join_set = JoinSet::new();

        info!("Ingest sink listening on {local_addr}");
        gauge!("connection.limit", &state.labels).set(concurrency_limit as f64);

        let shutdown_fut = shutdown.recv();
        pin!(shutdown_fut);
        loop {
            let claimed_permits = concurrency_limit - sem.available_permits();
            gauge!("connection.current", &state.labels).set(claimed_permits as f64);

            tokio::select! {
                () = &mut shutdown_fut => {
                    info!("Shutdown signal received, stopping accept loop.");
                    break;
                }

                incoming = listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok(sa) => sa,
                        Err(e) => {
                            error!("Error accepting connection: {e}");
                            continue;
                        }
                    };
                    debug!("Accepted connection from {addr}");

                    let sem = Arc::clone(&sem);
                    let state = Arc::clone(&state);

                    join_set.spawn(async move {
                        let permit = match sem.try_acquire() {
                            Ok(p) => p,
                            Err(TryAcquireError::Closed) => {
                                error!("Semaphore closed");
                                return;
                            }
                            Err(TryAcquireError::NoPermits) => {
                                warn!("Ingest sink over connection capacity, load shedding");
                                drop(stream);
                                return;
                            }
                        };

                        let service = service_fn(move |req| srv(req, Arc::clone(&state)));
                        let builder = auto::Builder::new(TokioExecutor::new());
                        let serve_future =
                            builder.serve_connection_with_upgrades(TokioIo::new(stream), service);

                        if let Err(e) = serve_future.await {
                            debug!("Error serving {addr}: {e}");
                        }
                        drop(permit);
                    });
                }
            }
        }

        drop(listener);
        // Keep-alive connections would hold the join below open indefinitely.
        join_set.abort_all();
        while join_set.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;
    use crate::user::{self, HttpClient};

    async fn start(config: Config) -> (SocketAddr, stampede_signal::Broadcaster) {
        let (watcher, broadcaster) = stampede_signal::signal();
        let sink = Blackhole::bind(config, watcher).await.expect("binds");
        let addr = sink.local_addr();
        tokio::spawn(sink.run());
        (addr, broadcaster)
    }

    async fn call(
        client: &HttpClient,
        method: Method,
        uri: String,
        body: &'static str,
    ) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(crate::full(body))
            .expect("valid request");
        let response = client.request(request).await.expect("sink answers");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (
            status,
            String::from_utf8(bytes.to_vec()).expect("utf-8 body"),
        )
    }

    const SAMPLE: &str = r#"{"device":"device-4","timestamp":1700000000,"cpu":12.5,"rps":90}"#;

    #[tokio::test]
    async fn ingest_routes() {
        let (addr, _shutdown) = start(Config::default()).await;
        let client = user::client();

        let ingest = format!("http://{addr}/ingest");
        assert_eq!(
            call(&client, Method::POST, ingest.clone(), SAMPLE).await,
            (StatusCode::OK, "ok\n".to_string())
        );
        assert_eq!(
            call(&client, Method::POST, ingest.clone(), SAMPLE).await,
            (StatusCode::OK, "ok\n".to_string())
        );
        assert_eq!(
            call(&client, Method::POST, ingest.clone(), "{not json").await,
            (StatusCode::BAD_REQUEST, "bad payload\n".to_string())
        );
        assert_eq!(
            call(&client, Method::GET, ingest, "").await,
            (
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed\n".to_string()
            )
        );
        assert_eq!(
            call(&client, Method::GET, format!("http://{addr}/health"), "").await,
            (StatusCode::OK, "ok\n".to_string())
        );
        assert_eq!(
            call(&client, Method::GET, format!("http://{addr}/stats"), "").await,
            (StatusCode::OK, "devices_tracked=1\n".to_string())
        );
        assert_eq!(
            call(&client, Method::GET, format!("http://{addr}/nope"), "")
                .await
                .0,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn status_override_fails_every_ingest() {
        let config = Config {
            status: Some(503),
            ..Config::default()
        };
        let (addr, _shutdown) = start(config).await;
        let client = user::client();

        let (status, _) = call(&client, Method::POST, format!("http://{addr}/ingest"), SAMPLE).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            call(&client, Method::GET, format!("http://{addr}/stats"), "").await,
            (StatusCode::OK, "devices_tracked=0\n".to_string())
        );
    }

    #[tokio::test]
    async fn invalid_status_is_rejected() {
        let (watcher, _broadcaster) = stampede_signal::signal();
        let config = Config {
            status: Some(1000),
            ..Config::default()
        };
        assert!(matches!(
            Blackhole::bind(config, watcher).await,
            Err(Error::InvalidStatusCode(_))
        ));
    }

    #[tokio::test]
    async fn run_returns_on_shutdown() {
        let (watcher, broadcaster) = stampede_signal::signal();
        let sink = Blackhole::bind(Config::default(), watcher)
            .await
            .expect("binds");
        let addr = sink.local_addr();
        let handle = tokio::spawn(sink.run());

        let client = user::client();
        let (status, _) = call(&client, Method::GET, format!("http://{addr}/health"), "").await;
        assert_eq!(status, StatusCode::OK);

        time::timeout(Duration::from_secs(5), broadcaster.signal_and_wait())
            .await
            .expect("sink acknowledges");
        time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sink stops")
            .expect("joins")
            .expect("clean exit");
    }

    fn reading(device: &str, rps: u32) -> Sample {
        Sample {
            device: device.to_string(),
            timestamp: 1_700_000_000,
            cpu: 40.0,
            rps,
        }
    }

    #[test]
    fn window_tracks_mean_and_deviation() {
        let mut window = Window::default();
        let (mean, std_dev) = window.push(10.0);
        assert!((mean - 10.0).abs() < 1e-9);
        assert!(std_dev.abs() < 1e-9);
        let (mean, std_dev) = window.push(20.0);
        assert!((mean - 15.0).abs() < 1e-9);
        assert!((std_dev - 5.0).abs() < 1e-9);

        // Once full, the oldest readings are evicted.
        for _ in 0..WINDOW_SIZE {
            window.push(7.0);
        }
        assert!(window.is_full());
        let (mean, std_dev) = window.push(7.0);
        assert!((mean - 7.0).abs() < 1e-9);
        assert!(std_dev < 1e-6);
    }

    #[test]
    fn spike_on_a_full_window_is_an_anomaly() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let state = State::new(None, Duration::ZERO);
        let mut rps_sum = 0;

        metrics::with_local_recorder(&recorder, || {
            // A young device's spike is not judged.
            for i in 0..10u32 {
                let rps = 99 + 2 * (i % 2);
                rps_sum += u64::from(rps);
                assert_eq!(state.analyze(&reading("device-2", rps)), None);
            }
            rps_sum += 150;
            assert_eq!(state.analyze(&reading("device-2", 150)), None);

            // Alternating 99 and 101 keeps every reading one deviation out.
            for i in 0..WINDOW_SIZE {
                let rps = 99 + 2 * u32::from(i % 2 == 1);
                rps_sum += u64::from(rps);
                assert_eq!(state.analyze(&reading("device-1", rps)), None);
            }
            rps_sum += 150;
            let z = state
                .analyze(&reading("device-1", 150))
                .expect("spike is anomalous");
            assert!(z > ANOMALY_Z_SCORE, "{z}");
        });

        assert_eq!(state.devices_tracked(), 2);
        let mut anomalies = 0;
        let mut rps_total = 0;
        for (key, _, _, value) in snapshotter.snapshot().into_vec() {
            if let DebugValue::Counter(count) = value {
                match key.key().name() {
                    "service_anomalies_total" => anomalies += count,
                    "service_rps_total" => rps_total += count,
                    _ => {}
                }
            }
        }
        assert_eq!(anomalies, 1);
        assert_eq!(rps_total, rps_sum);
    }

    #[tokio::test]
    async fn ingest_records_handle_latency() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let state = State::new(None, Duration::ZERO);

        let response = {
            let _guard = metrics::set_default_local_recorder(&recorder);
            state.ingest(&Method::POST, SAMPLE.as_bytes()).await
        };
        assert_eq!(response.status(), StatusCode::OK);

        let observed = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .find_map(|(key, _, _, value)| match value {
                DebugValue::Histogram(samples)
                    if key.key().name() == "service_handle_latency_seconds" =>
                {
                    Some(samples.len())
                }
                _ => None,
            });
        assert_eq!(observed, Some(1));
    }

    #[test]
    fn config_deserializes() {
        let config: Config = serde_yaml::from_str(
            "binding_addr: \"0.0.0.0:8080\"\nstatus: 500\nresponse_delay_millis: 5",
        )
        .expect("valid yaml");
        assert_eq!(
            config,
            Config {
                binding_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
                status: Some(500),
                response_delay_millis: 5,
                ..Config::default()
            }
        );
    }
}

//! The simulated user.
//!
//! A user loops forever: it waits out its think-time, builds a fresh payload
//! and posts it to the target. It keeps no results of its own. Every request,
//! failed or not, is handed to [`Stats`] and the user moves on to its next
//! turn. There is no retry and no backoff, a failure costs exactly one
//! request.
//!
//! The loop ends only when the user's shutdown [`Watcher`] fires, at which
//! point any request in flight is abandoned.

use std::time::Duration;

use bytes::Bytes;
use http::{
    HeaderMap, Method, Request, Uri,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rand::{Rng, rngs::StdRng};
use stampede_payload::{Payload, Serialize};
use stampede_signal::Watcher;
use stampede_throttle::{Clock, RealClock, Throttle};
use tokio::time::{self, Instant};
use tracing::debug;

use crate::{
    config::{self, Config},
    stats::{Outcome, Record, Stats},
};

/// The HTTP client shared by every simulated user of a run.
pub type HttpClient = Client<HttpConnector, BoxBody<Bytes, hyper::Error>>;

/// Errors produced by [`User`] and [`Behavior`].
///
/// Failed requests are not errors, they are recorded in [`Stats`]. These are
/// the conditions under which a user cannot build a request at all.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration does not describe a valid request.
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    /// The payload could not be built.
    #[error("Failed to build payload: {0}")]
    Payload(#[from] stampede_payload::Error),
    /// The request could not be built.
    #[error("Failed to build request: {0}")]
    Http(#[from] http::Error),
}

/// Build the HTTP client users share.
///
/// Canceled requests are not retried, a retry would be a second request the
/// statistics never see.
#[must_use]
pub fn client() -> HttpClient {
    Client::builder(TokioExecutor::new())
        .retry_canceled_requests(false)
        .build_http()
}

/// Render `err` and its chain of sources, outermost first.
fn describe(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

/// The request a user repeats on every turn.
#[derive(Debug, Clone)]
pub struct Behavior {
    client: HttpClient,
    uri: Uri,
    name: String,
    headers: HeaderMap,
    content_type: &'static str,
    payload: Payload,
    timeout: Option<Duration>,
    stats: Stats,
}

impl Behavior {
    /// Create the behavior described by `config`, sending through `client`
    /// and recording into `stats`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request URI or the payload configuration is
    /// invalid.
    pub fn new(client: HttpClient, config: &Config, stats: Stats) -> Result<Self, Error> {
        let uri = config.request_uri()?;
        let payload = Payload::new(&config.scenario.payload)?;
        Ok(Self {
            client,
            uri,
            name: config.scenario.request_name().to_string(),
            headers: config.scenario.headers.clone(),
            content_type: config.scenario.payload.content_type(),
            payload,
            timeout: config.request_timeout(),
            stats,
        })
    }

    /// Build one payload, post it and record the result.
    ///
    /// # Errors
    ///
    /// Returns an error only if the request cannot be built. Transport
    /// failures and error statuses are recorded and returned as
    /// [`Outcome::Failure`].
    pub async fn send<R>(&self, rng: &mut R) -> Result<Outcome, Error>
    where
        R: Rng + ?Sized,
    {
        let mut body = Vec::with_capacity(128);
        self.payload.to_bytes(rng, &mut body)?;
        let request_length = body.len() as u64;

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(&self.uri)
            .header(CONTENT_TYPE, self.content_type)
            .header(CONTENT_LENGTH, body.len())
            .body(crate::full(body))?;
        let headers = request.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }

        let started = Instant::now();
        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|err| describe(&err))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|err| describe(&err))?
                .to_bytes();
            Ok::<_, String>((status, body.len() as u64))
        };
        let result = match self.timeout {
            Some(limit) => time::timeout(limit, exchange).await.unwrap_or_else(|_| {
                Err(format!("request timed out after {}ms", limit.as_millis()))
            }),
            None => exchange.await,
        };
        let response_time = started.elapsed();

        let (outcome, content_length) = match result {
            Ok((status, length)) => (Outcome::from_status(status), length),
            Err(error) => (
                Outcome::Failure {
                    status: None,
                    error,
                },
                0,
            ),
        };
        if let Outcome::Failure { error, .. } = &outcome {
            debug!(uri = %self.uri, "request failed: {error}");
        }

        self.stats.record(&Record {
            method: Method::POST.as_str(),
            name: &self.name,
            response_time,
            request_length,
            content_length,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }
}

/// One simulated user.
#[derive(Debug)]
pub struct User<C = RealClock> {
    id: u32,
    behavior: Behavior,
    throttle: Throttle<C>,
    rng: StdRng,
    shutdown: Watcher,
}

impl<C> User<C>
where
    C: Clock + Send + Sync,
{
    /// Create a new `User`. `rng` drives every payload and wait the user
    /// draws, so users seeded alike behave alike.
    #[must_use]
    pub fn new(
        id: u32,
        behavior: Behavior,
        throttle: Throttle<C>,
        rng: StdRng,
        shutdown: Watcher,
    ) -> Self {
        Self {
            id,
            behavior,
            throttle,
            rng,
            shutdown,
        }
    }

    async fn turn(
        behavior: &Behavior,
        throttle: &mut Throttle<C>,
        rng: &mut StdRng,
    ) -> Result<(), Error> {
        throttle.wait(rng).await;
        behavior.send(rng).await?;
        Ok(())
    }

    /// Run this user until its shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Returns an error if a request cannot be built. Failed requests do not
    /// end the loop.
    pub async fn spin(self) -> Result<(), Error> {
        let Self {
            id,
            behavior,
            mut throttle,
            mut rng,
            shutdown,
        } = self;

        debug!(user = id, "user started");
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                biased;

                () = &mut shutdown_wait => {
                    debug!(user = id, "shutdown signal received");
                    return Ok(());
                }
                result = Self::turn(&behavior, &mut throttle, &mut rng) => result?,
            }
        }
    }
}

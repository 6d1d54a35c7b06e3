//! The harness around simulated users.
//!
//! A [`Swarm`] ramps the user population up at the configured spawn rate,
//! keeps it running until the run time elapses or its shutdown signal fires,
//! then stops every user and summarises the run as a [`Report`].
//!
//! ## Metrics
//!
//! `users_running`: Simulated users spawned and not yet stopped
//!

use std::time::Duration;

use metrics::gauge;
use rand::{SeedableRng, rngs::StdRng};
use stampede_signal::Watcher;
use stampede_throttle::Throttle;
use tokio::{
    pin,
    task::JoinSet,
    time::{self, Instant},
};
use tracing::{error, info, warn};

use crate::{
    config::{self, Config},
    stats::{Report, Stats},
    user::{self, Behavior, User},
};

const MIN_SPAWN_INTERVAL: Duration = Duration::from_micros(1);
const MAX_SPAWN_INTERVAL: Duration = Duration::from_secs(86_400);
const MAX_LOG_INTERVAL_SECONDS: u64 = 86_400;

/// Errors produced by [`Swarm`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    Config(#[from] config::Error),
    /// A simulated user could not build its request.
    #[error("Simulated user failed: {0}")]
    User(#[from] user::Error),
    /// The wait time policy is invalid.
    #[error("Invalid wait time: {0}")]
    Throttle(#[from] stampede_throttle::Error),
    /// A user could not register for the stop signal.
    #[error(transparent)]
    Registration(#[from] stampede_signal::RegisterError),
    /// A user task panicked.
    #[error("Simulated user task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// When a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    /// Length of the run, unbounded when `None`.
    pub run_time: Option<Duration>,
    /// How long users get to stop before they are aborted.
    pub stop_timeout: Duration,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            run_time: None,
            stop_timeout: Duration::from_secs(30),
        }
    }
}

/// A population of simulated users and the run that drives them.
#[derive(Debug)]
pub struct Swarm {
    config: Config,
    stats: Stats,
    shutdown: Watcher,
    limits: RunLimits,
}

impl Swarm {
    /// Create a new `Swarm`. Users record into `stats`, the run ends early
    /// when `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` is invalid.
    pub fn new(
        config: Config,
        stats: Stats,
        shutdown: Watcher,
        limits: RunLimits,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            config,
            stats,
            shutdown,
            limits,
        })
    }

    /// Run the swarm to completion and report on it.
    ///
    /// # Errors
    ///
    /// Returns an error if a user cannot build its request or a user task
    /// panics. Failed requests are never errors, they are in the report.
    pub async fn run(self) -> Result<Report, Error> {
        let Self {
            config,
            stats,
            shutdown,
            limits,
        } = self;

        let mut master = match config.seed {
            Some(seed) => StdRng::from_seed(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let behavior = Behavior::new(user::client(), &config, stats.clone())?;

        let (users_watcher, users_broadcaster) = stampede_signal::signal();
        let mut users = JoinSet::new();
        let population = config.users.get();
        let mut spawned: u32 = 0;
        let mut user_error = None;

        let spawn_interval = Duration::try_from_secs_f64(config.spawn_rate.recip())
            .unwrap_or(MAX_SPAWN_INTERVAL)
            .clamp(MIN_SPAWN_INTERVAL, MAX_SPAWN_INTERVAL);
        let mut spawn_tick = time::interval(spawn_interval);

        let log_every = Duration::from_secs(
            config
                .stats
                .log_interval_seconds
                .clamp(1, MAX_LOG_INTERVAL_SECONDS),
        );
        let log_enabled = config.stats.log_interval_seconds > 0;
        let mut progress = time::interval_at(Instant::now() + log_every, log_every);

        let run_end = async move {
            match limits.run_time {
                Some(run_time) => time::sleep(run_time).await,
                None => std::future::pending::<()>().await,
            }
        };
        pin!(run_end);
        let shutdown_wait = shutdown.recv();
        pin!(shutdown_wait);

        info!(
            users = population,
            spawn_rate = config.spawn_rate,
            uri = %config.target_uri,
            "Starting run"
        );
        loop {
            tokio::select! {
                () = &mut shutdown_wait => {
                    info!("Shutdown signal received, stopping users.");
                    break;
                }
                () = &mut run_end => {
                    info!("Run time elapsed, stopping users.");
                    break;
                }
                _ = spawn_tick.tick(), if spawned < population => {
                    let rng = StdRng::from_rng(&mut master);
                    let throttle = Throttle::new(config.wait_time)?;
                    let user = User::new(
                        spawned,
                        behavior.clone(),
                        throttle,
                        rng,
                        users_watcher.register()?,
                    );
                    users.spawn(user.spin());
                    spawned += 1;
                    gauge!("users_running").set(f64::from(spawned));
                    if spawned == population {
                        info!("All {population} users spawned");
                    }
                }
                _ = progress.tick(), if log_enabled => {
                    let total = stats.total();
                    info!(
                        users = spawned,
                        requests = total.num_requests(),
                        failures = total.num_failures(),
                        current_rps = total.current_rps(),
                        median_ms = total.median_response_time(),
                        "Progress"
                    );
                }
                Some(joined) = users.join_next() => {
                    // Users only return early when they cannot build a request.
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            error!("Simulated user failed: {err}");
                            user_error = Some(Error::User(err));
                            break;
                        }
                        Err(err) => {
                            user_error = Some(Error::Join(err));
                            break;
                        }
                    }
                }
            }
        }

        drop(users_watcher);
        if time::timeout(limits.stop_timeout, users_broadcaster.signal_and_wait())
            .await
            .is_err()
        {
            warn!(
                "Users did not stop within {:?}, aborting them",
                limits.stop_timeout
            );
            users.abort_all();
        }
        while let Some(joined) = users.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!("Simulated user failed: {err}");
                    if user_error.is_none() {
                        user_error = Some(Error::User(err));
                    }
                }
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    if user_error.is_none() {
                        user_error = Some(Error::Join(err));
                    }
                }
            }
        }
        gauge!("users_running").set(0.0);

        if let Some(err) = user_error {
            return Err(err);
        }
        let report = stats.report(spawned);
        info!("Run complete\n{report}");
        Ok(report)
    }
}

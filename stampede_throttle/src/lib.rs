//! The stampede throttle mechanism
//!
//! A simulated user pauses between turns. How long it pauses is decided by
//! the user's wait-time policy, configured through [`Config`] and enforced by
//! [`Throttle`]. All time is measured in ticks of a [`Clock`], one tick being
//! one microsecond of real time for [`RealClock`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Duration, Instant};

mod policy;

use policy::Policy;

/// Microseconds per millisecond, the unit used in [`Config`].
const TICKS_PER_MILLI: u64 = 1_000;

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
/// Wait-time policy of a simulated user.
pub enum Config {
    /// Wait a duration drawn uniformly from `[min_millis, max_millis]`.
    Between {
        /// Shortest wait, in milliseconds.
        min_millis: u64,
        /// Longest wait, in milliseconds, inclusive.
        max_millis: u64,
    },
    /// Wait the same duration after every turn.
    Constant {
        /// The wait, in milliseconds.
        millis: u64,
    },
    /// Wait whatever remains of `millis` once the turn itself is accounted
    /// for, so that a turn plus its wait takes at least `millis`.
    ConstantPacing {
        /// The target turn period, in milliseconds.
        millis: u64,
    },
    /// Pace turns so that each user runs at most `tasks_per_second` turns per
    /// second.
    ConstantThroughput {
        /// Target turns per second, per user.
        tasks_per_second: f64,
    },
}

impl Default for Config {
    fn default() -> Self {
        Self::Between {
            min_millis: 1,
            max_millis: 5,
        }
    }
}

impl Config {
    /// Check this configuration without building a [`Throttle`].
    ///
    /// # Errors
    ///
    /// See [`Error`] for the rejected configurations.
    pub fn validate(&self) -> Result<(), Error> {
        Policy::try_from(*self).map(|_| ())
    }
}

/// Errors produced by [`Throttle`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
pub enum Error {
    /// The lower bound of a `between` policy is above its upper bound.
    #[error("wait time minimum {min_millis}ms exceeds maximum {max_millis}ms")]
    MinExceedsMax {
        /// Configured minimum.
        min_millis: u64,
        /// Configured maximum.
        max_millis: u64,
    },
    /// Throughput must be a positive, finite number of tasks per second.
    #[error("tasks per second must be positive and finite, got {0}")]
    Throughput(f64),
}

#[async_trait]
/// The `Clock` used for every throttle
pub trait Clock {
    /// The number of ticks elapsed since the clock was created.
    fn ticks_elapsed(&self) -> u64;
    /// Wait for `ticks` amount of time
    async fn wait(&self, ticks: u64);
}

#[derive(Debug, Clone, Copy)]
/// A clock that operates with respect to real-clock time.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    #[allow(clippy::cast_possible_truncation)]
    fn ticks_elapsed(&self) -> u64 {
        // u64 microseconds covers roughly 584,554 years.
        Instant::now().duration_since(self.start).as_micros() as u64
    }

    async fn wait(&self, ticks: u64) {
        time::sleep(Duration::from_micros(ticks)).await;
    }
}

/// Enforces a wait-time policy between the turns of one simulated user.
///
/// A turn is the time between two calls to [`Throttle::wait`]. Pacing
/// policies subtract the length of the previous turn from their wait.
#[derive(Debug)]
pub struct Throttle<C = RealClock> {
    policy: Policy,
    clock: C,
    /// Tick at which the last wait ended, which is when the turn began.
    turn_started: u64,
}

impl Throttle<RealClock> {
    /// Create a new instance of `Throttle` with a real-time clock
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, see [`Error`].
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_clock(config, RealClock::default())
    }
}

impl<C> Throttle<C>
where
    C: Clock + Send + Sync,
{
    /// Create a new instance of `Throttle` driven by `clock`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, see [`Error`].
    pub fn with_clock(config: Config, clock: C) -> Result<Self, Error> {
        let policy = Policy::try_from(config)?;
        let turn_started = clock.ticks_elapsed();
        Ok(Self {
            policy,
            clock,
            turn_started,
        })
    }

    /// Wait out the think-time for the current turn, returning the wait that
    /// was applied.
    pub async fn wait<R>(&mut self, rng: &mut R) -> Duration
    where
        R: Rng + ?Sized,
    {
        let turn = self.clock.ticks_elapsed().saturating_sub(self.turn_started);
        let ticks = self.policy.ticks(rng, turn);
        if ticks > 0 {
            self.clock.wait(ticks).await;
        }
        self.turn_started = self.clock.ticks_elapsed();
        Duration::from_micros(ticks)
    }
}

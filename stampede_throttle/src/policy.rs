//! Tick arithmetic behind each wait-time policy.

use rand::Rng;

use crate::{Config, Error, TICKS_PER_MILLI};

const TICKS_PER_SECOND: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Policy {
    /// Uniform in `[min, max]` ticks.
    Uniform { min: u64, max: u64 },
    /// Always the same number of ticks.
    Fixed(u64),
    /// Whatever remains of the period after the turn.
    Pacing(u64),
}

impl TryFrom<Config> for Policy {
    type Error = Error;

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn try_from(config: Config) -> Result<Self, Self::Error> {
        match config {
            Config::Between {
                min_millis,
                max_millis,
            } => {
                if min_millis > max_millis {
                    return Err(Error::MinExceedsMax {
                        min_millis,
                        max_millis,
                    });
                }
                Ok(Self::Uniform {
                    min: min_millis.saturating_mul(TICKS_PER_MILLI),
                    max: max_millis.saturating_mul(TICKS_PER_MILLI),
                })
            }
            Config::Constant { millis } => Ok(Self::Fixed(millis.saturating_mul(TICKS_PER_MILLI))),
            Config::ConstantPacing { millis } => {
                Ok(Self::Pacing(millis.saturating_mul(TICKS_PER_MILLI)))
            }
            Config::ConstantThroughput { tasks_per_second } => {
                if !tasks_per_second.is_finite() || tasks_per_second <= 0.0 {
                    return Err(Error::Throughput(tasks_per_second));
                }
                Ok(Self::Pacing((TICKS_PER_SECOND / tasks_per_second).round() as u64))
            }
        }
    }
}

impl Policy {
    /// Ticks to wait given that the turn just finished took `turn` ticks.
    pub(crate) fn ticks<R>(self, rng: &mut R, turn: u64) -> u64
    where
        R: Rng + ?Sized,
    {
        match self {
            Self::Uniform { min, max } => rng.random_range(min..=max),
            Self::Fixed(ticks) => ticks,
            Self::Pacing(period) => period.saturating_sub(turn),
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    use super::*;

    proptest! {
        #[test]
        fn uniform_stays_within_bounds(
            seed: u64,
            min_millis in 0..10_000u64,
            spread in 0..10_000u64,
            turn: u64,
        ) {
            let max_millis = min_millis + spread;
            let policy = Policy::try_from(Config::Between { min_millis, max_millis })?;
            let mut rng = SmallRng::seed_from_u64(seed);
            for _ in 0..64 {
                let ticks = policy.ticks(&mut rng, turn);
                prop_assert!(ticks >= min_millis * TICKS_PER_MILLI);
                prop_assert!(ticks <= max_millis * TICKS_PER_MILLI);
            }
        }

        #[test]
        fn pacing_never_exceeds_period(seed: u64, millis in 0..100_000u64, turn: u64) {
            let policy = Policy::try_from(Config::ConstantPacing { millis })?;
            let mut rng = SmallRng::seed_from_u64(seed);
            let ticks = policy.ticks(&mut rng, turn);
            let period = millis * TICKS_PER_MILLI;
            prop_assert!(ticks <= period);
            prop_assert_eq!(ticks + turn.min(period), period);
        }
    }

    #[test]
    fn degenerate_between_is_constant() {
        let policy = Policy::try_from(Config::Between {
            min_millis: 3,
            max_millis: 3,
        })
        .expect("equal bounds are valid");
        let mut rng = SmallRng::seed_from_u64(0);
        assert_eq!(policy.ticks(&mut rng, 0), 3_000);
    }
}

//! Device telemetry payload.
//!
//! Every payload is a single flat JSON object describing one reading from a
//! simulated device:
//!
//! ```text
//! {"device":"device-17","timestamp":1700000000,"cpu":42.17,"rps":103}
//! ```
//!
//! `timestamp` is the Unix time, in seconds, at which the payload was built.

use std::{
    io::Write,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{ConfRange, Error};

/// Decimal places kept on the `cpu` reading.
const CPU_SCALE: f64 = 100.0;

fn default_devices() -> ConfRange<u32> {
    ConfRange::Inclusive { min: 1, max: 200 }
}

fn default_cpu() -> ConfRange<f64> {
    ConfRange::Inclusive {
        min: 0.0,
        max: 100.0,
    }
}

fn default_rps() -> ConfRange<u32> {
    ConfRange::Inclusive { min: 50, max: 150 }
}

/// One telemetry reading, the wire format of this payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Name of the reporting device, `device-<n>`.
    pub device: String,
    /// Unix time in seconds.
    pub timestamp: i64,
    /// CPU utilisation percentage, two decimal places.
    pub cpu: f64,
    /// Requests per second observed by the device.
    pub rps: u32,
}

/// Configuration of [`Telemetry`]
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Device numbers to draw from. Defaults to `1..=200`.
    #[serde(default = "default_devices")]
    pub devices: ConfRange<u32>,
    /// CPU utilisation to draw from. Defaults to `0.0..=100.0`.
    #[serde(default = "default_cpu")]
    pub cpu: ConfRange<f64>,
    /// Requests per second to draw from. Defaults to `50..=150`.
    #[serde(default = "default_rps")]
    pub rps: ConfRange<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            cpu: default_cpu(),
            rps: default_rps(),
        }
    }
}

impl Config {
    /// Check that every range is well formed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] naming the first malformed range.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.devices.valid() {
            return Err(Error::Validation(format!(
                "devices range {} has min greater than max",
                self.devices
            )));
        }
        if !self.rps.valid() {
            return Err(Error::Validation(format!(
                "rps range {} has min greater than max",
                self.rps
            )));
        }
        let cpu_finite = match self.cpu {
            ConfRange::Constant(c) => c.is_finite(),
            ConfRange::Inclusive { min, max } => min.is_finite() && max.is_finite(),
        };
        if !cpu_finite || !self.cpu.valid() {
            return Err(Error::Validation(format!(
                "cpu range {} must be finite with min no greater than max",
                self.cpu
            )));
        }
        Ok(())
    }
}

/// Generator of device telemetry samples.
#[derive(Debug, Clone, Copy)]
pub struct Telemetry {
    config: Config,
}

impl Telemetry {
    /// Create a new instance of `Telemetry`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the configuration is invalid.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Draw one sample stamped with `timestamp`.
    pub fn generate<R>(&self, rng: &mut R, timestamp: i64) -> Sample
    where
        R: Rng + ?Sized,
    {
        let device = self.config.devices.sample(rng);
        let cpu = self.config.cpu.sample(rng);
        let rps = self.config.rps.sample(rng);

        Sample {
            device: format!("device-{device}"),
            timestamp,
            cpu: (cpu * CPU_SCALE).round() / CPU_SCALE,
            rps,
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            config: Config::default(),
        }
    }
}

fn unix_now() -> Result<i64, Error> {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::Clock)?;
    i64::try_from(since_epoch.as_secs()).map_err(|_| Error::Clock)
}

impl crate::Serialize for Telemetry {
    fn to_bytes<W, R>(&self, rng: &mut R, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + ?Sized,
        W: Write,
    {
        let sample = self.generate(rng, unix_now()?);
        serde_json::to_writer(writer, &sample)?;
        Ok(())
    }
}

//! The stampede payloads
//!
//! This library builds the request bodies that stampede's simulated users push
//! into the target. A payload is built fresh for every request, immediately
//! before it is sent, and is never retained.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::io::Write;

use rand::Rng;
use serde::Deserialize;

pub use common::config::ConfRange;
pub use telemetry::Telemetry;

mod common;
pub mod telemetry;

/// Errors related to serialization
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Json payload could not be encoded
    #[error("Json payload could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
    /// The system clock reads earlier than the Unix epoch
    #[error("System clock is set before the Unix epoch")]
    Clock,
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// To serialize into bytes
pub trait Serialize {
    /// Write one freshly generated payload into `writer`.
    ///
    /// # Errors
    ///
    /// Errors come from serialization crackups or a broken system clock.
    fn to_bytes<W, R>(&self, rng: &mut R, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + ?Sized,
        W: Write;
}

/// Configuration for `Payload`
#[derive(Debug, Deserialize, serde::Serialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Config {
    /// Generates device telemetry samples encoded as JSON objects
    Telemetry(telemetry::Config),
}

impl Default for Config {
    fn default() -> Self {
        Self::Telemetry(telemetry::Config::default())
    }
}

impl Config {
    /// The `Content-Type` of payloads built from this configuration.
    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Telemetry(_) => "application/json",
        }
    }
}

/// Unified payload type for all serializers
#[derive(Debug, Clone, Copy)]
pub enum Payload {
    /// Device telemetry samples
    Telemetry(Telemetry),
}

impl Payload {
    /// Build the payload described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the configuration is invalid.
    pub fn new(config: &Config) -> Result<Self, Error> {
        match config {
            Config::Telemetry(conf) => Ok(Self::Telemetry(Telemetry::new(*conf)?)),
        }
    }
}

impl Serialize for Payload {
    fn to_bytes<W, R>(&self, rng: &mut R, writer: &mut W) -> Result<(), Error>
    where
        W: Write,
        R: Rng + ?Sized,
    {
        match self {
            Payload::Telemetry(ser) => ser.to_bytes(rng, writer),
        }
    }
}

//! The stampede load generator.
//!
//! This library supports the stampede binary found elsewhere in this project.
//! A run is a population of simulated users, each one pausing for a short
//! think-time and then posting a freshly generated telemetry payload to the
//! target's ingest endpoint. The harness around those users spawns them at a
//! configured rate, stops them when the run ends and reports what the target
//! did with their requests.

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
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};

pub mod blackhole;
pub mod config;
pub mod stats;
pub mod swarm;
pub mod user;

/// Wrap `chunk` as a complete request or response body.
pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

//! The rowcast user activity replay tool.
//!
//! Everything in this library exists to support the rowcast binary elsewhere
//! in the project: a sampler that pulls rows out of MySQL, a publisher that
//! speaks the Kafka REST proxy dialect and the emulation loop that drives
//! them. The pieces are cut to that daemon's shape, not for general reuse.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
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

pub mod config;
pub mod emulator;
pub mod publisher;
pub mod sampler;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};

/// Wrap a chunk of bytes as a fixed-size request body.
pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

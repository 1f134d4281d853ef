//! stockpile - S3-backed build acceleration.
//!
//! Three tiered caches share one skeleton (hashed keys sharded into a local
//! staging directory, write-behind to an S3 bucket, conditional upload by
//! content digest):
//!
//! - **Build cache**: toolchain actions mapped to output objects, driven
//!   over a line protocol on stdio.
//! - **Module cache**: opaque artifact names mapped to immutable blobs.
//! - **Reverse proxy**: cached HTTPS responses for configured hosts, with a
//!   volatile in-memory tier in front and a CONNECT bridge for
//!   interception.

pub mod build;
pub mod config;
pub mod metrics;
pub mod module;
pub mod protocol;
pub mod revproxy;
pub mod s3;
pub mod server;
pub mod stage;
pub mod types;
pub mod uploader;

pub use config::Args;
pub use types::{Error, Result};

//! # stratum
//!
//! Compose pipeline and CLI for Stratum.
//!
//! Each build invocation overlays one compiled artifact onto a base image
//! and publishes the result: validate → resolve (cached pull) → package →
//! compose → publish. Invocations run independently and share only the
//! base-image cache.

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod pipeline;

pub use config::BuildConfig;
pub use pipeline::{BuildRequest, ComposedImage, Pipeline, RetryPolicy};

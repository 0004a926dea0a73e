//! # stratum-common
//!
//! Shared types for the Stratum toolkit.
//!
//! This crate provides the error taxonomy used across all Stratum crates,
//! including the pipeline stage marker attached to every surfaced failure.

#![warn(missing_docs)]

pub mod error;

pub use error::{Stage, StratumError, StratumResult};

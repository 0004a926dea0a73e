//! # stratum-image
//!
//! Container image composition engine for Stratum.
//!
//! This crate provides:
//! - Image reference parsing
//! - Registry pull/push over the standard v2 HTTP surface
//! - A concurrency-safe base-image cache
//! - Deterministic, content-addressed layer packaging
//! - Pure composition of new images (layer append, runtime config rewrite)
//! - Policy-gated publishing

#![warn(missing_docs)]

pub mod cache;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod policy;
pub mod publisher;
pub mod reference;
/// Registry transport.
pub mod registry;

pub use cache::ImageCache;
pub use image::Image;
pub use layer::{BuildArtifact, Layer, LayerBuilder};
pub use policy::{AcceptancePolicy, AllowUnsigned, DenyUnsigned, PolicyMode};
pub use publisher::Publisher;
pub use reference::ImageReference;
pub use registry::{HttpRegistry, RegistryAuth, RegistryOptions, RegistryTransport};

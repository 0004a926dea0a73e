//! Stratum CLI.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;

use stratum_image::{HttpRegistry, ImageCache, ImageReference, PolicyMode};

use crate::config::BuildConfig;
use crate::pipeline::{Pipeline, RetryPolicy};

/// Stratum - overlay build artifacts onto container images
#[derive(Parser)]
#[command(name = "stratum")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Stratum commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Compose an image from a base image and an artifact, then publish it
    Build {
        /// Path to a TOML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Base image reference
        #[arg(long)]
        base: Option<String>,

        /// Path to the artifact binary
        #[arg(long)]
        artifact: Option<PathBuf>,

        /// Destination reference for the composed image
        #[arg(long)]
        destination: Option<String>,

        /// Name the artifact takes inside the image
        #[arg(long)]
        name: Option<String>,

        /// Skip TLS certificate verification (self-signed internal registries)
        #[arg(long)]
        insecure: bool,

        /// Publish without signature verification (trusted registries only)
        #[arg(long)]
        allow_unsigned: bool,

        /// Per-request timeout in seconds
        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Attempts per network operation
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Print the canonical form of an image reference
    Resolve {
        /// Image reference
        reference: String,
    },
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Build {
                config,
                base,
                artifact,
                destination,
                name,
                insecure,
                allow_unsigned,
                timeout_secs,
                retries,
            } => {
                let mut build = match config {
                    Some(path) => BuildConfig::from_file(&path)?,
                    None => BuildConfig::default(),
                };
                if let Some(base) = base {
                    build.base = base;
                }
                if let Some(artifact) = artifact {
                    build.artifact = artifact;
                }
                if let Some(destination) = destination {
                    build.destination = destination;
                }
                if let Some(name) = name {
                    build.app_name = Some(name);
                }
                if insecure {
                    build.insecure = true;
                }
                if allow_unsigned {
                    build.policy = PolicyMode::AllowUnsigned;
                }
                if let Some(secs) = timeout_secs {
                    build.timeout_secs = secs;
                }
                if let Some(attempts) = retries {
                    build.retries = attempts;
                }
                build.validate()?;

                let transport = Arc::new(HttpRegistry::new(build.registry_options())?);
                let cache = Arc::new(ImageCache::new());
                let pipeline = Pipeline::new(cache, transport, build.policy.policy())
                    .with_retry_policy(RetryPolicy {
                        attempts: build.retries,
                        ..RetryPolicy::default()
                    });

                let outcome = pipeline.run(&build.request()?).await?;

                println!("\nCompose complete!");
                println!("  Destination: {}", outcome.destination);
                println!("  Digest:      {}", outcome.digest);
                println!("  Layers:      {}", outcome.layers);

                Ok(())
            }

            Commands::Resolve { reference } => {
                let parsed = ImageReference::parse(&reference)?;
                println!("{parsed}");
                Ok(())
            }
        }
    }
}

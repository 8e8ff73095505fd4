//! # secret_volume
//!
//! Provisions secret volumes: per-resource directories, each backed by a
//! size-bounded tmpfs, populated with secrets fetched from a remote secret
//! service before a workload starts and torn down after it exits.
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (api) ──► VolumeManager ──► SecretProducer ──► HTTPS secret service
//!                       │                  │
//!                       │                  ▼
//!                       │           SecretBundle (tar.gz, lazily decoded)
//!                       ▼
//!                 Mounter + VolumeFs ──► /secrets/{id}/...
//! ```
//!
//! ## Modules
//! - `api`: axum router and server start-up
//! - `secrets`: secret bundles, producers and merging
//! - `volume`: mounters, filesystems and the volume manager
//! - `types`: volumes and their wire representation

pub mod api;
pub mod config;
pub mod error;
pub mod secrets;
pub mod types;
pub mod util;
pub mod volume;

pub use config::Config;
pub use error::ErrorKind;
pub use types::{CreateVolumeRequest, KeyPair, SecretSource, SecretType, Volume};
pub use volume::{VolumeError, VolumeManager};

//! beacon-core: shared types and configuration for Beacon.
//!
//! Defines the node metadata a service instance advertises, the payload
//! written into the coordination store, the registry path layout, and the
//! `beacon.toml` configuration model.

pub mod config;
pub mod types;

pub use config::{
    AdminConfig, BeaconConfig, ConfigError, ConfigResult, DiscoveryConfig, HealthConfig,
    NodeConfig, RotationConfig, ServiceConfig, StalenessMode, StoreConfig,
};
pub use types::*;

pub mod config;
pub mod liquid;
pub mod models;
pub mod types;

pub use config::{ClusterConfig, ConfigError};
pub use types::{
    AvailabilityZone, OvercommitFactor, PerAZ, RateName, ResourceName, ServiceType, TimeSpan, Unit,
};

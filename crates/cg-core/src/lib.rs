//! cg-core: Core abstractions and configuration for clustergate
//!
//! This crate provides the credential data model, the error taxonomy, the
//! contracts of the external collaborators (credential store, service
//! discovery) and the configuration shared by the tunnel and manager crates.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{CgError, ConfigError, RegistrationError, StoreError};
pub use traits::{CredentialStore, ServiceDiscovery, ServiceInstance};
pub use types::{
    ClientModule, ClusterCredential, ConnectMode, CredentialFilter, RegisterParams, ServerKey,
};

//! Core error types for clustergate

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the clustergate crates
#[derive(Error, Debug)]
pub enum CgError {
    /// Registration error
    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    /// Credential store error
    #[error("Credential store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a tunnel registration is refused
#[derive(Error, Debug)]
pub enum RegistrationError {
    /// Module header absent or empty
    #[error("missing client module")]
    MissingModule,

    /// Module header names an unsupported kind
    #[error("unknown client module: {0}")]
    UnknownModule(String),

    /// Cluster id header absent or empty
    #[error("missing cluster id")]
    MissingClusterId,

    /// Params header absent
    #[error("missing tunnel params")]
    MissingParams,

    /// Params are not base64-encoded JSON of the expected shape
    #[error("malformed tunnel params: {0}")]
    MalformedParams(String),

    /// Params carry an empty address
    #[error("missing server address")]
    MissingAddress,

    /// Address could not be parsed or has no host
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// kubeagent registration without CA data
    #[error("missing CA certificate for {0}")]
    MissingCaCert(&'static str),

    /// kubeagent registration without a token
    #[error("missing user token for {0}")]
    MissingUserToken(&'static str),

    /// Writing the credential failed
    #[error("failed to store credential: {0}")]
    Store(#[from] StoreError),
}

impl RegistrationError {
    /// Whether the agent sent bad input, as opposed to a server-side failure
    pub fn is_rejection(&self) -> bool {
        !matches!(self, RegistrationError::Store(_))
    }
}

/// Credential store failures
#[derive(Error, Debug)]
pub enum StoreError {
    /// Backend unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Concurrent write conflict
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Persistence I/O error
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted data could not be (de)serialized
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_failure_is_not_a_rejection() {
        assert!(RegistrationError::MissingClusterId.is_rejection());
        assert!(RegistrationError::UnknownModule("x".into()).is_rejection());
        assert!(!RegistrationError::Store(StoreError::Unavailable("down".into())).is_rejection());
    }
}

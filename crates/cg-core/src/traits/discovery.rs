//! Service discovery contract

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Metadata key carrying the HTTP port of an instance
pub const HTTP_PORT_KEY: &str = "httpport";

/// One replica of this service as reported by discovery
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceInstance {
    /// Dial address, `host:port`
    pub address: String,
    /// Free-form metadata
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Instance without metadata
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Handle returned by [`ServiceDiscovery::register_callback`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub u64);

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback-{}", self.0)
    }
}

/// Receives the full current membership on every change
pub type MembershipCallback = Arc<dyn Fn(Vec<ServiceInstance>) + Send + Sync>;

/// Source of membership events for this service's replicas
pub trait ServiceDiscovery: Send + Sync {
    /// Subscribe to membership snapshots
    fn register_callback(&self, callback: MembershipCallback) -> CallbackId;

    /// Stop delivering snapshots to a subscriber. Unknown ids are ignored.
    fn unregister_callback(&self, id: CallbackId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_metadata() {
        let inst = ServiceInstance::new("10.0.0.2:9000").with_metadata(HTTP_PORT_KEY, "8080");
        assert_eq!(inst.address, "10.0.0.2:9000");
        assert_eq!(inst.metadata.get(HTTP_PORT_KEY).map(String::as_str), Some("8080"));
    }
}

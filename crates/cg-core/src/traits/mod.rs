//! Contracts of the collaborators the manager depends on

mod discovery;
mod store;

pub use discovery::{CallbackId, MembershipCallback, ServiceDiscovery, ServiceInstance, HTTP_PORT_KEY};
pub use store::CredentialStore;

//! Replica discovery
//!
//! [`StaticDiscovery`] serves a configured member list that can be replaced
//! at runtime. [`DnsDiscovery`] polls a DNS name that resolves to every
//! replica (a headless service, for instance).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use cg_core::traits::{CallbackId, MembershipCallback, ServiceInstance};
use cg_core::ServiceDiscovery;

/// Callback registry shared by both discovery kinds
#[derive(Default)]
struct Callbacks {
    next_id: AtomicU64,
    registered: DashMap<u64, MembershipCallback>,
}

impl Callbacks {
    fn add(&self, callback: MembershipCallback) -> CallbackId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registered.insert(id, callback);
        CallbackId(id)
    }

    fn remove(&self, id: CallbackId) {
        self.registered.remove(&id.0);
    }

    fn notify(&self, members: &[ServiceInstance]) {
        // clone out so callbacks run without holding map shards
        let callbacks: Vec<MembershipCallback> =
            self.registered.iter().map(|e| Arc::clone(e.value())).collect();
        for callback in callbacks {
            callback(members.to_vec());
        }
    }
}

/// Member list fixed by configuration or replaced programmatically
pub struct StaticDiscovery {
    members: watch::Sender<Vec<ServiceInstance>>,
    callbacks: Callbacks,
}

impl StaticDiscovery {
    /// Discovery over `addresses`
    pub fn new<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members = addresses.into_iter().map(ServiceInstance::new).collect();
        Self {
            members: watch::channel(members).0,
            callbacks: Callbacks::default(),
        }
    }

    /// Replace the member list and notify subscribers
    pub fn set_members(&self, members: Vec<ServiceInstance>) {
        self.members.send_replace(members.clone());
        self.callbacks.notify(&members);
    }

    /// Current member list
    pub fn members(&self) -> Vec<ServiceInstance> {
        self.members.borrow().clone()
    }
}

impl ServiceDiscovery for StaticDiscovery {
    fn register_callback(&self, callback: MembershipCallback) -> CallbackId {
        let current = self.members();
        callback(current);
        self.callbacks.add(callback)
    }

    fn unregister_callback(&self, id: CallbackId) {
        self.callbacks.remove(id);
    }
}

/// Members found by resolving a `host:port` name on an interval
pub struct DnsDiscovery {
    dns_name: String,
    refresh_interval: Duration,
    members: watch::Sender<Vec<ServiceInstance>>,
    callbacks: Callbacks,
}

impl DnsDiscovery {
    pub fn new(dns_name: impl Into<String>, refresh_interval: Duration) -> Self {
        Self {
            dns_name: dns_name.into(),
            refresh_interval,
            members: watch::channel(Vec::new()).0,
            callbacks: Callbacks::default(),
        }
    }

    /// Resolve once, notifying subscribers if the set changed.
    ///
    /// Returns whether the member set changed.
    pub async fn refresh(&self) -> std::io::Result<bool> {
        let mut addresses: Vec<String> = tokio::net::lookup_host(self.dns_name.as_str())
            .await?
            .map(|addr| addr.to_string())
            .collect();
        addresses.sort();
        addresses.dedup();

        let members: Vec<ServiceInstance> =
            addresses.into_iter().map(ServiceInstance::new).collect();
        let changed = self.members.send_if_modified(|current| {
            if *current == members {
                false
            } else {
                *current = members.clone();
                true
            }
        });
        if changed {
            tracing::info!(dns_name = %self.dns_name, members = members.len(), "Replica set changed");
            self.callbacks.notify(&members);
        }
        Ok(changed)
    }

    /// Poll until `cancel` fires. Resolution errors keep the last known set.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.refresh().await {
                        tracing::warn!(dns_name = %self.dns_name, error = %e, "Replica lookup failed");
                    }
                }
            }
        }
    }
}

impl ServiceDiscovery for DnsDiscovery {
    fn register_callback(&self, callback: MembershipCallback) -> CallbackId {
        let current = self.members.borrow().clone();
        if !current.is_empty() {
            callback(current);
        }
        self.callbacks.add(callback)
    }

    fn unregister_callback(&self, id: CallbackId) {
        self.callbacks.remove(id);
    }
}

//! Browsing for service instances.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use bitflags::bitflags;

use crate::{
    name::{normalize_domain, present_domain},
    provider::{PropertyBag, PropertyKey, Provider, Query},
    Config, Error,
};

use super::{lock, Presence, ScanCycle, Tracked, WatchSpec, Worker};

bitflags! {
    /// Flags attached to a [`DiscoveryNotification`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DiscoveryFlags: u32 {
        /// The instance is present. Cleared for removals and failures.
        const ADD = 1 << 0;
        /// More notifications follow immediately. Reserved, never set.
        const MORE_COMING = 1 << 1;
    }
}

/// Opaque handle identifying a running discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DiscoveryHandle(pub(crate) u64);

/// Notification about a discovered instance appearing or disappearing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryNotification {
    /// `None` only on failure notifications.
    pub instance_name: Option<String>,
    /// Service type with trailing dot.
    pub service_type: String,
    /// Domain with trailing dot.
    pub domain: String,
    pub flags: DiscoveryFlags,
    pub error: Option<Error>,
}

impl DiscoveryNotification {
    pub fn is_added(&self) -> bool {
        self.flags.contains(DiscoveryFlags::ADD)
    }
}

pub(crate) type DiscoveryCallback = Box<dyn Fn(DiscoveryHandle, DiscoveryNotification) + Send>;

/// An instance tracked by a running discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    id: String,
    instance_name: String,
    service_type: String,
    domain: Option<String>,
    presence: Presence,
    changed: bool,
}

impl ServiceInstance {
    /// The provider's identifier for this instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Service type, without trailing dot.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Domain, without trailing dot. `None` if the provider did not report one.
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    /// Whether a notification was delivered for this instance during the current cycle.
    pub fn changed(&self) -> bool {
        self.changed
    }
}

/// Properties requested from the provider for every discovered instance.
const DISCOVERY_KEYS: &[PropertyKey] = &[
    PropertyKey::InstanceName,
    PropertyKey::ServiceName,
    PropertyKey::Domain,
];

/// A running discovery engine.
pub(crate) struct Discovery {
    instances: Tracked<ServiceInstance>,
    worker: Worker,
}

impl Discovery {
    pub(crate) fn start(
        handle: DiscoveryHandle,
        provider: Arc<dyn Provider>,
        config: &Config,
        service_type: &str,
        domain: Option<&str>,
        callback: DiscoveryCallback,
    ) -> Result<Self, Error> {
        let query = Query::new(service_type, domain);
        let instances = Arc::new(Mutex::new(BTreeMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let browse = Browse {
            handle,
            service_type: query.service_type().to_string(),
            domain: query
                .domain()
                .unwrap_or(config.default_domain())
                .to_string(),
            instances: instances.clone(),
            running: running.clone(),
            callback,
        };
        let spec = WatchSpec {
            name: format!("discovery-{}", handle.0),
            query,
            keys: DISCOVERY_KEYS,
            rescan_delay: config.rescan_delay(),
        };
        let worker = Worker::spawn(provider, spec, running, browse)?;
        Ok(Self { instances, worker })
    }

    /// The shared instance map, for taking snapshots without holding the registry lock.
    pub(crate) fn tracked(&self) -> Tracked<ServiceInstance> {
        self.instances.clone()
    }

    pub(crate) fn stop(&mut self) {
        self.worker.stop();
    }
}

struct Browse {
    handle: DiscoveryHandle,
    service_type: String,
    /// Domain reported when the provider reports none.
    domain: String,
    instances: Tracked<ServiceInstance>,
    running: Arc<AtomicBool>,
    callback: DiscoveryCallback,
}

impl Browse {
    fn notification(&self, instance: &ServiceInstance) -> DiscoveryNotification {
        let flags = match instance.presence {
            Presence::Added => DiscoveryFlags::ADD,
            Presence::Updated => {
                log::debug!(
                    "{}: change to known instance '{}' reported as an addition",
                    self.handle.0,
                    instance.instance_name
                );
                DiscoveryFlags::ADD
            }
            Presence::Removed => DiscoveryFlags::empty(),
        };
        DiscoveryNotification {
            instance_name: Some(instance.instance_name.clone()),
            service_type: present_domain(&instance.service_type),
            domain: present_domain(instance.domain.as_deref().unwrap_or(&self.domain)),
            flags,
            error: None,
        }
    }

    /// Invokes the callback. The instance map must not be locked, since the callback may query it.
    fn deliver(&self, notification: DiscoveryNotification) {
        if !self.running.load(Ordering::SeqCst) {
            log::trace!("discovery stopped, dropping {:?}", notification);
            return;
        }
        (self.callback)(self.handle, notification);
    }
}

impl ScanCycle for Browse {
    fn observe(&mut self, id: &str, properties: &PropertyBag) {
        let Some(instance_name) = properties.text(PropertyKey::InstanceName) else {
            log::warn!("instance {} reported without a name, ignoring", id);
            return;
        };
        let service_type = properties
            .text(PropertyKey::ServiceName)
            .map(normalize_domain)
            .unwrap_or(&self.service_type);
        let domain = properties
            .text(PropertyKey::Domain)
            .map(normalize_domain)
            .filter(|d| !d.is_empty());

        let notification = match lock(&self.instances).entry(id.to_string()) {
            Entry::Vacant(entry) => {
                let instance = entry.insert(ServiceInstance {
                    id: id.to_string(),
                    instance_name: instance_name.to_string(),
                    service_type: service_type.to_string(),
                    domain: domain.map(str::to_string),
                    presence: Presence::Added,
                    changed: true,
                });
                log::debug!("discovered {} ({})", instance.instance_name, id);
                self.notification(instance)
            }
            Entry::Occupied(entry) => {
                let instance = entry.into_mut();
                let changed = instance.instance_name != instance_name
                    || instance.service_type != service_type
                    || instance.domain.as_deref() != domain;
                instance.presence = Presence::Updated;
                if !changed {
                    return;
                }
                instance.instance_name = instance_name.to_string();
                instance.service_type = service_type.to_string();
                instance.domain = domain.map(str::to_string);
                instance.changed = true;
                self.notification(instance)
            }
        };
        self.deliver(notification);
    }

    fn end_cycle(&mut self) {
        let mut lost = Vec::new();
        lock(&self.instances).retain(|id, instance| {
            if instance.presence == Presence::Removed {
                log::debug!("lost {} ({})", instance.instance_name, id);
                lost.push(self.notification(instance));
                false
            } else {
                instance.presence = Presence::Removed;
                instance.changed = false;
                true
            }
        });
        for notification in lost {
            self.deliver(notification);
        }
    }

    fn fail(&mut self, error: Error) {
        self.deliver(DiscoveryNotification {
            instance_name: None,
            service_type: present_domain(&self.service_type),
            domain: present_domain(&self.domain),
            flags: DiscoveryFlags::empty(),
            error: Some(error),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use crate::{
        provider::{mock::MockProvider, PropertyValue, WatchEvent},
        service::snapshot,
    };

    use super::*;

    fn instance(name: &str) -> PropertyBag {
        PropertyBag::new()
            .with(PropertyKey::InstanceName, PropertyValue::Text(name.into()))
            .with(
                PropertyKey::ServiceName,
                PropertyValue::Text("_daap._tcp".into()),
            )
            .with(PropertyKey::Domain, PropertyValue::Text("local.".into()))
    }

    fn added(id: &str, name: &str) -> WatchEvent {
        WatchEvent::Added {
            id: id.into(),
            properties: instance(name),
        }
    }

    struct Harness {
        provider: MockProvider,
        discovery: Discovery,
        rx: mpsc::Receiver<(DiscoveryHandle, DiscoveryNotification)>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_provider(MockProvider::new())
        }

        fn with_provider(provider: MockProvider) -> Self {
            let (tx, rx) = mpsc::channel();
            let tx = Mutex::new(tx);
            let discovery = Discovery::start(
                DiscoveryHandle(7),
                Arc::new(provider.clone()),
                &Config::default(),
                "_daap._tcp.",
                None,
                Box::new(move |handle, n| {
                    tx.lock().unwrap().send((handle, n)).ok();
                }),
            )
            .unwrap();
            Self {
                provider,
                discovery,
                rx,
            }
        }

        fn notifications(&self) -> Vec<DiscoveryNotification> {
            self.rx.try_iter().map(|(_, n)| n).collect()
        }

        fn summary(&self) -> Vec<(bool, String)> {
            self.notifications()
                .into_iter()
                .map(|n| (n.is_added(), n.instance_name.unwrap_or_default()))
                .collect()
        }
    }

    #[test]
    fn add_then_remove() {
        let h = Harness::new();
        h.provider.wait_for_starts(1);
        assert_eq!(h.provider.query().unwrap().service_type(), "_daap._tcp");

        h.provider.emit(added("a", "MyService"));
        h.provider.complete_cycle();

        let (handle, n) = h.rx.try_recv().unwrap();
        assert_eq!(handle, DiscoveryHandle(7));
        assert_eq!(
            n,
            DiscoveryNotification {
                instance_name: Some("MyService".into()),
                service_type: "_daap._tcp.".into(),
                domain: "local.".into(),
                flags: DiscoveryFlags::ADD,
                error: None,
            }
        );

        // Not seen again in the next cycle: removed exactly once.
        h.provider.complete_cycle();
        assert_eq!(h.summary(), [(false, "MyService".to_string())]);
        h.provider.complete_cycle();
        assert!(h.notifications().is_empty());
        assert!(snapshot(&h.discovery.tracked()).is_empty());
    }

    #[test]
    fn duplicates_are_suppressed() {
        let h = Harness::new();
        h.provider.wait_for_starts(1);

        h.provider.emit(added("a", "MyService"));
        h.provider.emit(added("a", "MyService"));
        h.provider.emit(WatchEvent::Updated {
            id: "a".into(),
            properties: instance("MyService"),
        });
        h.provider.complete_cycle();
        assert_eq!(h.summary(), [(true, "MyService".to_string())]);

        // Seen in every cycle: no further notifications.
        for _ in 0..3 {
            h.provider.emit(added("a", "MyService"));
            h.provider.complete_cycle();
        }
        assert!(h.notifications().is_empty());

        let instances = snapshot(&h.discovery.tracked());
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].presence(), Presence::Removed);
        assert!(!instances[0].changed());
        assert_eq!(instances[0].domain(), Some("local"));
    }

    #[test]
    fn renamed_instance_is_readded() {
        let h = Harness::new();
        h.provider.wait_for_starts(1);
        h.provider.emit(added("a", "Old"));
        h.provider.complete_cycle();
        h.provider.emit(added("a", "New"));
        h.provider.complete_cycle();
        assert_eq!(
            h.summary(),
            [(true, "Old".to_string()), (true, "New".to_string())]
        );
    }

    #[test]
    fn removed_event_counts_as_sighting() {
        let h = Harness::new();
        h.provider.wait_for_starts(1);
        h.provider.emit(added("a", "MyService"));
        h.provider.complete_cycle();
        h.provider.emit(WatchEvent::Removed {
            id: "a".into(),
            properties: instance("MyService"),
        });
        h.provider.complete_cycle();
        assert_eq!(h.summary(), [(true, "MyService".to_string())]);
    }

    #[test]
    fn nameless_instances_are_ignored() {
        let h = Harness::new();
        h.provider.wait_for_starts(1);
        h.provider.emit(WatchEvent::Added {
            id: "x".into(),
            properties: PropertyBag::new(),
        });
        h.provider.complete_cycle();
        assert!(h.notifications().is_empty());
        assert!(snapshot(&h.discovery.tracked()).is_empty());
    }

    #[test]
    fn default_domain() {
        let h = Harness::new();
        h.provider.wait_for_starts(1);
        h.provider.emit(WatchEvent::Added {
            id: "a".into(),
            properties: PropertyBag::new()
                .with(PropertyKey::InstanceName, PropertyValue::Text("x".into())),
        });
        h.provider.complete_cycle();
        let n = h.notifications().remove(0);
        assert_eq!(n.service_type, "_daap._tcp.");
        assert_eq!(n.domain, "local.");
    }

    #[test]
    fn watch_failure() {
        let h = Harness::with_provider(MockProvider::failing());
        let (_, n) = h.rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(n.instance_name, None);
        assert_eq!(n.domain, "local.");
        assert!(!n.is_added());
        assert!(matches!(n.error, Some(Error::ProviderInit(_))));
    }

    #[test]
    fn nothing_after_stop() {
        let mut h = Harness::new();
        h.provider.wait_for_starts(1);
        h.discovery.stop();
        h.provider.emit(added("a", "MyService"));
        h.provider.emit(WatchEvent::EnumerationCompleted);
        std::thread::sleep(Duration::from_millis(50));
        assert!(h.notifications().is_empty());
        assert_eq!(h.provider.starts(), 1);
    }
}

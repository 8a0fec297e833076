//! Resolving service instances to addresses, ports and TXT records.

use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    name::{escape_full_name, instance_full_name, normalize_domain, present_domain},
    provider::{PropertyBag, PropertyKey, Provider, Query},
    txt::TxtRecord,
    Config, Error,
};

use super::{lock, Presence, ScanCycle, Tracked, WatchSpec, Worker};

/// Opaque handle identifying a running resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResolveHandle(pub(crate) u64);

/// One reachable address of a resolved instance.
///
/// An instance with several addresses produces one notification per address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveNotification {
    pub service_name: String,
    /// Service type with trailing dot.
    pub service_type: String,
    /// Domain with trailing dot.
    pub domain: String,
    /// Escaped `instance.type.domain.`, see [`escape_full_name`].
    pub full_name: String,
    pub host_target: String,
    pub address: String,
    pub port: u16,
    /// Length-prefixed TXT entries.
    pub txt: Vec<u8>,
    pub error: Option<Error>,
}

impl ResolveNotification {
    pub fn txt_len(&self) -> usize {
        self.txt.len()
    }

    /// Decodes [`ResolveNotification::txt`].
    pub fn txt_record(&self) -> TxtRecord {
        TxtRecord::decode(&self.txt)
    }
}

pub(crate) type ResolveCallback = Box<dyn Fn(ResolveHandle, ResolveNotification) + Send>;

/// An instance tracked by a running resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInstance {
    id: String,
    instance_name: String,
    service_type: String,
    domain: String,
    full_name: String,
    host_target: String,
    port: u16,
    addresses: BTreeSet<String>,
    txt: Vec<u8>,
    presence: Presence,
    changed: bool,
}

impl ResolvedInstance {
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

    /// Domain, without trailing dot.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// `instance.type.domain`, unescaped and without trailing dot.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn host_target(&self) -> &str {
        &self.host_target
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The last non-empty address set reported for the instance.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }

    pub fn txt(&self) -> &[u8] {
        &self.txt
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    pub fn changed(&self) -> bool {
        self.changed
    }
}

const RESOLVE_KEYS: &[PropertyKey] = &[
    PropertyKey::HostName,
    PropertyKey::InstanceName,
    PropertyKey::ServiceName,
    PropertyKey::Domain,
    PropertyKey::FullName,
    PropertyKey::IpAddresses,
    PropertyKey::PortNumber,
    PropertyKey::TextAttributes,
];

/// A running resolution engine.
pub(crate) struct Resolve {
    instances: Tracked<ResolvedInstance>,
    worker: Worker,
}

impl Resolve {
    pub(crate) fn start(
        handle: ResolveHandle,
        provider: Arc<dyn Provider>,
        config: &Config,
        service_name: &str,
        service_type: &str,
        domain: Option<&str>,
        callback: ResolveCallback,
    ) -> Result<Self, Error> {
        let query = Query::new(service_type, domain).with_instance_name(service_name);
        let instances = Arc::new(Mutex::new(BTreeMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let resolver = Resolver {
            handle,
            service_name: service_name.to_string(),
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
            name: format!("resolve-{}", handle.0),
            query,
            keys: RESOLVE_KEYS,
            rescan_delay: config.rescan_delay(),
        };
        let worker = Worker::spawn(provider, spec, running, resolver)?;
        Ok(Self { instances, worker })
    }

    /// The shared instance map, for taking snapshots without holding the registry lock.
    pub(crate) fn tracked(&self) -> Tracked<ResolvedInstance> {
        self.instances.clone()
    }

    pub(crate) fn stop(&mut self) {
        self.worker.stop();
    }
}

struct Resolver {
    handle: ResolveHandle,
    service_name: String,
    service_type: String,
    domain: String,
    instances: Tracked<ResolvedInstance>,
    running: Arc<AtomicBool>,
    callback: ResolveCallback,
}

/// The state of an instance as reported by one raw event.
struct Sighting<'a> {
    instance_name: &'a str,
    service_type: String,
    domain: String,
    full_name: String,
    host_target: &'a str,
    port: u16,
    /// Deduplicated, in reported order.
    addresses: Vec<&'a str>,
    txt: Vec<u8>,
}

impl<'a> Sighting<'a> {
    fn read(resolver: &Resolver, id: &str, properties: &'a PropertyBag) -> Option<Self> {
        let Some(instance_name) = properties.text(PropertyKey::InstanceName) else {
            log::warn!("instance {} reported without a name, ignoring", id);
            return None;
        };
        let Some(port) = properties.port(PropertyKey::PortNumber) else {
            log::warn!("instance {} reported without a port, ignoring", id);
            return None;
        };

        let service_type = normalize_domain(
            properties
                .text(PropertyKey::ServiceName)
                .unwrap_or(&resolver.service_type),
        )
        .to_string();
        let domain = normalize_domain(
            properties
                .text(PropertyKey::Domain)
                .filter(|d| !d.is_empty())
                .unwrap_or(&resolver.domain),
        )
        .to_string();
        let full_name = match properties.text(PropertyKey::FullName) {
            Some(full_name) => normalize_domain(full_name).to_string(),
            None => instance_full_name(instance_name, &service_type, &domain),
        };

        let mut addresses = Vec::new();
        for addr in properties.list(PropertyKey::IpAddresses).unwrap_or_default() {
            if !addresses.contains(&addr.as_str()) {
                addresses.push(addr.as_str());
            }
        }

        let txt = TxtRecord::from_attributes(
            properties
                .list(PropertyKey::TextAttributes)
                .unwrap_or_default(),
        )
        .encode();

        Some(Self {
            instance_name,
            service_type,
            domain,
            full_name,
            host_target: properties.text(PropertyKey::HostName).unwrap_or(""),
            port,
            addresses,
            txt,
        })
    }

    fn address_set(&self) -> BTreeSet<String> {
        self.addresses.iter().map(|a| a.to_string()).collect()
    }
}

impl Resolver {
    fn notification(&self, instance: &ResolvedInstance, address: &str) -> ResolveNotification {
        ResolveNotification {
            service_name: self.service_name.clone(),
            service_type: present_domain(&self.service_type),
            domain: present_domain(&self.domain),
            full_name: escape_full_name(&present_domain(&instance.full_name)),
            host_target: if instance.host_target.is_empty() {
                String::new()
            } else {
                present_domain(&instance.host_target)
            },
            address: address.to_string(),
            port: instance.port,
            txt: instance.txt.clone(),
            error: None,
        }
    }

    /// Invokes the callback. The instance map must not be locked, since the callback may query it.
    fn deliver(&self, notification: ResolveNotification) {
        if !self.running.load(Ordering::SeqCst) {
            log::trace!("resolve stopped, dropping {:?}", notification);
            return;
        }
        (self.callback)(self.handle, notification);
    }
}

impl ScanCycle for Resolver {
    fn observe(&mut self, id: &str, properties: &PropertyBag) {
        let Some(sighting) = Sighting::read(self, id, properties) else {
            return;
        };

        let mut instances = lock(&self.instances);
        let instance = match instances.entry(id.to_string()) {
            Entry::Vacant(entry) => {
                log::debug!(
                    "resolved {} at {}:{} {:?}",
                    sighting.full_name,
                    sighting.host_target,
                    sighting.port,
                    sighting.addresses
                );
                let instance = entry.insert(ResolvedInstance {
                    id: id.to_string(),
                    instance_name: sighting.instance_name.to_string(),
                    service_type: sighting.service_type.clone(),
                    domain: sighting.domain.clone(),
                    full_name: sighting.full_name.clone(),
                    host_target: sighting.host_target.to_string(),
                    port: sighting.port,
                    addresses: sighting.address_set(),
                    txt: sighting.txt.clone(),
                    presence: Presence::Added,
                    changed: true,
                });
                if sighting.addresses.is_empty() {
                    log::debug!("{} has no addresses yet", instance.full_name);
                }
                instance
            }
            Entry::Occupied(entry) => {
                let instance = entry.into_mut();
                instance.presence = Presence::Updated;

                let addresses_changed = sighting.addresses.len() != instance.addresses.len()
                    || sighting
                        .addresses
                        .iter()
                        .any(|a| !instance.addresses.contains(*a));
                let txt_changed = sighting.txt != instance.txt;
                let target_changed = sighting.port != instance.port
                    || sighting.host_target != instance.host_target;
                if !(addresses_changed || txt_changed || target_changed) {
                    return;
                }
                if sighting.addresses.is_empty() {
                    // Transient: keep everything until the instance reports addresses again.
                    log::debug!("{} reported no addresses, keeping previous", id);
                    return;
                }

                instance.instance_name = sighting.instance_name.to_string();
                instance.service_type = sighting.service_type.clone();
                instance.domain = sighting.domain.clone();
                instance.full_name = sighting.full_name.clone();
                instance.host_target = sighting.host_target.to_string();
                instance.port = sighting.port;
                instance.addresses = sighting.address_set();
                instance.txt = sighting.txt.clone();
                instance.changed = true;
                instance
            }
        };

        let notifications: Vec<_> = sighting
            .addresses
            .iter()
            .map(|address| self.notification(instance, address))
            .collect();
        drop(instances);

        for notification in notifications {
            self.deliver(notification);
        }
    }

    fn end_cycle(&mut self) {
        lock(&self.instances).retain(|id, instance| {
            if instance.presence == Presence::Removed {
                log::debug!("{} ({}) is gone", instance.full_name, id);
                false
            } else {
                instance.presence = Presence::Removed;
                instance.changed = false;
                true
            }
        });
    }

    fn fail(&mut self, error: Error) {
        self.deliver(ResolveNotification {
            service_name: self.service_name.clone(),
            service_type: present_domain(&self.service_type),
            domain: present_domain(&self.domain),
            full_name: String::new(),
            host_target: String::new(),
            address: String::new(),
            port: 0,
            txt: Vec::new(),
            error: Some(error),
        });
    }
}

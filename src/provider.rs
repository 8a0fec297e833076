//! The discovery provider boundary.
//!
//! A [`Provider`] performs the actual network watch. The engines in [`crate::service`] only ever
//! see the raw [`WatchEvent`]s it emits through an [`EventSink`], and turn them into clean
//! add/remove notifications.

use std::{
    collections::BTreeMap,
    fmt,
    net::SocketAddr,
    sync::Arc,
};

use crate::{name::normalize_domain, txt::TxtRecord, Error};

pub mod local;

/// Properties a watch can request for each reported instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PropertyKey {
    /// Host name the instance is running on (the SRV target).
    HostName,
    InstanceName,
    /// The service type, e.g. `_daap._tcp`.
    ServiceName,
    Domain,
    /// `instance.type.domain`.
    FullName,
    /// Every IP address the host is reachable on, as strings.
    IpAddresses,
    PortNumber,
    /// TXT entries as `key=value` or bare `key` strings.
    TextAttributes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    TextList(Vec<String>),
    Port(u16),
}

/// The property set attached to a raw watch event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PropertyBag {
    map: BTreeMap<PropertyKey, PropertyValue>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: PropertyKey, value: PropertyValue) {
        self.map.insert(key, value);
    }

    /// Builder-style [`PropertyBag::insert`].
    pub fn with(mut self, key: PropertyKey, value: PropertyValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: PropertyKey) -> Option<&PropertyValue> {
        self.map.get(&key)
    }

    /// Returns a text property. Ports are not converted.
    pub fn text(&self, key: PropertyKey) -> Option<&str> {
        match self.map.get(&key)? {
            PropertyValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns a list property. A single text value is treated as a one-element list.
    pub fn list(&self, key: PropertyKey) -> Option<&[String]> {
        match self.map.get(&key)? {
            PropertyValue::TextList(list) => Some(list),
            PropertyValue::Text(s) => Some(std::slice::from_ref(s)),
            PropertyValue::Port(_) => None,
        }
    }

    /// Returns the port property, parsing it if the provider reported it as text.
    pub fn port(&self, key: PropertyKey) -> Option<u16> {
        match self.map.get(&key)? {
            PropertyValue::Port(port) => Some(*port),
            PropertyValue::Text(s) => s.trim().parse().ok(),
            PropertyValue::TextList(_) => None,
        }
    }

    /// Drops every property not listed in `keys`.
    pub fn retain_keys(&mut self, keys: &[PropertyKey]) {
        self.map.retain(|key, _| keys.contains(key));
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// The filter a watch is created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    service_type: String,
    domain: Option<String>,
    instance_name: Option<String>,
}

impl Query {
    /// Creates a query for all instances of `service_type`.
    ///
    /// Trailing dots are removed from `service_type` and `domain`. An empty domain means "the
    /// provider's default domain".
    pub fn new(service_type: &str, domain: Option<&str>) -> Self {
        Self {
            service_type: normalize_domain(service_type).to_string(),
            domain: domain
                .map(normalize_domain)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            instance_name: None,
        }
    }

    /// Restricts the query to instances named `instance_name`.
    pub fn with_instance_name(mut self, instance_name: &str) -> Self {
        self.instance_name = Some(instance_name.to_string());
        self
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.instance_name.as_deref()
    }

    /// Returns whether an instance with the given names satisfies this query.
    ///
    /// Service types and domains compare case-insensitively, as DNS names do.
    pub fn matches(&self, instance_name: &str, service_type: &str, domain: &str) -> bool {
        if !normalize_domain(service_type).eq_ignore_ascii_case(&self.service_type) {
            return false;
        }
        if let Some(d) = &self.domain {
            if !normalize_domain(domain).eq_ignore_ascii_case(d) {
                return false;
            }
        }
        match &self.instance_name {
            Some(name) => name.eq_ignore_ascii_case(instance_name),
            None => true,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.instance_name {
            write!(f, "{}.", name)?;
        }
        f.write_str(&self.service_type)?;
        match &self.domain {
            Some(domain) => write!(f, ".{}", domain),
            None => f.write_str(" (default domain)"),
        }
    }
}

/// A raw event delivered by a provider watch.
///
/// Providers may deliver duplicated and reordered instance events; the engines deduplicate them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Added { id: String, properties: PropertyBag },
    Updated { id: String, properties: PropertyBag },
    Removed { id: String, properties: PropertyBag },
    /// The initial enumeration of matching instances is complete.
    EnumerationCompleted,
    /// The watch has stopped, either because [`Watcher::stop`] was called or because it failed.
    Stopped,
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchEvent::Added { id, .. } => write!(f, "added {}", id),
            WatchEvent::Updated { id, .. } => write!(f, "updated {}", id),
            WatchEvent::Removed { id, .. } => write!(f, "removed {}", id),
            WatchEvent::EnumerationCompleted => f.write_str("enumeration completed"),
            WatchEvent::Stopped => f.write_str("stopped"),
        }
    }
}

/// Lifecycle state of a [`Watcher`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherStatus {
    Created,
    Started,
    EnumerationCompleted,
    Stopping,
    Stopped,
    Aborted,
}

impl WatcherStatus {
    /// Whether [`Watcher::stop`] would have an effect in this state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            WatcherStatus::Started | WatcherStatus::EnumerationCompleted
        )
    }
}

/// Destination for raw watch events.
///
/// Cloneable and callable from any thread. Emitting never blocks; events sent to an engine that
/// has already shut down are dropped.
#[derive(Clone)]
pub struct EventSink {
    emit: Arc<dyn Fn(WatchEvent) + Send + Sync>,
}

impl EventSink {
    pub fn new(emit: impl Fn(WatchEvent) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    pub(crate) fn from_channel(tx: async_channel::Sender<WatchEvent>) -> Self {
        Self::new(move |event| {
            if let Err(e) = tx.try_send(event) {
                log::trace!("engine is gone, dropping {}", e.into_inner());
            }
        })
    }

    pub fn emit(&self, event: WatchEvent) {
        (self.emit)(event)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// A running (or restartable) watch created by [`Provider::watch`].
pub trait Watcher: Send {
    /// Starts or restarts the watch. The provider re-enumerates all matching instances.
    fn start(&mut self) -> Result<(), Error>;

    /// Stops the watch. The provider emits [`WatchEvent::Stopped`] once the watch has stopped.
    fn stop(&mut self);

    fn status(&self) -> WatcherStatus;
}

/// Identifies an advertisement made through [`Provider::advertise`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AdvertisementId(pub u64);

/// A service instance to be advertised.
#[derive(Clone, Debug)]
pub struct Advertisement {
    pub instance_name: String,
    /// Service type without trailing dot.
    pub service_type: String,
    /// Domain without trailing dot.
    pub domain: String,
    pub host_name: String,
    pub port: u16,
    pub txt: TxtRecord,
    /// Address of the listener bound for this service.
    pub listener: SocketAddr,
}

/// Outcome of a registration, as reported by the provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationStatus {
    Success,
    InvalidServiceName,
    SecurityError,
    ServerError,
}

#[derive(Clone, Debug)]
pub struct Advertised {
    pub id: AdvertisementId,
    pub status: RegistrationStatus,
    /// The instance name the provider actually used. May be the bare instance name or the full
    /// `instance.type.domain` name.
    pub instance_name: String,
    /// Set when the provider renamed the instance, e.g. to resolve a name collision.
    pub instance_name_changed: bool,
}

/// The platform facility performing the actual network-level watch and advertising.
pub trait Provider: Send + Sync + 'static {
    /// Called once when a [`Context`](crate::Context) is created.
    fn initialize(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Creates a watch for instances matching `query`, reporting `keys` for every instance.
    ///
    /// The returned watcher is not started yet.
    fn watch(
        &self,
        query: &Query,
        keys: &[PropertyKey],
        sink: EventSink,
    ) -> Result<Box<dyn Watcher>, Error>;

    /// Returns the name of this host in `domain`, if there is one.
    fn local_host_name(&self, domain: &str) -> Option<String>;

    /// Advertises a service instance. May block.
    fn advertise(&self, ad: Advertisement) -> Result<Advertised, Error> {
        let _ = ad;
        Err(Error::Unspecified("provider does not support advertising".into()))
    }

    /// Withdraws an advertisement made with [`Provider::advertise`].
    fn withdraw(&self, id: AdvertisementId) {
        let _ = id;
    }
}

impl<P: Provider> Provider for Arc<P> {
    fn initialize(&self) -> Result<(), Error> {
        (**self).initialize()
    }

    fn watch(
        &self,
        query: &Query,
        keys: &[PropertyKey],
        sink: EventSink,
    ) -> Result<Box<dyn Watcher>, Error> {
        (**self).watch(query, keys, sink)
    }

    fn local_host_name(&self, domain: &str) -> Option<String> {
        (**self).local_host_name(domain)
    }

    fn advertise(&self, ad: Advertisement) -> Result<Advertised, Error> {
        (**self).advertise(ad)
    }

    fn withdraw(&self, id: AdvertisementId) {
        (**self).withdraw(id)
    }
}

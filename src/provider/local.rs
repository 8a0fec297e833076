//! An in-process discovery provider.
//!
//! [`LocalProvider`] keeps its own table of advertisements and answers watches from it. Engines
//! that share one provider (for example through an `Arc<LocalProvider>` handed to several
//! contexts) see each other's registrations, which is enough to run the full discover, resolve and
//! register flow without touching the network.

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    name::{instance_full_name, normalize_domain},
    service::lock,
    txt::TxtRecord,
    Error,
};

use super::{
    Advertised, Advertisement, AdvertisementId, EventSink, PropertyBag, PropertyKey,
    PropertyValue, Provider, Query, RegistrationStatus, WatchEvent, Watcher, WatcherStatus,
};

/// Maximum length of an instance name, in bytes (the DNS label limit).
const MAX_INSTANCE_NAME_LEN: usize = 63;

/// A provider answering watches from an in-memory advertisement table.
pub struct LocalProvider {
    db: Arc<Mutex<RecordDb>>,
    next_id: AtomicU64,
    host_name: String,
    addresses: Vec<IpAddr>,
    scan_interval: Duration,
}

impl LocalProvider {
    const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(1);

    /// Creates a provider using the system host name and no addresses.
    pub fn new() -> Self {
        let host_name = match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                log::debug!("failed to query host name: {}", e);
                String::new()
            }
        };
        Self {
            db: Arc::new(Mutex::new(RecordDb::default())),
            next_id: AtomicU64::new(1),
            host_name,
            addresses: Vec::new(),
            scan_interval: Self::DEFAULT_SCAN_INTERVAL,
        }
    }

    /// Sets the host name advertisements are published under.
    ///
    /// An empty host name makes [`Provider::local_host_name`] report no host name at all.
    pub fn set_host_name(&mut self, host_name: impl Into<String>) {
        self.host_name = host_name.into();
    }

    /// Adds an address that is reported for every advertised instance.
    pub fn add_address(&mut self, addr: IpAddr) {
        if !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
    }

    /// Sets how long a watch waits after enumerating all instances before it reports
    /// [`WatchEvent::EnumerationCompleted`].
    pub fn set_scan_interval(&mut self, interval: Duration) {
        self.scan_interval = interval;
    }

    /// Returns the number of advertisements currently published.
    pub fn advertisement_count(&self) -> usize {
        lock(&self.db).entries.len()
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for LocalProvider {
    fn initialize(&self) -> Result<(), Error> {
        log::debug!(
            "local provider on host '{}' with addresses {:?}",
            self.host_name,
            self.addresses
        );
        Ok(())
    }

    fn watch(
        &self,
        query: &Query,
        keys: &[PropertyKey],
        sink: EventSink,
    ) -> Result<Box<dyn Watcher>, Error> {
        Ok(Box::new(LocalWatcher {
            db: self.db.clone(),
            addresses: self.addresses.iter().map(IpAddr::to_string).collect(),
            query: query.clone(),
            keys: keys.to_vec(),
            sink,
            interval: self.scan_interval,
            shared: Arc::new(WatchState {
                status: Mutex::new(WatcherStatus::Created),
                cond: Condvar::new(),
            }),
            thread: None,
        }))
    }

    fn local_host_name(&self, domain: &str) -> Option<String> {
        if self.host_name.is_empty() {
            return None;
        }
        let host = normalize_domain(&self.host_name);
        let domain = normalize_domain(domain);
        if host
            .to_ascii_lowercase()
            .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
        {
            Some(host.to_string())
        } else {
            Some(format!("{}.{}", host, domain))
        }
    }

    fn advertise(&self, ad: Advertisement) -> Result<Advertised, Error> {
        let service_type = normalize_domain(&ad.service_type).to_string();
        let domain = normalize_domain(&ad.domain).to_string();

        if ad.instance_name.is_empty() || ad.instance_name.len() > MAX_INSTANCE_NAME_LEN {
            log::debug!("rejecting instance name '{}'", ad.instance_name);
            return Ok(Advertised {
                id: AdvertisementId(0),
                status: RegistrationStatus::InvalidServiceName,
                instance_name: ad.instance_name,
                instance_name_changed: false,
            });
        }

        let mut db = lock(&self.db);
        let mut instance_name = ad.instance_name.clone();
        let mut n = 2;
        while db.contains(&instance_name, &service_type, &domain) {
            instance_name = format!("{} ({})", ad.instance_name, n);
            n += 1;
        }
        let instance_name_changed = instance_name != ad.instance_name;
        if instance_name_changed {
            log::info!(
                "'{}' is taken, advertising as '{}'",
                ad.instance_name,
                instance_name
            );
        }

        let id = AdvertisementId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let full_name = instance_full_name(&instance_name, &service_type, &domain);
        log::info!(
            "advertising {} on {}:{} (listener {})",
            full_name,
            ad.host_name,
            ad.port,
            ad.listener
        );
        db.entries.push(Entry {
            id,
            instance_name,
            service_type,
            domain,
            host_name: ad.host_name,
            port: ad.port,
            txt: ad.txt,
        });

        Ok(Advertised {
            id,
            status: RegistrationStatus::Success,
            instance_name: full_name,
            instance_name_changed,
        })
    }

    fn withdraw(&self, id: AdvertisementId) {
        let mut db = lock(&self.db);
        let before = db.entries.len();
        db.entries.retain(|entry| entry.id != id);
        if db.entries.len() == before {
            log::debug!("withdraw of unknown advertisement {:?}", id);
        }
    }
}

#[derive(Default)]
struct RecordDb {
    // Linear scans are fine, this table only ever holds a handful of entries.
    entries: Vec<Entry>,
}

impl RecordDb {
    fn contains(&self, instance_name: &str, service_type: &str, domain: &str) -> bool {
        self.entries.iter().any(|entry| {
            entry.instance_name.eq_ignore_ascii_case(instance_name)
                && entry.service_type.eq_ignore_ascii_case(service_type)
                && entry.domain.eq_ignore_ascii_case(domain)
        })
    }
}

struct Entry {
    id: AdvertisementId,
    instance_name: String,
    service_type: String,
    domain: String,
    host_name: String,
    port: u16,
    txt: TxtRecord,
}

impl Entry {
    fn device_id(&self) -> String {
        format!("local#{}", self.id.0)
    }

    fn properties(&self, addresses: &[String], keys: &[PropertyKey]) -> PropertyBag {
        let mut bag = PropertyBag::new()
            .with(
                PropertyKey::InstanceName,
                PropertyValue::Text(self.instance_name.clone()),
            )
            .with(
                PropertyKey::ServiceName,
                PropertyValue::Text(self.service_type.clone()),
            )
            .with(PropertyKey::Domain, PropertyValue::Text(self.domain.clone()))
            .with(
                PropertyKey::FullName,
                PropertyValue::Text(instance_full_name(
                    &self.instance_name,
                    &self.service_type,
                    &self.domain,
                )),
            )
            .with(
                PropertyKey::HostName,
                PropertyValue::Text(self.host_name.clone()),
            )
            .with(
                PropertyKey::IpAddresses,
                PropertyValue::TextList(addresses.to_vec()),
            )
            .with(PropertyKey::PortNumber, PropertyValue::Port(self.port))
            .with(
                PropertyKey::TextAttributes,
                PropertyValue::TextList(self.txt.to_attributes()),
            );
        bag.retain_keys(keys);
        bag
    }
}

struct WatchState {
    status: Mutex<WatcherStatus>,
    cond: Condvar,
}

struct LocalWatcher {
    db: Arc<Mutex<RecordDb>>,
    addresses: Vec<String>,
    query: Query,
    keys: Vec<PropertyKey>,
    sink: EventSink,
    interval: Duration,
    shared: Arc<WatchState>,
    thread: Option<JoinHandle<()>>,
}

impl LocalWatcher {
    fn snapshot(&self) -> Vec<(String, PropertyBag)> {
        lock(&self.db)
            .entries
            .iter()
            .filter(|entry| {
                self.query
                    .matches(&entry.instance_name, &entry.service_type, &entry.domain)
            })
            .map(|entry| {
                (
                    entry.device_id(),
                    entry.properties(&self.addresses, &self.keys),
                )
            })
            .collect()
    }
}

impl Watcher for LocalWatcher {
    fn start(&mut self) -> Result<(), Error> {
        {
            let mut status = lock(&self.shared.status);
            if status.is_active() {
                return Err(Error::Unspecified(format!(
                    "watch for {} already running",
                    self.query
                )));
            }
            *status = WatcherStatus::Started;
        }
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }

        let instances = self.snapshot();
        let sink = self.sink.clone();
        let shared = self.shared.clone();
        let interval = self.interval;
        let spawned = thread::Builder::new()
            .name("local-enumeration".into())
            .spawn(move || {
                for (id, properties) in instances {
                    if *lock(&shared.status) != WatcherStatus::Started {
                        return;
                    }
                    sink.emit(WatchEvent::Added { id, properties });
                }

                let deadline = Instant::now() + interval;
                let mut status = lock(&shared.status);
                while *status == WatcherStatus::Started {
                    let now = Instant::now();
                    if now >= deadline {
                        *status = WatcherStatus::EnumerationCompleted;
                        drop(status);
                        sink.emit(WatchEvent::EnumerationCompleted);
                        return;
                    }
                    status = match shared.cond.wait_timeout(status, deadline - now) {
                        Ok((status, _)) => status,
                        Err(poison) => poison.into_inner().0,
                    };
                }
            });

        match spawned {
            Ok(thread) => {
                self.thread = Some(thread);
                Ok(())
            }
            Err(e) => {
                *lock(&self.shared.status) = WatcherStatus::Aborted;
                Err(e.into())
            }
        }
    }

    fn stop(&mut self) {
        {
            let mut status = lock(&self.shared.status);
            if !status.is_active() {
                return;
            }
            *status = WatcherStatus::Stopping;
            self.shared.cond.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            thread.join().ok();
        }
        *lock(&self.shared.status) = WatcherStatus::Stopped;
        self.sink.emit(WatchEvent::Stopped);
    }

    fn status(&self) -> WatcherStatus {
        *lock(&self.shared.status)
    }
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, sync::mpsc};

    use super::*;

    fn provider() -> LocalProvider {
        let mut provider = LocalProvider::new();
        provider.set_host_name("testhost");
        provider.add_address(Ipv4Addr::new(192, 168, 1, 7).into());
        provider.set_scan_interval(Duration::from_millis(20));
        provider
    }

    fn ad(name: &str) -> Advertisement {
        Advertisement {
            instance_name: name.into(),
            service_type: "_daap._tcp".into(),
            domain: "local".into(),
            host_name: "testhost.local".into(),
            port: 3689,
            txt: [("MaxUsers", "20")].into_iter().collect(),
            listener: "0.0.0.0:40000".parse().unwrap(),
        }
    }

    #[test]
    fn host_names() {
        let mut provider = provider();
        assert_eq!(
            provider.local_host_name("local.").as_deref(),
            Some("testhost.local")
        );
        provider.set_host_name("box.local");
        assert_eq!(
            provider.local_host_name("local").as_deref(),
            Some("box.local")
        );
        provider.set_host_name("");
        assert_eq!(provider.local_host_name("local"), None);
    }

    #[test]
    fn collisions_are_renamed() {
        let provider = provider();
        let first = provider.advertise(ad("MyService")).unwrap();
        assert_eq!(first.status, RegistrationStatus::Success);
        assert!(!first.instance_name_changed);
        assert_eq!(first.instance_name, "MyService._daap._tcp.local");

        let second = provider.advertise(ad("myservice")).unwrap();
        assert!(second.instance_name_changed);
        assert_eq!(second.instance_name, "myservice (2)._daap._tcp.local");

        provider.withdraw(first.id);
        provider.withdraw(first.id);
        assert_eq!(provider.advertisement_count(), 1);

        let bad = provider.advertise(ad(&"x".repeat(64))).unwrap();
        assert_eq!(bad.status, RegistrationStatus::InvalidServiceName);
        assert_eq!(provider.advertisement_count(), 1);
    }

    #[test]
    fn scan_cycle() {
        let provider = provider();
        provider.advertise(ad("MyService")).unwrap();
        let mut other = ad("Other");
        other.service_type = "_http._tcp".into();
        provider.advertise(other).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sink = EventSink::new(move |event| {
            tx.lock().unwrap().send(event).ok();
        });
        let mut watcher = provider
            .watch(
                &Query::new("_daap._tcp.", None),
                &[PropertyKey::InstanceName, PropertyKey::TextAttributes],
                sink,
            )
            .unwrap();
        assert_eq!(watcher.status(), WatcherStatus::Created);
        watcher.start().unwrap();
        assert!(watcher.start().is_err());

        let timeout = Duration::from_secs(5);
        match rx.recv_timeout(timeout).unwrap() {
            WatchEvent::Added { id, properties } => {
                assert_eq!(id, "local#1");
                assert_eq!(properties.text(PropertyKey::InstanceName), Some("MyService"));
                assert_eq!(
                    properties.list(PropertyKey::TextAttributes),
                    Some(&["MaxUsers=20".to_string()][..])
                );
                assert_eq!(properties.get(PropertyKey::PortNumber), None);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            rx.recv_timeout(timeout).unwrap(),
            WatchEvent::EnumerationCompleted
        );
        assert_eq!(watcher.status(), WatcherStatus::EnumerationCompleted);

        watcher.stop();
        assert_eq!(rx.recv_timeout(timeout).unwrap(), WatchEvent::Stopped);
        assert_eq!(watcher.status(), WatcherStatus::Stopped);

        // Restarting enumerates again.
        watcher.start().unwrap();
        assert!(matches!(
            rx.recv_timeout(timeout).unwrap(),
            WatchEvent::Added { .. }
        ));
        watcher.stop();
        watcher.stop();
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.last(), Some(&WatchEvent::Stopped));
        assert_eq!(
            events.iter().filter(|e| **e == WatchEvent::Stopped).count(),
            1
        );
    }
}

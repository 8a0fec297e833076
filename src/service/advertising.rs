//! Service registration.

use std::{
    io,
    net::{Ipv4Addr, SocketAddrV4, TcpListener},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    name::{granted_instance_name, present_domain},
    provider::{Advertisement, AdvertisementId, Provider, RegistrationStatus},
    txt::TxtRecord,
    Error,
};

use super::lock;

/// Opaque handle identifying a registered service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceHandle(pub(crate) u64);

/// Outcome of a registration, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    /// The instance name that was granted. May differ from the requested one after a collision.
    pub name: String,
    /// Service type with trailing dot.
    pub service_type: String,
    /// Domain with trailing dot.
    pub domain: String,
    pub port: u16,
    pub error: Option<Error>,
}

pub(crate) type RegistrationCallback = Box<dyn FnOnce(ServiceHandle, RegistrationResult) + Send>;

/// What to register, after defaults have been applied and validation has passed.
#[derive(Debug, Clone)]
pub(crate) struct ServiceRecord {
    pub(crate) name: String,
    pub(crate) service_type: String,
    pub(crate) domain: String,
    pub(crate) host_name: String,
    pub(crate) port: u16,
    pub(crate) txt: TxtRecord,
}

impl ServiceRecord {
    /// Whether `self` and `other` would advertise the same instance.
    pub(crate) fn same_instance(&self, other: &ServiceRecord) -> bool {
        self.name == other.name
            && self.service_type.eq_ignore_ascii_case(&other.service_type)
            && self.domain.eq_ignore_ascii_case(&other.domain)
    }
}

#[derive(Default)]
struct State {
    listener: Option<TcpListener>,
    advertisement: Option<AdvertisementId>,
    unregistered: bool,
}

/// A registered service and its listener.
pub(crate) struct Registration {
    record: ServiceRecord,
    provider: Arc<dyn Provider>,
    state: Arc<Mutex<State>>,
    thread: Option<JoinHandle<()>>,
}

impl Registration {
    /// Starts the asynchronous part of a registration: binding the listener and advertising.
    pub(crate) fn start(
        handle: ServiceHandle,
        provider: Arc<dyn Provider>,
        record: ServiceRecord,
        callback: RegistrationCallback,
    ) -> Result<Self, Error> {
        let state = Arc::new(Mutex::new(State::default()));
        let thread = thread::Builder::new()
            .name(format!("register-{}", handle.0))
            .spawn({
                let provider = provider.clone();
                let record = record.clone();
                let state = state.clone();
                move || {
                    let result = advertise(&*provider, &record, &state);
                    if let Some(error) = &result.error {
                        log::warn!(
                            "failed to register {}.{}: {}",
                            record.name,
                            record.service_type,
                            error
                        );
                    }
                    callback(handle, result);
                }
            })?;

        Ok(Self {
            record,
            provider,
            state,
            thread: Some(thread),
        })
    }

    pub(crate) fn record(&self) -> &ServiceRecord {
        &self.record
    }

    /// Withdraws the advertisement and closes the listener. Calling this twice is a no-op.
    pub(crate) fn unregister(&mut self) {
        {
            let mut state = lock(&self.state);
            if state.unregistered {
                return;
            }
            state.unregistered = true;
            if let Some(id) = state.advertisement.take() {
                log::info!("withdrawing {}.{}", self.record.name, self.record.service_type);
                self.provider.withdraw(id);
            }
            state.listener = None;
        }

        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                log::error!("registration worker panicked");
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn advertise(
    provider: &dyn Provider,
    record: &ServiceRecord,
    state: &Mutex<State>,
) -> RegistrationResult {
    let mut result = RegistrationResult {
        name: record.name.clone(),
        service_type: present_domain(&record.service_type),
        domain: present_domain(&record.domain),
        port: record.port,
        error: None,
    };

    let listener = match bind_listener() {
        Ok(listener) => listener,
        Err(e) => {
            result.error = Some(e.into());
            return result;
        }
    };
    let listener_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            result.error = Some(e.into());
            return result;
        }
    };
    if record.port == 0 {
        result.port = listener_addr.port();
    }

    let ad = Advertisement {
        instance_name: record.name.clone(),
        service_type: record.service_type.clone(),
        domain: record.domain.clone(),
        host_name: record.host_name.clone(),
        port: result.port,
        txt: record.txt.clone(),
        listener: listener_addr,
    };
    let advertised = match provider.advertise(ad) {
        Ok(advertised) => advertised,
        Err(e) => {
            result.error = Some(match e {
                Error::Unspecified(_) => e,
                e => Error::Unspecified(e.to_string()),
            });
            return result;
        }
    };

    let error = match advertised.status {
        RegistrationStatus::Success => None,
        RegistrationStatus::InvalidServiceName => {
            Some(Error::InvalidServiceName(record.name.clone()))
        }
        RegistrationStatus::SecurityError => Some(Error::SecurityError),
        RegistrationStatus::ServerError => Some(Error::ServerError),
    };
    if error.is_some() {
        result.error = error;
        return result;
    }

    result.name = granted_instance_name(
        &advertised.instance_name,
        &record.service_type,
        &record.domain,
    );
    if advertised.instance_name_changed {
        log::info!("'{}' was registered as '{}'", record.name, result.name);
    }

    let mut state = lock(state);
    if state.unregistered {
        // Unregistered while the provider was busy.
        provider.withdraw(advertised.id);
    } else {
        state.advertisement = Some(advertised.id);
        state.listener = Some(listener);
    }
    result
}

/// Binds the TCP listener a registered service is reachable on. Connections are never accepted.
fn bind_listener() -> io::Result<TcpListener> {
    let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    sock.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;
    sock.listen(16)?;
    Ok(sock.into())
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use crate::provider::{
        local::LocalProvider, Advertised, EventSink, PropertyKey, Query, Watcher,
    };

    use super::*;

    fn record(name: &str, port: u16) -> ServiceRecord {
        ServiceRecord {
            name: name.into(),
            service_type: "_daap._tcp".into(),
            domain: "local".into(),
            host_name: "testhost.local".into(),
            port,
            txt: [("MaxUsers", "20")].into_iter().collect(),
        }
    }

    fn register(
        provider: Arc<dyn Provider>,
        record: ServiceRecord,
    ) -> (Registration, RegistrationResult) {
        let (tx, rx) = mpsc::channel();
        let registration = Registration::start(
            ServiceHandle(3),
            provider,
            record,
            Box::new(move |handle, result| {
                assert_eq!(handle, ServiceHandle(3));
                tx.send(result).unwrap();
            }),
        )
        .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        (registration, result)
    }

    #[test]
    fn register_and_unregister() {
        let provider = Arc::new(LocalProvider::new());
        let (mut reg, result) = register(provider.clone(), record("MyService", 3689));
        assert_eq!(
            result,
            RegistrationResult {
                name: "MyService".into(),
                service_type: "_daap._tcp.".into(),
                domain: "local.".into(),
                port: 3689,
                error: None,
            }
        );
        assert_eq!(provider.advertisement_count(), 1);
        assert!(lock(&reg.state).listener.is_some());

        reg.unregister();
        assert_eq!(provider.advertisement_count(), 0);
        assert!(lock(&reg.state).listener.is_none());
        reg.unregister();
    }

    #[test]
    fn ephemeral_port() {
        let provider = Arc::new(LocalProvider::new());
        let (reg, result) = register(provider, record("MyService", 0));
        assert_eq!(result.error, None);
        assert_ne!(result.port, 0);
        let state = lock(&reg.state);
        let listener = state.listener.as_ref().unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), result.port);
    }

    #[test]
    fn collision_reports_granted_name() {
        let provider = Arc::new(LocalProvider::new());
        let (_first, _) = register(provider.clone(), record("MyService", 1));
        let (_second, result) = register(provider.clone(), record("MyService", 2));
        assert_eq!(result.name, "MyService (2)");
        assert_eq!(result.error, None);
        assert_eq!(provider.advertisement_count(), 2);
    }

    struct Refusing(RegistrationStatus);

    impl Provider for Refusing {
        fn watch(
            &self,
            _: &Query,
            _: &[PropertyKey],
            _: EventSink,
        ) -> Result<Box<dyn Watcher>, Error> {
            Err(Error::Unspecified("not supported".into()))
        }

        fn local_host_name(&self, _: &str) -> Option<String> {
            None
        }

        fn advertise(&self, ad: Advertisement) -> Result<Advertised, Error> {
            Ok(Advertised {
                id: AdvertisementId(1),
                status: self.0,
                instance_name: ad.instance_name,
                instance_name_changed: false,
            })
        }
    }

    #[test]
    fn provider_status_mapping() {
        for (status, expected) in [
            (
                RegistrationStatus::InvalidServiceName,
                Error::InvalidServiceName("MyService".into()),
            ),
            (RegistrationStatus::SecurityError, Error::SecurityError),
            (RegistrationStatus::ServerError, Error::ServerError),
        ] {
            let (_reg, result) = register(
                Arc::new(Refusing(status)),
                record("MyService", 80),
            );
            assert_eq!(result.error, Some(expected));
            assert_eq!(result.name, "MyService");
        }
    }

    #[test]
    fn provider_failure_is_unspecified() {
        // The mock provider does not implement advertising at all.
        let provider: Arc<dyn Provider> = Arc::new(crate::provider::mock::MockProvider::new());
        let (_reg, result) = register(provider, record("MyService", 80));
        assert!(matches!(result.error, Some(Error::Unspecified(_))));
    }

    #[test]
    fn same_instance() {
        let a = record("MyService", 1);
        let mut b = record("MyService", 2);
        assert!(a.same_instance(&b));
        b.service_type = "_DAAP._tcp".into();
        assert!(a.same_instance(&b));
        b.name = "Other".into();
        assert!(!a.same_instance(&b));
    }
}

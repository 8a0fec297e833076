//! The engine context.

use std::{fmt, sync::Arc};

use crate::{
    name::{normalize_domain, ServiceType},
    provider::Provider,
    service::{
        advertising::{Registration, RegistrationResult, ServiceHandle, ServiceRecord},
        discovery::{Discovery, DiscoveryHandle, DiscoveryNotification, ServiceInstance},
        resolution::{Resolve, ResolveHandle, ResolveNotification, ResolvedInstance},
        snapshot, Registry,
    },
    txt::TxtRecord,
    Config, Error,
};

/// Owns every running discovery, resolve and registration of one process.
///
/// Creating a context initializes the provider. Dropping it (or calling [`Context::shutdown`])
/// stops all discoveries and resolves and withdraws all registrations.
///
/// Consumer callbacks run on engine worker threads. A callback may stop its own engine, but must
/// not block on another thread that is stopping that engine.
pub struct Context {
    provider: Arc<dyn Provider>,
    config: Config,
    discoveries: Registry<Discovery>,
    resolves: Registry<Resolve>,
    services: Registry<Registration>,
}

impl Context {
    /// Creates a context using the default [`Config`].
    pub fn new<P: Provider>(provider: P) -> Result<Self, Error> {
        Self::with_config(provider, Config::default())
    }

    pub fn with_config<P: Provider>(provider: P, config: Config) -> Result<Self, Error> {
        provider.initialize()?;
        log::debug!("context created with {:?}", config);
        Ok(Self {
            provider: Arc::new(provider),
            config,
            discoveries: Registry::new(),
            resolves: Registry::new(),
            services: Registry::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts browsing for instances of `service_type` in `domain`.
    ///
    /// `on_change` is invoked once when an instance appears (with [`DiscoveryFlags::ADD`]) and
    /// once when it disappears. If the watch cannot be set up, `on_change` receives a single
    /// notification carrying the error.
    ///
    /// [`DiscoveryFlags::ADD`]: crate::DiscoveryFlags::ADD
    pub fn start_discovery<F>(
        &self,
        service_type: &str,
        domain: Option<&str>,
        on_change: F,
    ) -> Result<DiscoveryHandle, Error>
    where
        F: Fn(DiscoveryHandle, DiscoveryNotification) + Send + 'static,
    {
        if normalize_domain(service_type).is_empty() {
            return Err(Error::InvalidParameter("service_type"));
        }
        let handle = DiscoveryHandle(self.discoveries.insert_new(|id| {
            Discovery::start(
                DiscoveryHandle(id),
                self.provider.clone(),
                &self.config,
                service_type,
                domain,
                Box::new(on_change),
            )
        })?);
        log::info!("discovery {} started for {}", handle.0, service_type);
        Ok(handle)
    }

    /// Stops a discovery. No notification is delivered after this returns.
    ///
    /// Unknown handles are ignored.
    pub fn stop_discovery(&self, handle: DiscoveryHandle) {
        match self.discoveries.remove(handle.0) {
            Some(mut discovery) => {
                discovery.stop();
                log::info!("discovery {} stopped", handle.0);
            }
            None => log::debug!("stop_discovery: unknown handle {:?}", handle),
        }
    }

    /// Returns a snapshot of the instances a discovery currently tracks.
    pub fn discovered_instances(&self, handle: DiscoveryHandle) -> Option<Vec<ServiceInstance>> {
        let tracked = self.discoveries.with(handle.0, Discovery::tracked)?;
        Some(snapshot(&tracked))
    }

    /// Starts resolving the instance `service_name` of `service_type` in `domain`.
    ///
    /// `on_resolve` is invoked once per address whenever the instance first appears or its
    /// addresses, port, host or TXT record change.
    pub fn start_resolve<F>(
        &self,
        service_name: &str,
        service_type: &str,
        domain: Option<&str>,
        on_resolve: F,
    ) -> Result<ResolveHandle, Error>
    where
        F: Fn(ResolveHandle, ResolveNotification) + Send + 'static,
    {
        if service_name.is_empty() {
            return Err(Error::InvalidParameter("service_name"));
        }
        if normalize_domain(service_type).is_empty() {
            return Err(Error::InvalidParameter("service_type"));
        }
        let handle = ResolveHandle(self.resolves.insert_new(|id| {
            Resolve::start(
                ResolveHandle(id),
                self.provider.clone(),
                &self.config,
                service_name,
                service_type,
                domain,
                Box::new(on_resolve),
            )
        })?);
        log::info!(
            "resolve {} started for {}.{}",
            handle.0,
            service_name,
            service_type
        );
        Ok(handle)
    }

    /// Stops a resolve. No notification is delivered after this returns.
    pub fn stop_resolve(&self, handle: ResolveHandle) {
        match self.resolves.remove(handle.0) {
            Some(mut resolve) => {
                resolve.stop();
                log::info!("resolve {} stopped", handle.0);
            }
            None => log::debug!("stop_resolve: unknown handle {:?}", handle),
        }
    }

    pub fn resolved_instances(&self, handle: ResolveHandle) -> Option<Vec<ResolvedInstance>> {
        let tracked = self.resolves.with(handle.0, Resolve::tracked)?;
        Some(snapshot(&tracked))
    }

    /// Registers a service instance.
    ///
    /// An empty `name` is replaced by the host name, or [`Config::default_service_name`] if that
    /// is unavailable. `domain` defaults to [`Config::default_domain`]. A `port` of 0 advertises
    /// the port of the listener bound for the service.
    ///
    /// Validation failures are returned directly. Everything after that is reported through
    /// `on_result`, which is called exactly once, from another thread.
    pub fn register_service<F>(
        &self,
        name: &str,
        service_type: &str,
        domain: Option<&str>,
        port: u16,
        txt: &TxtRecord,
        on_result: F,
    ) -> Result<ServiceHandle, Error>
    where
        F: FnOnce(ServiceHandle, RegistrationResult) + Send + 'static,
    {
        if normalize_domain(service_type).is_empty() {
            return Err(Error::InvalidParameter("service_type"));
        }
        let service_type = service_type.parse::<ServiceType>()?.to_string();
        let domain = match domain.map(normalize_domain) {
            Some(domain) if !domain.is_empty() => domain.to_string(),
            _ => self.config.default_domain().to_string(),
        };
        let name = if name.is_empty() {
            self.default_name()
        } else {
            name.to_string()
        };
        let host_name = self
            .provider
            .local_host_name(&domain)
            .ok_or(Error::LocalHostnameNotFound)?;

        let record = ServiceRecord {
            name,
            service_type,
            domain,
            host_name,
            port,
            txt: txt.clone(),
        };
        // The entry is visible before the result callback can run, so the callback may
        // unregister it.
        let id = self.services.insert_unless(
            |service| service.record().same_instance(&record),
            |id| {
                log::info!(
                    "registering {}.{}.{} on port {}",
                    record.name,
                    record.service_type,
                    record.domain,
                    record.port
                );
                Registration::start(
                    ServiceHandle(id),
                    self.provider.clone(),
                    record.clone(),
                    Box::new(on_result),
                )
            },
        )?;
        id.map(ServiceHandle).ok_or(Error::ServiceAlreadyExists)
    }

    /// Withdraws a registration. Unknown (or already unregistered) handles are ignored.
    pub fn unregister_service(&self, handle: ServiceHandle) {
        match self.services.remove(handle.0) {
            Some(mut registration) => registration.unregister(),
            None => log::debug!("unregister_service: unknown handle {:?}", handle),
        }
    }

    /// Stops every engine and withdraws every registration.
    pub fn shutdown(self) {
        drop(self);
    }

    fn default_name(&self) -> String {
        match hostname::get() {
            Ok(host) if !host.is_empty() => host.to_string_lossy().into_owned(),
            Ok(_) => self.config.default_service_name().to_string(),
            Err(e) => {
                log::debug!("failed to query host name: {}", e);
                self.config.default_service_name().to_string()
            }
        }
    }

    fn teardown(&self) {
        for mut discovery in self.discoveries.drain() {
            discovery.stop();
        }
        for mut resolve in self.resolves.drain() {
            resolve.stop();
        }
        for mut registration in self.services.drain() {
            registration.unregister();
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
        log::debug!("context shut down");
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("config", &self.config)
            .field("discoveries", &self.discoveries.len())
            .field("resolves", &self.resolves.len())
            .field("services", &self.services.len())
            .finish_non_exhaustive()
    }
}

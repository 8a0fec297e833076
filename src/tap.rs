//! Provider event tapping.

use crate::{
    provider::{
        Advertised, Advertisement, AdvertisementId, EventSink, PropertyKey, Provider, Query,
        WatchEvent, Watcher,
    },
    Error,
};

/// A [`Provider`] wrapper that logs every raw event and advertisement passing through it.
///
/// Events are logged at `debug` level, their property bags at `trace` level. This is useful to
/// see what a provider actually reports before the engines deduplicate it.
pub struct TapProvider<P> {
    inner: P,
}

impl<P: Provider> TapProvider<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: Provider> Provider for TapProvider<P> {
    fn initialize(&self) -> Result<(), Error> {
        let res = self.inner.initialize();
        log::debug!("initialize: {:?}", res);
        res
    }

    fn watch(
        &self,
        query: &Query,
        keys: &[PropertyKey],
        sink: EventSink,
    ) -> Result<Box<dyn Watcher>, Error> {
        log::debug!("watch {} for {:?}", query, keys);
        let label = query.to_string();
        let tapped = EventSink::new(move |event| {
            log::debug!("[{}] {}", label, event);
            match &event {
                WatchEvent::Added { properties, .. }
                | WatchEvent::Updated { properties, .. }
                | WatchEvent::Removed { properties, .. } => {
                    log::trace!("[{}] {:?}", label, properties);
                }
                WatchEvent::EnumerationCompleted | WatchEvent::Stopped => {}
            }
            sink.emit(event);
        });
        self.inner.watch(query, keys, tapped)
    }

    fn local_host_name(&self, domain: &str) -> Option<String> {
        let name = self.inner.local_host_name(domain);
        log::debug!("local host name in {}: {:?}", domain, name);
        name
    }

    fn advertise(&self, ad: Advertisement) -> Result<Advertised, Error> {
        log::debug!(
            "advertise {}.{}.{} port {} txt [{}]",
            ad.instance_name,
            ad.service_type,
            ad.domain,
            ad.port,
            ad.txt
        );
        let res = self.inner.advertise(ad);
        log::debug!("-> {:?}", res);
        res
    }

    fn withdraw(&self, id: AdvertisementId) {
        log::debug!("withdraw {:?}", id);
        self.inner.withdraw(id)
    }
}

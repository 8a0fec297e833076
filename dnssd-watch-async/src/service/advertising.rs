//! Async service registration.

use async_channel::Receiver;
use dnssd_watch::{Context, Error, TxtRecord};

pub use dnssd_watch::service::advertising::*;

/// A registered service whose outcome can be awaited.
///
/// Dropping it withdraws the registration.
pub struct AsyncRegistration<'a> {
    ctx: &'a Context,
    handle: ServiceHandle,
    result: Receiver<RegistrationResult>,
}

impl<'a> AsyncRegistration<'a> {
    /// Registers a service, see [`Context::register_service`].
    pub fn new(
        ctx: &'a Context,
        name: &str,
        service_type: &str,
        domain: Option<&str>,
        port: u16,
        txt: &TxtRecord,
    ) -> Result<Self, Error> {
        let (tx, rx) = async_channel::bounded(1);
        let handle = ctx.register_service(name, service_type, domain, port, txt, move |_, r| {
            tx.try_send(r).ok();
        })?;
        Ok(Self {
            ctx,
            handle,
            result: rx,
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        self.handle
    }

    /// Waits until the provider has accepted or rejected the registration.
    ///
    /// The outcome is delivered once; awaiting it again fails.
    pub async fn registered(&self) -> Result<RegistrationResult, Error> {
        let result = self
            .result
            .recv()
            .await
            .map_err(|_| Error::Unspecified("registration result already taken".into()))?;
        match result.error {
            Some(error) => Err(error),
            None => Ok(result),
        }
    }
}

impl Drop for AsyncRegistration<'_> {
    fn drop(&mut self) {
        self.ctx.unregister_service(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dnssd_watch::provider::local::LocalProvider;
    use futures_lite::future::block_on;

    use super::*;

    #[test]
    fn outcome_is_delivered_once() {
        let mut provider = LocalProvider::new();
        provider.set_host_name("testhost");
        let provider = Arc::new(provider);
        let ctx = Context::new(provider.clone()).unwrap();

        block_on(async {
            let first = AsyncRegistration::new(&ctx, "Printer", "_ipp._tcp", None, 0, &TxtRecord::new())
                .unwrap();
            let result = first.registered().await.unwrap();
            assert_eq!(result.name, "Printer");
            assert_eq!(result.domain, "local.");
            assert_ne!(result.port, 0);
            assert!(first.registered().await.is_err());

            assert!(matches!(
                AsyncRegistration::new(&ctx, "Printer", "_ipp._tcp", None, 0, &TxtRecord::new()),
                Err(Error::ServiceAlreadyExists)
            ));

            drop(first);
            assert_eq!(provider.advertisement_count(), 0);
        });
    }
}

//! Async service resolution.

use std::{
    pin::Pin,
    task::{Context as TaskContext, Poll},
};

use async_channel::Receiver;
use dnssd_watch::{Context, Error};
use futures_lite::Stream;

pub use dnssd_watch::service::resolution::*;

/// A running resolve, yielding one notification per address and change.
///
/// Dropping the stream stops the resolve.
pub struct ResolveStream<'a> {
    ctx: &'a Context,
    handle: ResolveHandle,
    events: Pin<Box<Receiver<ResolveNotification>>>,
}

impl<'a> ResolveStream<'a> {
    pub fn new(
        ctx: &'a Context,
        service_name: &str,
        service_type: &str,
        domain: Option<&str>,
    ) -> Result<Self, Error> {
        let (tx, rx) = async_channel::unbounded();
        let handle = ctx.start_resolve(service_name, service_type, domain, move |_, n| {
            if tx.try_send(n).is_err() {
                log::trace!("resolve stream dropped, discarding notification");
            }
        })?;
        Ok(Self {
            ctx,
            handle,
            events: Box::pin(rx),
        })
    }

    pub fn handle(&self) -> ResolveHandle {
        self.handle
    }

    /// Waits for the next notification that is not a failure.
    ///
    /// Returns the error instead if the resolve failed.
    pub async fn next_address(&mut self) -> Result<ResolveNotification, Error> {
        let notification = self
            .events
            .recv()
            .await
            .map_err(|_| Error::Unspecified("resolve ended".into()))?;
        match notification.error {
            Some(error) => Err(error),
            None => Ok(notification),
        }
    }
}

impl Stream for ResolveStream<'_> {
    type Item = ResolveNotification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

impl Drop for ResolveStream<'_> {
    fn drop(&mut self) {
        self.ctx.stop_resolve(self.handle);
    }
}

//! Async service discovery.

use std::{
    pin::Pin,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use async_channel::Receiver;
use async_io::Timer;
use dnssd_watch::{Context, Error};
use futures_lite::{future, Stream};

pub use dnssd_watch::service::discovery::*;

/// A running discovery, yielding its notifications as a [`Stream`].
///
/// Dropping the stream stops the discovery.
pub struct DiscoveryStream<'a> {
    ctx: &'a Context,
    handle: DiscoveryHandle,
    events: Pin<Box<Receiver<DiscoveryNotification>>>,
}

impl<'a> DiscoveryStream<'a> {
    /// Starts browsing for instances of `service_type` in `domain`.
    pub fn new(ctx: &'a Context, service_type: &str, domain: Option<&str>) -> Result<Self, Error> {
        let (tx, rx) = async_channel::unbounded();
        let handle = ctx.start_discovery(service_type, domain, move |_, notification| {
            if tx.try_send(notification).is_err() {
                log::trace!("discovery stream dropped, discarding notification");
            }
        })?;
        Ok(Self {
            ctx,
            handle,
            events: Box::pin(rx),
        })
    }

    pub fn handle(&self) -> DiscoveryHandle {
        self.handle
    }

    /// Waits for the next notification.
    pub async fn next_notification(&mut self) -> Option<DiscoveryNotification> {
        self.events.recv().await.ok()
    }
}

impl Stream for DiscoveryStream<'_> {
    type Item = DiscoveryNotification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

impl Drop for DiscoveryStream<'_> {
    fn drop(&mut self) {
        self.ctx.stop_discovery(self.handle);
    }
}

/// Browses for `duration` and returns every notification delivered in that time.
pub async fn discover_for(
    ctx: &Context,
    service_type: &str,
    domain: Option<&str>,
    duration: Duration,
) -> Result<Vec<DiscoveryNotification>, Error> {
    let mut stream = DiscoveryStream::new(ctx, service_type, domain)?;
    let mut timer = Timer::after(duration);
    let mut notifications = Vec::new();
    loop {
        let next = future::or(stream.next_notification(), async {
            (&mut timer).await;
            None
        })
        .await;
        match next {
            Some(notification) => notifications.push(notification),
            None => break,
        }
    }
    Ok(notifications)
}

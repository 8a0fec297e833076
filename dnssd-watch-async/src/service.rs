//! Async service discovery, resolution and advertising.

pub mod advertising;
pub mod discovery;
pub mod resolution;

pub use dnssd_watch::service::Presence;

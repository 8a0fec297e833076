//! DNS Service Discovery engines over a pluggable discovery provider.
//!
//! A [`Provider`] performs the network-level watch and reports raw, possibly duplicated events.
//! This crate turns them into clean notifications:
//!
//! - **Discovery** ([`Context::start_discovery`]) reports each instance of a service type exactly
//!   once when it appears and once when it disappears.
//! - **Resolution** ([`Context::start_resolve`]) reports every address of a named instance whenever
//!   its addresses, port or TXT record change.
//! - **Registration** ([`Context::register_service`]) binds a listener and advertises a service
//!   instance, reporting the granted name once.
//!
//! [`LocalProvider`](provider::local::LocalProvider) is an in-process provider that lets engines
//! see each other's registrations without any network traffic.

mod config;
mod context;
mod error;
mod hex;
pub mod name;
pub mod provider;
pub mod service;
pub mod tap;
pub mod txt;

pub use config::{Config, DEFAULT_DOMAIN, DEFAULT_SERVICE_NAME};
pub use context::Context;
pub use error::{Error, Result};
pub use provider::Provider;
pub use service::{
    advertising::{RegistrationResult, ServiceHandle},
    discovery::{DiscoveryFlags, DiscoveryHandle, DiscoveryNotification, ServiceInstance},
    resolution::{ResolveHandle, ResolveNotification, ResolvedInstance},
    Presence,
};
pub use txt::TxtRecord;

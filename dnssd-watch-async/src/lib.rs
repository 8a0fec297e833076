//! Async adapters for the `dnssd-watch` engines.
//!
//! The engines deliver notifications through callbacks on their worker threads. The types in
//! [`service`] forward them into channels and expose them as [`Stream`](futures_lite::Stream)s and
//! futures instead, stopping the underlying engine when dropped.

pub mod service;

pub use dnssd_watch::*;

//! Service names, service types and domain strings.
//!
//! Domain strings are kept without a trailing dot internally, because some providers reject it on
//! input. Everything handed back to the consumer gets the trailing dot re-appended, which is the
//! conventional DNS-SD presentation form.

use std::{
    fmt::{self, Write},
    str::FromStr,
};

use crate::Error;

/// Strips exactly one trailing `.` from `s`, if present.
pub fn normalize_domain(s: &str) -> &str {
    s.strip_suffix('.').unwrap_or(s)
}

/// Appends a trailing `.` to `s`, unless it already ends with one.
pub fn present_domain(s: &str) -> String {
    if s.ends_with('.') {
        s.to_string()
    } else {
        format!("{s}.")
    }
}

/// Transcodes a service's full name into a DNS presentation-safe form.
///
/// Bytes in `[0-9A-Za-z.\-_]` pass through unchanged. Every other byte, including each byte of a
/// non-ASCII character, is written as `\xHH` with two lowercase hex digits.
pub fn escape_full_name(s: &str) -> String {
    Escaped(s.as_bytes()).to_string()
}

struct Escaped<'a>(&'a [u8]);

impl<'a> fmt::Display for Escaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &byte in self.0 {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b'_') {
                f.write_char(byte as char)?;
            } else {
                write!(f, "\\x{:02x}", byte)?;
            }
        }
        Ok(())
    }
}

/// Transport protocol used by a service (`_tcp` or `_udp`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceTransport {
    /// Service uses TCP.
    TCP,
    /// UDP. The service type parser accepts no other transports.
    Other,
}

impl ServiceTransport {
    fn as_str(&self) -> &str {
        match self {
            ServiceTransport::TCP => "_tcp",
            ServiceTransport::Other => "_udp",
        }
    }
}

/// A DNS-SD service type such as `_daap._tcp`.
///
/// The service name always starts with an underscore. A trailing dot is accepted when parsing
/// and dropped.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceType {
    name: String,
    transport: ServiceTransport,
}

impl ServiceType {
    /// Returns the service name, including the leading underscore.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn transport(&self) -> ServiceTransport {
        self.transport
    }
}

impl FromStr for ServiceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidServiceName(s.to_string());

        let (name, transport) = normalize_domain(s).split_once('.').ok_or_else(invalid)?;
        if name.len() < 2 || !name.starts_with('_') || name.contains('.') {
            return Err(invalid());
        }
        let transport = match transport {
            "_tcp" => ServiceTransport::TCP,
            "_udp" => ServiceTransport::Other,
            _ => return Err(invalid()),
        };
        Ok(Self {
            name: name.to_string(),
            transport,
        })
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.transport.as_str())
    }
}

impl fmt::Debug for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Composes `instance.type.domain`, without a trailing dot.
pub(crate) fn instance_full_name(instance: &str, service_type: &str, domain: &str) -> String {
    format!(
        "{}.{}.{}",
        instance,
        normalize_domain(service_type),
        normalize_domain(domain)
    )
}

/// Extracts the instance part of a name reported by a provider.
///
/// Providers are inconsistent about whether they report `MyService` or the full
/// `MyService._http._tcp.local`. The `.type.domain` suffix is stripped when present; otherwise
/// everything from the first dot on is dropped.
pub(crate) fn granted_instance_name(reported: &str, service_type: &str, domain: &str) -> String {
    let reported = normalize_domain(reported);
    let suffix = format!(
        ".{}.{}",
        normalize_domain(service_type),
        normalize_domain(domain)
    );
    if let Some(instance) = reported.strip_suffix(&suffix) {
        return instance.to_string();
    }
    match reported.split_once('.') {
        Some((instance, _)) => instance.to_string(),
        None => reported.to_string(),
    }
}

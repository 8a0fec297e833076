use std::io;

use thiserror::Error;

/// Result type alias used throughout this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by the discovery, resolution and registration engines.
///
/// Errors detected while validating arguments are returned directly from the `start_*` and
/// `register_*` methods. Everything that happens after the call returned is delivered exactly once
/// through the consumer callback instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The provider watch could not be created or started.
    #[error("failed to initialize service watcher: {0}")]
    ProviderInit(String),

    /// No host name in the requested domain could be found for the registered service.
    #[error("no local host name found for the service domain")]
    LocalHostnameNotFound,

    /// A service with the same name, type and domain is already registered in this context.
    #[error("service has already been registered")]
    ServiceAlreadyExists,

    /// The service name or type was rejected.
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),

    /// The provider refused the registration for security reasons.
    #[error("security error during registration")]
    SecurityError,

    /// The provider's server failed while registering.
    #[error("server error during registration")]
    ServerError,

    /// A required argument was missing or empty.
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Unexpected failure in the provider layer.
    #[error("unspecified error: {0}")]
    Unspecified(String),

    /// Socket operation failed while setting up a registration.
    #[error("I/O error: {0}")]
    Io(io::ErrorKind),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e.kind())
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> io::Error {
        match e {
            Error::Io(kind) => kind.into(),
            Error::InvalidParameter(_) | Error::InvalidServiceName(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, e)
            }
            Error::ServiceAlreadyExists => io::Error::new(io::ErrorKind::AlreadyExists, e),
            Error::LocalHostnameNotFound => io::Error::new(io::ErrorKind::AddrNotAvailable, e),
            Error::SecurityError => io::Error::new(io::ErrorKind::PermissionDenied, e),
            _ => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_conversion() {
        let err: Error = io::Error::from(io::ErrorKind::AddrInUse).into();
        assert_eq!(err, Error::Io(io::ErrorKind::AddrInUse));

        let io: io::Error = Error::InvalidParameter("service_type").into();
        assert_eq!(io.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(io.to_string(), "invalid parameter: service_type");
    }
}

use std::time::Duration;

/// Domain used when the consumer does not name one.
pub const DEFAULT_DOMAIN: &str = "local";

/// Instance name used for registrations when no name is given and the host name is unavailable.
pub const DEFAULT_SERVICE_NAME: &str = "My Service";

/// Settings shared by all engines of a [`Context`](crate::Context).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    default_domain: String,
    default_service_name: String,
    rescan_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_domain: DEFAULT_DOMAIN.to_string(),
            default_service_name: DEFAULT_SERVICE_NAME.to_string(),
            rescan_delay: Duration::ZERO,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the domain used by registrations and failure notifications when none is given.
    ///
    /// A trailing dot is removed.
    pub fn set_default_domain(&mut self, domain: impl Into<String>) -> &mut Self {
        let domain = domain.into();
        self.default_domain = crate::name::normalize_domain(&domain).to_string();
        self
    }

    /// Sets the fallback instance name for registrations without a name.
    pub fn set_default_service_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.default_service_name = name.into();
        self
    }

    /// Sets the time an engine waits between the end of one scan cycle and the next.
    ///
    /// Defaults to zero, meaning the watcher is restarted as soon as it has stopped.
    pub fn set_rescan_delay(&mut self, delay: Duration) -> &mut Self {
        self.rescan_delay = delay;
        self
    }

    pub fn default_domain(&self) -> &str {
        &self.default_domain
    }

    pub fn default_service_name(&self) -> &str {
        &self.default_service_name
    }

    pub fn rescan_delay(&self) -> Duration {
        self.rescan_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters() {
        let mut config = Config::new();
        assert_eq!(config.default_domain(), "local");
        assert_eq!(config.default_service_name(), "My Service");
        assert_eq!(config.rescan_delay(), Duration::ZERO);

        config
            .set_default_domain("example.com.")
            .set_rescan_delay(Duration::from_millis(50));
        assert_eq!(config.default_domain(), "example.com");
        assert_eq!(config.rescan_delay(), Duration::from_millis(50));
    }
}

use std::path::PathBuf;
use std::time::Duration;

use crate::agent::AgentError;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hub RPC address (host:port)
    pub hub_addr: String,

    /// Name the hub certificate is verified against; defaults to the host of `hub_addr`
    pub server_name: Option<String>,

    /// CA bundle for the hub certificate; system roots when unset
    pub ca_cert_path: Option<PathBuf>,

    /// Skip hub certificate verification (development only)
    pub insecure: bool,

    /// Cluster name announced in the `cluster-name` call metadata
    pub cluster_name: String,

    /// Where logical connections are dialed (e.g. "127.0.0.1:6443")
    pub target_address: String,

    /// Timeout for dialing the target
    pub connect_timeout: Duration,

    /// Read size for target -> hub forwarding
    pub buffer_size: usize,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl AgentConfig {
    pub fn new(
        hub_addr: impl Into<String>,
        cluster_name: impl Into<String>,
        target_address: impl Into<String>,
    ) -> Self {
        Self {
            hub_addr: hub_addr.into(),
            server_name: None,
            ca_cert_path: None,
            insecure: false,
            cluster_name: cluster_name.into(),
            target_address: target_address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    /// TLS server name for the hub
    pub fn server_name(&self) -> String {
        if let Some(name) = &self.server_name {
            return name.clone();
        }
        // Strip the port, and the brackets of an IPv6 literal
        let host = match self.hub_addr.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => self.hub_addr.as_str(),
        };
        host.trim_start_matches('[').trim_end_matches(']').to_string()
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.cluster_name.is_empty() {
            return Err(AgentError::InvalidConfig(
                "Cluster name cannot be empty".to_string(),
            ));
        }
        if self.hub_addr.is_empty() {
            return Err(AgentError::InvalidConfig(
                "Hub address cannot be empty".to_string(),
            ));
        }
        if !self.target_address.contains(':') {
            return Err(AgentError::InvalidConfig(format!(
                "Invalid target address format '{}'. Expected 'host:port' (e.g., '127.0.0.1:6443')",
                self.target_address
            )));
        }
        if self.initial_backoff.is_zero() || self.max_backoff < self.initial_backoff {
            return Err(AgentError::InvalidConfig(format!(
                "Invalid backoff range {:?}..{:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_name_from_hub_addr() {
        let config = AgentConfig::new("hub.example.com:8091", "edge", "127.0.0.1:6443");
        assert_eq!(config.server_name(), "hub.example.com");

        let config = AgentConfig::new("[::1]:8091", "edge", "127.0.0.1:6443");
        assert_eq!(config.server_name(), "::1");

        let mut config = AgentConfig::new("10.0.0.1:8091", "edge", "127.0.0.1:6443");
        config.server_name = Some("hub.internal".to_string());
        assert_eq!(config.server_name(), "hub.internal");
    }

    #[test]
    fn test_validate() {
        assert!(AgentConfig::new("hub:8091", "edge", "127.0.0.1:6443")
            .validate()
            .is_ok());
        assert!(AgentConfig::new("hub:8091", "", "127.0.0.1:6443")
            .validate()
            .is_err());
        assert!(AgentConfig::new("hub:8091", "edge", "localhost")
            .validate()
            .is_err());

        let mut config = AgentConfig::new("hub:8091", "edge", "127.0.0.1:6443");
        config.max_backoff = Duration::from_millis(10);
        assert!(config.validate().is_err());
    }
}

use clusterproxy_transport::TransportError;
use clusterproxy_transport_h2::{H2Config, H2Connector};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::forwarder::{ForwarderError, TcpForwarder};
use crate::session::AgentSession;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Forwarding error: {0}")]
    Forwarder(#[from] ForwarderError),
}

/// Exponential reconnect delay: doubles per failure up to a ceiling
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Keeps one tunnel to the hub open for a cluster
pub struct Agent {
    config: AgentConfig,
    connector: H2Connector,
    session: AgentSession,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        config.validate()?;

        let mut h2_config = H2Config::client(config.ca_cert_path.clone());
        if config.insecure {
            h2_config = h2_config.with_insecure_skip_verify();
        }
        let connector = H2Connector::new(Arc::new(h2_config))?;

        let forwarder = TcpForwarder::new(config.connect_timeout, config.buffer_size);
        let session = AgentSession::new(config.target_address.clone(), forwarder);

        Ok(Self {
            config,
            connector,
            session,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Connect, serve, and reconnect until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);

        tracing::info!(
            cluster = %self.config.cluster_name,
            hub = %self.config.hub_addr,
            target = %self.config.target_address,
            "Starting agent"
        );

        loop {
            match self.connect_and_serve(&shutdown, &mut backoff).await {
                Ok(()) => tracing::info!(cluster = %self.config.cluster_name, "Tunnel closed"),
                Err(e) => tracing::warn!(cluster = %self.config.cluster_name, "Tunnel failed: {}", e),
            }

            if shutdown.is_cancelled() {
                break;
            }

            let delay = backoff.next_delay();
            tracing::info!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Agent stopped");
        Ok(())
    }

    async fn connect_and_serve(
        &self,
        shutdown: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<(), AgentError> {
        let server_name = self.config.server_name();

        let connection = tokio::select! {
            result = self.connector.connect(&self.config.hub_addr, &server_name) => result?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let (sink, source) = connection.open_tunnel(&self.config.cluster_name).await?;

        tracing::info!(
            cluster = %self.config.cluster_name,
            hub = %connection.remote_address(),
            "Tunnel established"
        );
        backoff.reset();

        self.session
            .run(Box::new(sink), Box::new(source), shutdown)
            .await
    }
}

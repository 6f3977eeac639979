use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::edgetunnel::tunnel::{
    circuit::TunnelConn,
    connections::{DEFAULT_DIAL_TIMEOUT, DialError},
    engine::TunnelServer,
};

/// Dials addresses as seen from one remote peer.
#[derive(Clone)]
pub struct Dialer {
    server: Arc<TunnelServer>,
    remote: String,
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("local", &self.server.id())
            .field("remote", &self.remote)
            .finish()
    }
}

impl Dialer {
    pub fn new(server: Arc<TunnelServer>, remote: impl Into<String>) -> Self {
        Self {
            server,
            remote: remote.into(),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub async fn dial(&self, network: &str, address: &str) -> Result<TunnelConn, DialError> {
        self.dial_timeout(network, address, DEFAULT_DIAL_TIMEOUT)
            .await
    }

    /// `timeout` bounds both the remote dial and the wait for its ack.
    pub async fn dial_timeout(
        &self,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> Result<TunnelConn, DialError> {
        self.dial_deadline(network, address, Some(Instant::now() + timeout))
            .await
    }

    /// Waits for the ack until `deadline` and asks the remote to dial within
    /// the time left. Without a deadline the remote picks its own timeout.
    pub async fn dial_deadline(
        &self,
        network: &str,
        address: &str,
        deadline: Option<Instant>,
    ) -> Result<TunnelConn, DialError> {
        let remote_timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.server
            .open(network, address, remote_timeout, deadline, &self.remote)
            .await
    }
}

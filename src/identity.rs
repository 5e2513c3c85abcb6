use reqwest::Client;
use thiserror::Error;
use tracing::{error, info};

const DEFAULT_PROBE_URL: &str = "https://api.ipify.org";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity probe failed: {0}")]
    Probe(String),
}

/// Boundary query for the VPN collaborator. Consulted exactly once, before a
/// run starts; the orchestrator refuses to start when the answer is false.
pub struct IdentityGate {
    client: Client,
    probe_url: String,
    home_ip: String,
}

impl IdentityGate {
    pub fn new(client: Client, home_ip: impl Into<String>) -> Self {
        Self {
            client,
            probe_url: DEFAULT_PROBE_URL.to_string(),
            home_ip: home_ip.into(),
        }
    }

    /// True when the current egress IP is not the configured home IP. A probe
    /// failure is treated as unsafe; the run must not proceed blind.
    pub async fn is_network_identity_safe(&self) -> Result<bool, IdentityError> {
        let current_ip = self
            .client
            .get(&self.probe_url)
            .send()
            .await
            .map_err(|err| IdentityError::Probe(err.to_string()))?
            .text()
            .await
            .map_err(|err| IdentityError::Probe(err.to_string()))?;
        let current_ip = current_ip.trim().to_string();

        if current_ip == self.home_ip {
            error!(
                target = "lotscout.identity",
                "egress IP matches home IP; VPN is not active"
            );
            return Ok(false);
        }

        info!(target = "lotscout.identity", ip = %current_ip, "identity check passed");
        Ok(true)
    }
}

//! File-based client configuration

use crate::{
    builder::CircuitBuilder,
    circuit::CircuitBreakerConfig,
    errors::{Error, Result},
    executor::RestClientBuilder,
    http_client::{ReqwestTransport, TransportConfig},
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Transport and breaker settings for one client
///
/// ```toml
/// [transport]
/// timeout_secs = 10
///
/// [circuit_breaker]
/// name = "payments"
/// active = true
/// paths = ["/v1/charges"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl ClientConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(format!("invalid TOML config: {e}")))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Config(format!("invalid JSON config: {e}")))
    }

    /// Load from a `.toml` or `.json` file, picked by extension
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_toml_str(&contents),
        }
    }

    /// Client builder over a reqwest transport; hooks can still be added
    pub fn into_builder(self) -> Result<RestClientBuilder> {
        let transport = ReqwestTransport::new(&self.transport)?;
        let mut builder = RestClientBuilder::new(transport);
        if let Some(breaker) = self.circuit_breaker {
            builder = builder.circuit_breaker(CircuitBuilder::from_config(breaker));
        }
        Ok(builder)
    }
}

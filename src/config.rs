use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;

use crate::store::service::ServiceStore;
use crate::store::sheet::SheetStore;
use crate::store::OpStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Service,
    Sheet,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub backend: Backend,
    pub endpoint_url: String,
    /// Static shared credential carried in the `x-sync-token` header.
    pub access_token: String,
    pub batch_limit: usize,
    pub request_timeout_secs: u64,
    pub sync_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Service,
            endpoint_url: String::new(),
            access_token: String::new(),
            batch_limit: 200,
            request_timeout_secs: 30,
            sync_interval_secs: 300,
        }
    }
}

impl SyncConfig {
    /// Reads `DEVHUB_SYNC_*` variables, falling back to defaults.
    pub fn from_env() -> Result<SyncConfig> {
        let mut config = SyncConfig::default();

        if let Ok(backend) = std::env::var("DEVHUB_SYNC_BACKEND") {
            config.backend = match backend.as_str() {
                "service" => Backend::Service,
                "sheet" => Backend::Sheet,
                other => return Err(anyhow!("unknown sync backend: {other}")),
            };
        }
        if let Ok(url) = std::env::var("DEVHUB_SYNC_ENDPOINT") {
            config.endpoint_url = url;
        }
        if let Ok(token) = std::env::var("DEVHUB_SYNC_TOKEN") {
            config.access_token = token;
        }
        if let Ok(limit) = std::env::var("DEVHUB_SYNC_BATCH_LIMIT") {
            config.batch_limit = limit
                .parse()
                .map_err(|_| anyhow!("invalid DEVHUB_SYNC_BATCH_LIMIT: {limit}"))?;
        }
        if let Ok(secs) = std::env::var("DEVHUB_SYNC_TIMEOUT_SECS") {
            config.request_timeout_secs = secs
                .parse()
                .map_err(|_| anyhow!("invalid DEVHUB_SYNC_TIMEOUT_SECS: {secs}"))?;
        }
        if let Ok(secs) = std::env::var("DEVHUB_SYNC_INTERVAL_SECS") {
            config.sync_interval_secs = secs
                .parse()
                .map_err(|_| anyhow!("invalid DEVHUB_SYNC_INTERVAL_SECS: {secs}"))?;
        }

        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn make_store(&self) -> Result<Box<dyn OpStore>> {
        if self.endpoint_url.trim().is_empty() {
            return Err(anyhow!("missing sync endpoint url"));
        }

        Ok(match self.backend {
            Backend::Service => Box::new(ServiceStore::new(
                self.endpoint_url.clone(),
                self.access_token.clone(),
                self.request_timeout(),
            )?),
            Backend::Sheet => Box::new(SheetStore::new(
                self.endpoint_url.clone(),
                self.access_token.clone(),
                self.request_timeout(),
            )?),
        })
    }
}

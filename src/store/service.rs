use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::{AuthFailed, OpStore};
use crate::op::Operation;

const SYNC_TOKEN_HEADER: &str = "x-sync-token";

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    ops: &'a [Operation],
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    cursor: i64,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    ops: Vec<Operation>,
    cursor: i64,
}

#[derive(Debug, Deserialize)]
struct PendingResponse {
    count: i64,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Stateful backend: the server assigns serverSeq from an auto-incrementing
/// column and enforces the uniqueness constraint on op id.
pub struct ServiceStore {
    client: Client,
    base_url: String,
    token: String,
}

impl ServiceStore {
    pub fn new(base_url: String, token: String, timeout: Duration) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(anyhow!("missing service base url"));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    fn check_status(resp: reqwest::blocking::Response) -> Result<reqwest::blocking::Response> {
        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(AuthFailed.into());
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(anyhow!("sync service request failed: HTTP {status} {body}"));
        }
        Ok(resp)
    }
}

impl OpStore for ServiceStore {
    fn push(&self, ops: &[Operation]) -> Result<i64> {
        let resp = self
            .client
            .post(join_url(&self.base_url, "/sync/push"))
            .header(SYNC_TOKEN_HEADER, &self.token)
            .json(&PushRequest { ops })
            .send()?;
        let resp = Self::check_status(resp)?;

        let parsed: PushResponse = resp.json()?;
        Ok(parsed.cursor)
    }

    fn pull(
        &self,
        cursor: i64,
        exclude_client: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<Operation>, i64)> {
        let mut req = self
            .client
            .get(join_url(&self.base_url, "/sync/pull"))
            .header(SYNC_TOKEN_HEADER, &self.token)
            .query(&[("cursor", cursor.to_string()), ("limit", limit.to_string())]);
        if let Some(client_id) = exclude_client {
            req = req.query(&[("excludeClientId", client_id)]);
        }

        let resp = Self::check_status(req.send()?)?;
        let parsed: PullResponse = resp.json()?;
        Ok((parsed.ops, parsed.cursor))
    }

    fn count_pending(&self, cursor: i64, exclude_client: Option<&str>) -> Result<i64> {
        let mut req = self
            .client
            .get(join_url(&self.base_url, "/sync/pending"))
            .header(SYNC_TOKEN_HEADER, &self.token)
            .query(&[("cursor", cursor.to_string())]);
        if let Some(client_id) = exclude_client {
            req = req.query(&[("excludeClientId", client_id)]);
        }

        let resp = Self::check_status(req.send()?)?;
        let parsed: PendingResponse = resp.json()?;
        Ok(parsed.count)
    }

    fn reset(&self) -> Result<()> {
        let resp = self
            .client
            .post(join_url(&self.base_url, "/sync/reset"))
            .header(SYNC_TOKEN_HEADER, &self.token)
            .send()?;
        Self::check_status(resp)?;
        Ok(())
    }

    fn health(&self) -> Result<()> {
        let resp = self
            .client
            .get(join_url(&self.base_url, "/health"))
            .header(SYNC_TOKEN_HEADER, &self.token)
            .send()?;
        let resp = Self::check_status(resp)?;

        let parsed: HealthResponse = resp.json()?;
        if parsed.status != "ok" {
            return Err(anyhow!("sync service unhealthy: {}", parsed.status));
        }
        Ok(())
    }
}

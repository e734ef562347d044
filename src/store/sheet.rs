use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use super::{AuthFailed, OpStore};
use crate::op::Operation;

const SYNC_TOKEN_HEADER: &str = "x-sync-token";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SheetRequest<'a> {
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ops: Option<&'a [Operation]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exclude_client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
}

impl<'a> SheetRequest<'a> {
    fn action(action: &'a str) -> Self {
        Self {
            action,
            ops: None,
            cursor: None,
            exclude_client_id: None,
            limit: None,
        }
    }
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

/// Stateless backend: a spreadsheet behind a single edge-function URL
/// dispatching on an `action` field; serverSeq comes from row position.
pub struct SheetStore {
    client: Client,
    endpoint_url: String,
    token: String,
}

impl SheetStore {
    pub fn new(endpoint_url: String, token: String, timeout: Duration) -> Result<Self> {
        if endpoint_url.trim().is_empty() {
            return Err(anyhow!("missing sheet endpoint url"));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint_url,
            token,
        })
    }

    fn call(&self, request: &SheetRequest<'_>) -> Result<reqwest::blocking::Response> {
        let resp = self
            .client
            .post(&self.endpoint_url)
            .header(SYNC_TOKEN_HEADER, &self.token)
            .json(request)
            .send()?;

        let status = resp.status();
        if status.as_u16() == 401 {
            return Err(AuthFailed.into());
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(anyhow!("sheet sync request failed: HTTP {status} {body}"));
        }
        Ok(resp)
    }
}

impl OpStore for SheetStore {
    fn push(&self, ops: &[Operation]) -> Result<i64> {
        let mut request = SheetRequest::action("push");
        request.ops = Some(ops);

        let resp = self.call(&request)?;
        let parsed: PushResponse = resp.json()?;
        Ok(parsed.cursor)
    }

    fn pull(
        &self,
        cursor: i64,
        exclude_client: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<Operation>, i64)> {
        let mut request = SheetRequest::action("pull");
        request.cursor = Some(cursor);
        request.exclude_client_id = exclude_client;
        request.limit = Some(limit);

        let resp = self.call(&request)?;
        let parsed: PullResponse = resp.json()?;
        Ok((parsed.ops, parsed.cursor))
    }

    fn count_pending(&self, cursor: i64, _exclude_client: Option<&str>) -> Result<i64> {
        // The edge function derives this from its last-seen-sequence counter;
        // the exclusion filter would require a full range read, so it is not
        // forwarded.
        let mut request = SheetRequest::action("pending");
        request.cursor = Some(cursor);

        let resp = self.call(&request)?;
        let parsed: PendingResponse = resp.json()?;
        Ok(parsed.count)
    }

    fn reset(&self) -> Result<()> {
        self.call(&SheetRequest::action("reset"))?;
        Ok(())
    }

    fn health(&self) -> Result<()> {
        let resp = self.call(&SheetRequest::action("health"))?;
        let parsed: HealthResponse = resp.json()?;
        if parsed.status != "ok" {
            return Err(anyhow!("sheet sync endpoint unhealthy: {}", parsed.status));
        }
        Ok(())
    }
}

use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::blocking::Client;
use rusqlite::Connection;

use crate::cycle::Refresh;
use crate::db;

pub const JENKINS_JOBS_CACHE: &str = "jenkins.jobs";
pub const NEWS_FEED_CACHE: &str = "news.feed";

fn jenkins_api_url(base_url: &str) -> String {
    format!(
        "{}/api/json?tree=jobs[name,color,url,lastBuild[number,result,timestamp]]",
        base_url.trim_end_matches('/')
    )
}

/// Fetches the Jenkins job tree with last-build state into the local cache.
/// Jenkins state is per-server, not replicated through the op log.
pub struct JenkinsRefresh {
    client: Client,
    base_url: String,
    username: Option<String>,
    api_token: Option<String>,
}

impl JenkinsRefresh {
    pub fn new(
        base_url: String,
        username: Option<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(anyhow!("missing jenkins base url"));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            username,
            api_token,
        })
    }
}

impl Refresh for JenkinsRefresh {
    fn name(&self) -> &str {
        "jenkins"
    }

    fn run(&self, conn: &Connection) -> Result<()> {
        let mut req = self.client.get(jenkins_api_url(&self.base_url));
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.api_token.as_deref());
        }

        let resp = req.send()?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(anyhow!("jenkins refresh failed: HTTP {status} {body}"));
        }

        let body = resp.text()?;
        let parsed: serde_json::Value = serde_json::from_str(&body)?;
        if !parsed["jobs"].is_array() {
            return Err(anyhow!("jenkins response missing jobs array"));
        }

        db::put_cache(conn, JENKINS_JOBS_CACHE, &body)?;
        tracing::debug!(
            jobs = parsed["jobs"].as_array().map(|j| j.len()).unwrap_or(0),
            "refreshed jenkins job cache"
        );
        Ok(())
    }
}

/// Fetches the news feed document into the local cache.
pub struct NewsRefresh {
    client: Client,
    feed_url: String,
}

impl NewsRefresh {
    pub fn new(feed_url: String, timeout: Duration) -> Result<Self> {
        if feed_url.trim().is_empty() {
            return Err(anyhow!("missing news feed url"));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, feed_url })
    }
}

impl Refresh for NewsRefresh {
    fn name(&self) -> &str {
        "news"
    }

    fn run(&self, conn: &Connection) -> Result<()> {
        let resp = self.client.get(&self.feed_url).send()?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("news refresh failed: HTTP {status}"));
        }

        let body = resp.text()?;
        db::put_cache(conn, NEWS_FEED_CACHE, &body)?;
        Ok(())
    }
}

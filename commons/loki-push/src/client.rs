use std::time::Duration;

use reqwest::{Url, header::CONTENT_TYPE};
use tracing::{debug, trace};

use crate::{
    error::PushError,
    payload::{PushRequest, PushStream},
};

pub const PUSH_PATH: &str = "/loki/api/v1/push";
pub const READY_PATH: &str = "/ready";

#[derive(Clone, Debug)]
pub struct LokiClient {
    http: reqwest::Client,
    push_url: Url,
    ready_url: Url,
}

impl LokiClient {
    /// Build a client for the given push endpoint.
    ///
    /// The readiness endpoint lives next to the push API: a push URL of
    /// `http://loki:3100/loki/api/v1/push` probes `http://loki:3100/ready`.
    pub fn new(push_url: &str, timeout: Duration) -> Result<Self, PushError> {
        let push_url = Url::parse(push_url)
            .map_err(|e| PushError::InvalidUrl(format!("{push_url}: {e}")))?;
        if !matches!(push_url.scheme(), "http" | "https") {
            return Err(PushError::InvalidUrl(format!(
                "{push_url}: scheme must be http or https"
            )));
        }
        let ready_url = ready_url_for(&push_url);
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            push_url,
            ready_url,
        })
    }

    pub fn push_url(&self) -> &str {
        self.push_url.as_str()
    }

    pub fn ready_url(&self) -> &str {
        self.ready_url.as_str()
    }

    pub async fn push(&self, streams: &[PushStream]) -> Result<(), PushError> {
        if streams.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(&PushRequest::from_streams(streams))?;
        trace!(url = %self.push_url, bytes = body.len(), "loki push");
        let resp = self
            .http
            .post(self.push_url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        check_status(resp).await
    }

    pub async fn ready(&self) -> Result<(), PushError> {
        let resp = self.http.get(self.ready_url.clone()).send().await?;
        check_status(resp).await?;
        debug!(url = %self.ready_url, "loki ready");
        Ok(())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<(), PushError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(PushError::Status { status, body })
}

fn ready_url_for(push_url: &Url) -> Url {
    let path = push_url.path();
    let prefix = path.strip_suffix(PUSH_PATH).unwrap_or("");
    let mut ready = push_url.clone();
    ready.set_path(&format!("{prefix}{READY_PATH}"));
    ready.set_query(None);
    ready
}

//! HTTP client for the remote entity service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Remote, RemoteError, RemoteResult};
use crate::cache::EntityKind;
use crate::config::RemoteConfig;

/// JSON-over-HTTP remote with bearer auth.
#[derive(Clone)]
pub struct HttpRemote {
  client: Client,
  base: Url,
  token: String,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, token: String) -> Result<Self> {
    // Url::join drops the last path segment unless the base ends with a slash
    let mut raw = config.url.clone();
    if !raw.ends_with('/') {
      raw.push('/');
    }
    let base = Url::parse(&raw).map_err(|e| eyre!("Invalid remote url {}: {}", config.url, e))?;

    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  fn url(&self, path: &str) -> RemoteResult<Url> {
    self
      .base
      .join(path)
      .map_err(|e| RemoteError::Decode(format!("bad path {}: {}", path, e)))
  }

  fn collection(&self, kind: EntityKind) -> RemoteResult<Url> {
    self.url(&format!("{}s", kind.name()))
  }

  fn member(&self, kind: EntityKind, server_id: i64) -> RemoteResult<Url> {
    self.url(&format!("{}s/{}", kind.name(), server_id))
  }

  async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
    let response = request
      .bearer_auth(&self.token)
      .send()
      .await
      .map_err(|e| RemoteError::Network(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, body))
  }

  async fn json(&self, request: RequestBuilder) -> RemoteResult<Value> {
    self
      .send(request)
      .await?
      .json()
      .await
      .map_err(|e| RemoteError::Decode(e.to_string()))
  }
}

fn classify(status: StatusCode, body: String) -> RemoteError {
  match status {
    StatusCode::CONFLICT => RemoteError::IdentityCollision,
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(body),
    StatusCode::NOT_FOUND => RemoteError::NotFound,
    _ => RemoteError::Server {
      status: status.as_u16(),
      message: body,
    },
  }
}

#[async_trait]
impl Remote for HttpRemote {
  async fn create(&self, kind: EntityKind, dto: Value) -> RemoteResult<Value> {
    let url = self.collection(kind)?;
    debug!(kind = %kind, %url, "POST");
    self.json(self.client.post(url).json(&dto)).await
  }

  async fn read_one(&self, kind: EntityKind, server_id: i64) -> RemoteResult<Value> {
    let url = self.member(kind, server_id)?;
    debug!(kind = %kind, %url, "GET");
    self.json(self.client.get(url)).await
  }

  async fn read_since(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<Value>> {
    let mut url = self.collection(kind)?;
    if let Some(since) = since {
      url
        .query_pairs_mut()
        .append_pair("since", &since.to_rfc3339());
    }
    debug!(kind = %kind, %url, "GET");
    match self.json(self.client.get(url)).await? {
      Value::Array(items) => Ok(items),
      other => Err(RemoteError::Decode(format!("expected a list of {}s, got {}", kind, other))),
    }
  }

  async fn update(&self, kind: EntityKind, server_id: i64, dto: Value) -> RemoteResult<Value> {
    let url = self.member(kind, server_id)?;
    debug!(kind = %kind, %url, "PUT");
    self.json(self.client.put(url).json(&dto)).await
  }

  async fn delete(&self, kind: EntityKind, server_id: i64) -> RemoteResult<()> {
    let url = self.member(kind, server_id)?;
    debug!(kind = %kind, %url, "DELETE");
    self.send(self.client.delete(url)).await?;
    Ok(())
  }

  async fn is_online(&self) -> bool {
    // Any HTTP answer means the service is reachable
    self.client.head(self.base.clone()).send().await.is_ok()
  }
}

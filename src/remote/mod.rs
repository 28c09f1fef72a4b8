//! Boundary to the remote entity service.

mod http;

#[cfg(test)]
pub mod fake;

pub use http::HttpRemote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::cache::EntityKind;

/// Failures the remote service can report. Replay recovery is decided per variant.
#[derive(Debug, Error)]
pub enum RemoteError {
  #[error("client identity is already taken")]
  IdentityCollision,
  #[error("not authorized: {0}")]
  Unauthorized(String),
  #[error("entity not found")]
  NotFound,
  #[error("network unreachable: {0}")]
  Network(String),
  #[error("server error {status}: {message}")]
  Server { status: u16, message: String },
  #[error("malformed payload: {0}")]
  Decode(String),
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// CRUD surface of the remote service, per entity kind. Every response is the
/// canonical server state, including `id`, `client_id` and timestamps.
#[async_trait]
pub trait Remote: Send + Sync {
  async fn create(&self, kind: EntityKind, dto: Value) -> RemoteResult<Value>;

  async fn read_one(&self, kind: EntityKind, server_id: i64) -> RemoteResult<Value>;

  /// Every record changed after `since`, or all records when `since` is `None`.
  async fn read_since(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<Value>>;

  async fn update(&self, kind: EntityKind, server_id: i64, dto: Value) -> RemoteResult<Value>;

  async fn delete(&self, kind: EntityKind, server_id: i64) -> RemoteResult<()>;

  async fn is_online(&self) -> bool;
}

/// Server-assigned `updated_at` of a response, if present and well formed.
pub fn updated_at(data: &Value) -> Option<DateTime<Utc>> {
  data
    .get("updated_at")
    .and_then(Value::as_str)
    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    .map(|dt| dt.with_timezone(&Utc))
}

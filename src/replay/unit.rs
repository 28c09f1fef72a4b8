//! Replayable record of one local mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CacheManager, ClientId, EntityKind, KindError};
use crate::remote::{Remote, RemoteError, RemoteResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
  Create,
  Update,
  Delete,
}

impl std::fmt::Display for Action {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      Action::Create => "create",
      Action::Update => "update",
      Action::Delete => "delete",
    };
    f.write_str(name)
  }
}

/// What a successful replay did to the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  Confirmed,
  Deleted,
  /// The target is no longer tracked; nothing was sent.
  Skipped,
  /// The server took the mutation but its reply could not be applied.
  Unconfirmed,
}

/// One queued mutation. The payload is only the target identity: the DTO is
/// built from the entity when the unit is replayed, so later edits to the
/// same entity ride along with an earlier unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationUnit {
  pub seq: u64,
  pub kind: EntityKind,
  pub action: Action,
  pub target: ClientId,
  pub issued_at: DateTime<Utc>,
}

impl MutationUnit {
  /// Send this mutation and fold the server's answer back into the cache.
  pub async fn replay(&self, manager: &mut CacheManager, remote: &dyn Remote) -> RemoteResult<Outcome> {
    let kind = self.kind;
    let Some(entity) = manager.peek(kind, &self.target) else {
      warn!(kind = %kind, id = %self.target, action = %self.action, "target no longer tracked, skipping");
      return Ok(Outcome::Skipped);
    };
    let entity = entity.as_cacheable();
    let server_id = entity.server_id();

    match (self.action, server_id) {
      (Action::Delete, None) => {
        // Never reached the server
        manager.untrack(kind, &self.target);
        Ok(Outcome::Deleted)
      }
      (Action::Delete, Some(server_id)) => {
        match remote.delete(kind, server_id).await {
          Ok(()) | Err(RemoteError::NotFound) => {}
          Err(e) => return Err(e),
        }
        manager.untrack(kind, &self.target);
        Ok(Outcome::Deleted)
      }
      (Action::Create | Action::Update, None) => {
        let dto = entity
          .to_create_dto()
          .map_err(|e| RemoteError::Decode(e.to_string()))?;
        debug!(kind = %kind, id = %entity.client_id(), "replaying create");
        let response = remote.create(kind, dto).await?;
        self.confirm(manager, response)
      }
      (Action::Create | Action::Update, Some(server_id)) => {
        let dto = entity
          .to_update_dto()
          .map_err(|e| RemoteError::Decode(e.to_string()))?;
        debug!(kind = %kind, id = %entity.client_id(), server_id, "replaying update");
        let response = remote.update(kind, server_id, dto).await?;
        self.confirm(manager, response)
      }
    }
  }

  /// The remote already applied the mutation, so a reply that does not parse
  /// must not send the unit around again. A create keeps the server id when the
  /// reply carries one; the pending edits stay dirty until the next refresh.
  fn confirm(&self, manager: &mut CacheManager, response: Value) -> RemoteResult<Outcome> {
    let server_id = response.get("id").and_then(Value::as_i64);
    let Err(e) = manager.confirm(self.kind, &self.target, response, true) else {
      return Ok(Outcome::Confirmed);
    };
    warn!(kind = %self.kind, id = %self.target, error = %e, "server reply unreadable, mutation not retried");
    if let Some(server_id) = server_id {
      manager.adopt_server_id(self.kind, &self.target, server_id);
    }
    manager.set_kind_error(
      self.kind,
      KindError::Unconfirmed {
        id: self.target.clone(),
        message: e.to_string(),
      },
    );
    Ok(Outcome::Unconfirmed)
  }
}

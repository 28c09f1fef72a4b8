//! Scripted in-process remote for tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Mutex;

use super::{updated_at, Remote, RemoteError, RemoteResult};
use crate::cache::EntityKind;

#[derive(Default)]
struct FakeState {
  offline: bool,
  next_id: i64,
  clock: i64,
  records: BTreeMap<(EntityKind, i64), Value>,
  taken: HashSet<String>,
  failures: VecDeque<Option<RemoteError>>,
  garble_reply: bool,
  calls: Vec<String>,
}

/// In-memory server. Mutating calls consume scripted failures first.
#[derive(Default)]
pub struct FakeRemote {
  state: Mutex<FakeState>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_online(&self, online: bool) {
    self.state.lock().unwrap().offline = !online;
  }

  /// Make the next mutating call fail with `error`.
  pub fn fail_next(&self, error: RemoteError) {
    self.state.lock().unwrap().failures.push_back(Some(error));
  }

  /// Let the next mutating call through; lines up a later `fail_next`.
  pub fn pass_next(&self) {
    self.state.lock().unwrap().failures.push_back(None);
  }

  /// Accept the next create or update but answer with a body that is not a record.
  pub fn garble_next_reply(&self) {
    self.state.lock().unwrap().garble_reply = true;
  }

  /// Reserve a client identity so creating it collides.
  pub fn take_identity(&self, client_id: &str) {
    self.state.lock().unwrap().taken.insert(client_id.to_string());
  }

  /// Insert or replace a record as if another client wrote it. Returns the stored value.
  pub fn seed(&self, kind: EntityKind, mut record: Value) -> Value {
    let mut state = self.state.lock().unwrap();
    let id = match record.get("id").and_then(Value::as_i64) {
      Some(id) => id,
      None => {
        state.next_id += 1;
        state.next_id
      }
    };
    state.next_id = state.next_id.max(id);
    let stamp = state.tick();
    record["id"] = Value::from(id);
    record["updated_at"] = Value::from(stamp.to_rfc3339());
    if let Some(client_id) = record.get("client_id").and_then(Value::as_str) {
      state.taken.insert(client_id.to_string());
    }
    state.records.insert((kind, id), record.clone());
    record
  }

  pub fn record(&self, kind: EntityKind, server_id: i64) -> Option<Value> {
    self.state.lock().unwrap().records.get(&(kind, server_id)).cloned()
  }

  pub fn calls(&self) -> Vec<String> {
    self.state.lock().unwrap().calls.clone()
  }
}

impl FakeState {
  fn tick(&mut self) -> DateTime<Utc> {
    self.clock += 1;
    Utc.timestamp_opt(1_700_000_000 + self.clock, 0).unwrap()
  }

  fn begin(&mut self, call: String) -> RemoteResult<()> {
    self.calls.push(call);
    if self.offline {
      return Err(RemoteError::Network("offline".to_string()));
    }
    match self.failures.pop_front().flatten() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }

  fn reply(&mut self, stored: Value) -> Value {
    if std::mem::take(&mut self.garble_reply) {
      return serde_json::json!({ "id": stored["id"].clone(), "status": "accepted" });
    }
    stored
  }
}

#[async_trait]
impl Remote for FakeRemote {
  async fn create(&self, kind: EntityKind, mut dto: Value) -> RemoteResult<Value> {
    let mut state = self.state.lock().unwrap();
    let client_id = dto
      .get("client_id")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    state.begin(format!("create {} {}", kind, client_id))?;
    if !state.taken.insert(client_id) {
      return Err(RemoteError::IdentityCollision);
    }
    state.next_id += 1;
    let id = state.next_id;
    let stamp = state.tick();
    dto["id"] = Value::from(id);
    dto["created_at"] = Value::from(stamp.to_rfc3339());
    dto["updated_at"] = Value::from(stamp.to_rfc3339());
    state.records.insert((kind, id), dto.clone());
    Ok(state.reply(dto))
  }

  async fn read_one(&self, kind: EntityKind, server_id: i64) -> RemoteResult<Value> {
    let mut state = self.state.lock().unwrap();
    state.calls.push(format!("read {} {}", kind, server_id));
    if state.offline {
      return Err(RemoteError::Network("offline".to_string()));
    }
    state
      .records
      .get(&(kind, server_id))
      .cloned()
      .ok_or(RemoteError::NotFound)
  }

  async fn read_since(&self, kind: EntityKind, since: Option<DateTime<Utc>>) -> RemoteResult<Vec<Value>> {
    let mut state = self.state.lock().unwrap();
    state.calls.push(format!("read_since {}", kind));
    if state.offline {
      return Err(RemoteError::Network("offline".to_string()));
    }
    Ok(
      state
        .records
        .iter()
        .filter(|((k, _), _)| *k == kind)
        .map(|(_, v)| v)
        .filter(|v| match (since, updated_at(v)) {
          (Some(since), Some(at)) => at > since,
          _ => true,
        })
        .cloned()
        .collect(),
    )
  }

  async fn update(&self, kind: EntityKind, server_id: i64, mut dto: Value) -> RemoteResult<Value> {
    let mut state = self.state.lock().unwrap();
    state.begin(format!("update {} {}", kind, server_id))?;
    let Some(existing) = state.records.get(&(kind, server_id)).cloned() else {
      return Err(RemoteError::NotFound);
    };
    let stamp = state.tick();
    dto["id"] = Value::from(server_id);
    dto["created_at"] = existing.get("created_at").cloned().unwrap_or(Value::Null);
    dto["updated_at"] = Value::from(stamp.to_rfc3339());
    state.records.insert((kind, server_id), dto.clone());
    Ok(state.reply(dto))
  }

  async fn delete(&self, kind: EntityKind, server_id: i64) -> RemoteResult<()> {
    let mut state = self.state.lock().unwrap();
    state.begin(format!("delete {} {}", kind, server_id))?;
    state
      .records
      .remove(&(kind, server_id))
      .map(|_| ())
      .ok_or(RemoteError::NotFound)
  }

  async fn is_online(&self) -> bool {
    !self.state.lock().unwrap().offline
  }
}

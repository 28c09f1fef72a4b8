//! Cache manager: per-kind priority indices, identity lookup, change
//! notification, and the bridge to the durable store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

use super::codec;
use super::entity::Cacheable;
use super::heap::{HeapArena, PriorityIndex, RecordId};
use super::policy::PersistencePolicy;
use super::storage::DurableStore;
use super::traits::{ClientId, EntityKind, Tier};
use crate::domain::{AnyEntity, Kind};

/// Change listener registered for one entity.
pub type Callback = Box<dyn FnMut(&AnyEntity) + Send>;

/// Error state surfaced to the UI for one entity kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KindError {
  /// A mutation was rejected because the session does not own the entity
  Unauthorized { id: ClientId, message: String },
  /// A queued mutation referenced an entity the server no longer has
  NoLongerExists { id: ClientId },
  /// The server accepted a mutation but its reply could not be applied
  Unconfirmed { id: ClientId, message: String },
}

impl std::fmt::Display for KindError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      KindError::Unauthorized { id, message } => write!(f, "not authorized to change {}: {}", id, message),
      KindError::NoLongerExists { id } => write!(f, "{} no longer exists on the server", id),
      KindError::Unconfirmed { id, message } => {
        write!(f, "{} was saved but the server reply was unreadable: {}", id, message)
      }
    }
  }
}

/// Bookkeeping wrapper per tracked entity.
#[derive(Debug)]
pub struct StorageRecord {
  pub id: ClientId,
  pub kind: EntityKind,
  /// Tier chosen at the last durable write
  pub tier: Tier,
  pub entity: AnyEntity,
  /// 1-indexed heap position; 0 when not in a heap
  pub node_id: usize,
  /// Logical time of the last write access
  pub stamp: u64,
}

impl StorageRecord {
  /// Zero-indexed position in the kind's heap.
  pub fn heap_index(&self) -> Option<usize> {
    self.node_id.checked_sub(1)
  }
}

#[derive(Debug, Default)]
struct Arena {
  slots: Vec<Option<StorageRecord>>,
  free: Vec<usize>,
}

impl Arena {
  fn alloc(&mut self, record: StorageRecord) -> RecordId {
    match self.free.pop() {
      Some(idx) => {
        self.slots[idx] = Some(record);
        RecordId(idx)
      }
      None => {
        self.slots.push(Some(record));
        RecordId(self.slots.len() - 1)
      }
    }
  }

  fn release(&mut self, id: RecordId) -> Option<StorageRecord> {
    let record = self.slots.get_mut(id.0)?.take()?;
    self.free.push(id.0);
    Some(record)
  }

  fn get(&self, id: RecordId) -> Option<&StorageRecord> {
    self.slots.get(id.0)?.as_ref()
  }

  fn get_mut(&mut self, id: RecordId) -> Option<&mut StorageRecord> {
    self.slots.get_mut(id.0)?.as_mut()
  }
}

impl HeapArena for Arena {
  fn key(&self, id: RecordId) -> u64 {
    self.get(id).map(|r| r.stamp).unwrap_or(0)
  }

  fn node_id(&self, id: RecordId) -> usize {
    self.get(id).map(|r| r.node_id).unwrap_or(0)
  }

  fn set_node_id(&mut self, id: RecordId, node_id: usize) {
    if let Some(record) = self.get_mut(id) {
      record.node_id = node_id;
    }
  }
}

#[derive(Debug, Default)]
struct KindState {
  heap: PriorityIndex,
  last_read: Option<RecordId>,
  watermark: Option<DateTime<Utc>>,
  error: Option<KindError>,
}

/// Subscription table keyed by (kind, identity).
#[derive(Default)]
pub struct Subscriptions {
  listeners: HashMap<(EntityKind, ClientId), Vec<(String, Callback)>>,
}

impl Subscriptions {
  pub fn subscribe(&mut self, kind: EntityKind, target: ClientId, subscriber: &str, callback: Callback) {
    let entry = self.listeners.entry((kind, target)).or_default();
    entry.retain(|(s, _)| s != subscriber);
    entry.push((subscriber.to_string(), callback));
  }

  pub fn unsubscribe(&mut self, kind: EntityKind, target: &ClientId, subscriber: &str) -> bool {
    let key = (kind, target.clone());
    let Some(entry) = self.listeners.get_mut(&key) else {
      return false;
    };
    let before = entry.len();
    entry.retain(|(s, _)| s != subscriber);
    let removed = entry.len() != before;
    if entry.is_empty() {
      self.listeners.remove(&key);
    }
    removed
  }

  /// Call every listener registered under any identity the entity has held.
  pub fn publish(&mut self, kind: EntityKind, history: &[ClientId], entity: &AnyEntity) -> usize {
    let mut delivered = 0;
    for id in history {
      if let Some(entry) = self.listeners.get_mut(&(kind, id.clone())) {
        for (_, callback) in entry.iter_mut() {
          callback(entity);
          delivered += 1;
        }
      }
    }
    delivered
  }

  pub fn clear(&mut self) {
    self.listeners.clear();
  }

  pub fn len(&self) -> usize {
    self.listeners.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.listeners.is_empty()
  }
}

/// Persisted collection for one kind.
#[derive(Debug, Default, Serialize, Deserialize)]
struct KindBlob {
  #[serde(default)]
  watermark: Option<DateTime<Utc>>,
  #[serde(default)]
  entities: Vec<BlobEntry>,
  #[serde(default)]
  mutations: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BlobEntry {
  stamp: u64,
  tier: Tier,
  data: String,
}

/// What a durable read restored for one kind.
#[derive(Debug, Default)]
pub struct Hydrated {
  pub entities: usize,
  /// Serialized mutation units queued for this kind
  pub mutations: Vec<String>,
}

/// Owner of every tracked entity.
pub struct CacheManager {
  arena: Arena,
  lookup: HashMap<ClientId, RecordId>,
  kinds: BTreeMap<EntityKind, KindState>,
  subscriptions: Subscriptions,
  clock: u64,
  policy: PersistencePolicy,
}

impl Default for CacheManager {
  fn default() -> Self {
    Self::new(PersistencePolicy::default())
  }
}

impl CacheManager {
  pub fn new(policy: PersistencePolicy) -> Self {
    Self {
      arena: Arena::default(),
      lookup: HashMap::new(),
      kinds: BTreeMap::new(),
      subscriptions: Subscriptions::default(),
      clock: 0,
      policy,
    }
  }

  pub fn policy(&self) -> &PersistencePolicy {
    &self.policy
  }

  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  fn state(&mut self, kind: EntityKind) -> &mut KindState {
    self.kinds.entry(kind).or_default()
  }

  fn find(&self, kind: EntityKind, id: &ClientId) -> Option<RecordId> {
    let rid = *self.lookup.get(id)?;
    match self.arena.get(rid) {
      Some(record) if record.kind == kind => Some(rid),
      _ => None,
    }
  }

  // ---------------------------------------------------------------------------
  // Tracking
  // ---------------------------------------------------------------------------

  /// Start tracking an entity, or swap in a new instance if its identity is already tracked.
  pub fn track(&mut self, entity: AnyEntity) -> ClientId {
    let kind = entity.kind();
    if let Some(rid) = self.find(kind, entity.as_cacheable().client_id()) {
      return self.replace(rid, entity);
    }
    let stamp = self.tick();
    self.track_at(entity, stamp, Tier::Forget)
  }

  /// Typed convenience over `track`.
  pub fn track_entity<R: Kind>(&mut self, entity: super::Tracked<R>) -> ClientId {
    self.track(R::wrap(entity))
  }

  fn track_at(&mut self, entity: AnyEntity, stamp: u64, tier: Tier) -> ClientId {
    let kind = entity.kind();
    let id = entity.as_cacheable().client_id().clone();
    if let Some(rid) = self.find(kind, &id) {
      return self.replace(rid, entity);
    }

    let history = entity.as_cacheable().identity_history().to_vec();
    let rid = self.arena.alloc(StorageRecord {
      id: id.clone(),
      kind,
      tier,
      entity,
      node_id: 0,
      stamp,
    });
    for old in history {
      self.lookup.insert(old, rid);
    }
    let state = self.kinds.entry(kind).or_default();
    state.heap.insert(&mut self.arena, rid);
    debug!(kind = %kind, id = %id, "tracking entity");
    id
  }

  /// Swap the entity held by a record in place; its heap position and stamp are kept.
  /// Identities the outgoing entity held that the incoming one does not are unmapped.
  fn replace(&mut self, rid: RecordId, entity: AnyEntity) -> ClientId {
    let id = entity.as_cacheable().client_id().clone();
    let history = entity.as_cacheable().identity_history().to_vec();
    let Some(record) = self.arena.get_mut(rid) else {
      return id;
    };
    let outgoing = std::mem::replace(&mut record.entity, entity);
    record.id = id.clone();
    for old in outgoing.as_cacheable().identity_history() {
      if !history.contains(old) && self.lookup.get(old) == Some(&rid) {
        self.lookup.remove(old);
      }
    }
    for current in history {
      self.lookup.insert(current, rid);
    }
    debug!(kind = %record.kind, id = %id, "refreshed tracked entity");
    id
  }

  /// Stop tracking. Subscriptions stay in place: the entity may come back under a new identity.
  pub fn untrack(&mut self, kind: EntityKind, id: &ClientId) -> Option<AnyEntity> {
    let rid = self.find(kind, id)?;
    let state = self.kinds.entry(kind).or_default();
    state.heap.remove(&mut self.arena, rid);
    if state.last_read == Some(rid) {
      state.last_read = None;
    }
    let record = self.arena.release(rid)?;
    for old in record.entity.as_cacheable().identity_history() {
      self.lookup.remove(old);
    }
    debug!(kind = %kind, id = %id, "untracked entity");
    Some(record.entity)
  }

  pub fn contains(&self, kind: EntityKind, id: &ClientId) -> bool {
    self.find(kind, id).is_some()
  }

  pub fn len(&self, kind: EntityKind) -> usize {
    self.kinds.get(&kind).map(|s| s.heap.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.lookup.is_empty()
  }

  // ---------------------------------------------------------------------------
  // Access
  // ---------------------------------------------------------------------------

  /// Note that an entity was read; it becomes the kind's last-read entity.
  pub fn read_accessed(&mut self, kind: EntityKind, id: &ClientId) -> bool {
    let Some(rid) = self.find(kind, id) else {
      return false;
    };
    self.state(kind).last_read = Some(rid);
    true
  }

  /// Note that an entity was written; it moves toward the root of its heap.
  ///
  /// Stamps only grow, so the record's key can only have increased since it
  /// was last placed and a sift toward the root is always sufficient.
  pub fn write_accessed(&mut self, kind: EntityKind, id: &ClientId) -> bool {
    let Some(rid) = self.find(kind, id) else {
      return false;
    };
    let stamp = self.tick();
    if let Some(record) = self.arena.get_mut(rid) {
      record.stamp = stamp;
    }
    let state = self.kinds.entry(kind).or_default();
    state.heap.sift_up(&mut self.arena, rid);
    true
  }

  /// Look at an entity without recording a read.
  pub fn peek(&self, kind: EntityKind, id: &ClientId) -> Option<&AnyEntity> {
    let rid = self.find(kind, id)?;
    self.arena.get(rid).map(|r| &r.entity)
  }

  pub fn record(&self, kind: EntityKind, id: &ClientId) -> Option<&StorageRecord> {
    let rid = self.find(kind, id)?;
    self.arena.get(rid)
  }

  /// Read a typed entity, recording the access.
  pub fn get<R: Kind>(&mut self, id: &ClientId) -> Option<&super::Tracked<R>> {
    let rid = self.find(R::KIND, id)?;
    self.state(R::KIND).last_read = Some(rid);
    self.arena.get(rid).and_then(|r| R::peek(&r.entity))
  }

  /// Mutate a typed entity, recording the write access.
  pub fn update<R: Kind, T>(
    &mut self,
    id: &ClientId,
    f: impl FnOnce(&mut super::Tracked<R>) -> T,
  ) -> Option<T> {
    let rid = self.find(R::KIND, id)?;
    let entity = self.arena.get_mut(rid).and_then(|r| R::peek_mut(&mut r.entity))?;
    let out = f(entity);
    self.write_accessed(R::KIND, id);
    Some(out)
  }

  /// Most recently written entity of a kind.
  pub fn hottest(&self, kind: EntityKind) -> Option<&AnyEntity> {
    let rid = self.kinds.get(&kind)?.heap.peek()?;
    self.arena.get(rid).map(|r| &r.entity)
  }

  /// Most recently read entity of a kind.
  pub fn last_read(&self, kind: EntityKind) -> Option<&AnyEntity> {
    let rid = self.kinds.get(&kind)?.last_read?;
    self.arena.get(rid).map(|r| &r.entity)
  }

  /// Entities of a kind, hottest first.
  pub fn ranked(&self, kind: EntityKind) -> Vec<&AnyEntity> {
    let Some(state) = self.kinds.get(&kind) else {
      return Vec::new();
    };
    state
      .heap
      .ranked(&self.arena)
      .into_iter()
      .filter_map(|rid| self.arena.get(rid).map(|r| &r.entity))
      .collect()
  }

  pub fn dirty_count(&self, kind: EntityKind) -> usize {
    self
      .ranked(kind)
      .iter()
      .filter(|e| e.as_cacheable().is_dirty())
      .count()
  }

  // ---------------------------------------------------------------------------
  // Server reconciliation
  // ---------------------------------------------------------------------------

  /// Apply a server response for an entity this client mutated, or a pushed
  /// change (`clear_overlay = false`), then notify subscribers.
  pub fn confirm(
    &mut self,
    kind: EntityKind,
    id: &ClientId,
    data: Value,
    clear_overlay: bool,
  ) -> Result<()> {
    let rid = self
      .find(kind, id)
      .ok_or_else(|| eyre!("{} {} is not tracked", kind, id))?;
    let record = self
      .arena
      .get_mut(rid)
      .ok_or_else(|| eyre!("{} {} has no record", kind, id))?;
    record
      .entity
      .as_cacheable_mut()
      .confirm_from_json(data, clear_overlay)?;
    self.write_accessed(kind, id);
    self.notify(kind, id);
    Ok(())
  }

  /// Record the server id of an entity whose create was accepted without a usable reply.
  pub fn adopt_server_id(&mut self, kind: EntityKind, id: &ClientId, server_id: i64) -> bool {
    let Some(rid) = self.find(kind, id) else {
      return false;
    };
    match self.arena.get_mut(rid) {
      Some(record) => record.entity.as_cacheable_mut().adopt_server_id(server_id),
      None => false,
    }
  }

  /// Absorb a server push: merge into a tracked entity, or start tracking a new one.
  pub fn apply_push(&mut self, kind: EntityKind, data: Value) -> Result<ClientId> {
    let id: ClientId = data
      .get("client_id")
      .and_then(Value::as_str)
      .map(ClientId::from)
      .ok_or_else(|| eyre!("Pushed {} has no client_id", kind))?;

    if self.contains(kind, &id) {
      self.confirm(kind, &id, data, false)?;
    } else {
      let entity = AnyEntity::from_server_json(kind, data)?;
      self.track(entity);
      self.notify(kind, &id);
    }
    Ok(id)
  }

  /// Give an entity a fresh identity after the server rejected the current one.
  pub fn handle_identity_collision(&mut self, kind: EntityKind, id: &ClientId) -> Option<ClientId> {
    let rid = self.find(kind, id)?;
    let record = self.arena.get_mut(rid)?;
    let fresh = record.entity.as_cacheable_mut().handle_identity_collision();
    record.id = fresh.clone();
    self.lookup.insert(fresh.clone(), rid);
    info!(kind = %kind, old = %id, new = %fresh, "identity collision, regenerated");
    Some(fresh)
  }

  /// Notify subscribers of an entity's current state.
  pub fn notify(&mut self, kind: EntityKind, id: &ClientId) -> usize {
    let Some(rid) = self.find(kind, id) else {
      return 0;
    };
    let Some(record) = self.arena.get(rid) else {
      return 0;
    };
    let history = record.entity.as_cacheable().identity_history();
    self.subscriptions.publish(kind, history, &record.entity)
  }

  pub fn subscribe(&mut self, kind: EntityKind, target: ClientId, subscriber: &str, callback: Callback) {
    self.subscriptions.subscribe(kind, target, subscriber, callback);
  }

  pub fn unsubscribe(&mut self, kind: EntityKind, target: &ClientId, subscriber: &str) -> bool {
    self.subscriptions.unsubscribe(kind, target, subscriber)
  }

  pub fn publish(&mut self, kind: EntityKind, history: &[ClientId], entity: &AnyEntity) -> usize {
    self.subscriptions.publish(kind, history, entity)
  }

  // ---------------------------------------------------------------------------
  // Per-kind bookkeeping
  // ---------------------------------------------------------------------------

  pub fn watermark(&self, kind: EntityKind) -> Option<DateTime<Utc>> {
    self.kinds.get(&kind).and_then(|s| s.watermark)
  }

  pub fn set_watermark(&mut self, kind: EntityKind, watermark: DateTime<Utc>) {
    self.state(kind).watermark = Some(watermark);
  }

  pub fn kind_error(&self, kind: EntityKind) -> Option<&KindError> {
    self.kinds.get(&kind).and_then(|s| s.error.as_ref())
  }

  pub fn set_kind_error(&mut self, kind: EntityKind, error: KindError) {
    warn!(kind = %kind, error = %error, "surfacing error");
    self.state(kind).error = Some(error);
  }

  pub fn take_kind_error(&mut self, kind: EntityKind) -> Option<KindError> {
    self.state(kind).error.take()
  }

  // ---------------------------------------------------------------------------
  // Durable store
  // ---------------------------------------------------------------------------

  /// Restore a kind from the durable store. Unreadable contents yield an empty kind.
  pub fn read_from_durable_store(&mut self, kind: EntityKind, store: &dyn DurableStore) -> Hydrated {
    let blob = match load_blob(kind, store) {
      Ok(Some(blob)) => blob,
      Ok(None) => return Hydrated::default(),
      Err(e) => {
        warn!(kind = %kind, error = %e, "discarding unreadable cache contents");
        return Hydrated::default();
      }
    };

    let mut hydrated = Hydrated {
      entities: 0,
      mutations: blob.mutations,
    };
    for entry in blob.entities {
      match AnyEntity::deserialize(kind, &entry.data, entry.tier) {
        Ok(entity) => {
          self.clock = self.clock.max(entry.stamp);
          self.track_at(entity, entry.stamp, entry.tier);
          hydrated.entities += 1;
        }
        Err(e) => warn!(kind = %kind, error = %e, "skipping unreadable cached entity"),
      }
    }
    if let Some(watermark) = blob.watermark {
      self.set_watermark(kind, watermark);
    }

    info!(kind = %kind, entities = hydrated.entities, mutations = hydrated.mutations.len(), "hydrated from durable store");
    hydrated
  }

  /// Serialize a kind, hottest first and tiered by the persistence policy, into the durable store.
  /// Returns false when the stored contents were already identical.
  pub fn write_to_durable_store(
    &mut self,
    kind: EntityKind,
    store: &dyn DurableStore,
    mutations: Vec<String>,
  ) -> Result<bool> {
    let order = match self.kinds.get(&kind) {
      Some(state) => state.heap.ranked(&self.arena),
      None => Vec::new(),
    };

    let policy = self.policy;
    let mut used = 0usize;
    let mut entities = Vec::with_capacity(order.len());
    for (rank, rid) in order.into_iter().enumerate() {
      let Some(record) = self.arena.get_mut(rid) else {
        continue;
      };
      let entity = record.entity.as_cacheable_mut();
      let tier = policy.assign(rank, entity, &mut used)?;
      let data = entity.serialize(tier)?;
      record.tier = tier;
      if data.is_empty() {
        continue;
      }
      entities.push(BlobEntry {
        stamp: record.stamp,
        tier,
        data,
      });
    }

    let blob = KindBlob {
      watermark: self.watermark(kind),
      entities,
      mutations,
    };
    let json =
      serde_json::to_string(&blob).map_err(|e| eyre!("Failed to serialize {} cache: {}", kind, e))?;
    let digest = codec::digest(&json);
    let encoded = codec::encode(&json)?;
    let written = store.put(&kind.store_key(), &encoded, &digest)?;

    debug!(kind = %kind, entries = blob.entities.len(), bytes = encoded.len(), written, "persisted kind");
    Ok(written)
  }

  /// Forget everything. Used on sign-out.
  pub fn clear(&mut self) {
    self.arena = Arena::default();
    self.lookup.clear();
    self.kinds.clear();
    self.subscriptions.clear();
    self.clock = 0;
  }

  #[cfg(test)]
  fn assert_heap_consistent(&self, kind: EntityKind) {
    let Some(state) = self.kinds.get(&kind) else {
      return;
    };
    for (i, rid) in state.heap.slots().iter().enumerate() {
      let record = self.arena.get(*rid).expect("heap handle without record");
      assert_eq!(record.node_id, i + 1);
      assert_eq!(record.heap_index(), Some(i));
    }
    if let Some(root) = state.heap.peek() {
      let max = state
        .heap
        .slots()
        .iter()
        .map(|rid| self.arena.key(*rid))
        .max()
        .unwrap_or(0);
      assert_eq!(self.arena.key(root), max);
    }
  }
}

fn load_blob(kind: EntityKind, store: &dyn DurableStore) -> Result<Option<KindBlob>> {
  let Some(stored) = store.get(&kind.store_key())? else {
    return Ok(None);
  };
  let json = codec::decode(&stored.value)?;
  let blob: KindBlob =
    serde_json::from_str(&json).map_err(|e| eyre!("Failed to parse {} cache: {}", kind, e))?;
  Ok(Some(blob))
}

//! Dirty-overlay entities.
//!
//! A `Tracked<R>` holds the server-confirmed base record `R` and a sparse
//! overlay of local edits that have not been confirmed yet. Reads see the
//! overlay first; writes only ever touch the overlay. The entity is dirty iff
//! the overlay is non-empty.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::merge::merge;
use super::traits::{ClientId, EntityKind, Field, FieldValue, Record, Tier};

/// Object-safe view of the overlay contract, used by the manager across kinds.
pub trait Cacheable: Send + Sync {
  fn kind(&self) -> EntityKind;

  fn client_id(&self) -> &ClientId;

  /// Every client identity this entity has held, oldest first, current last.
  fn identity_history(&self) -> &[ClientId];

  fn server_id(&self) -> Option<i64>;

  fn is_dirty(&self) -> bool;

  fn is_deleted(&self) -> bool;

  /// Serialize at the given tier, reusing the cached string when nothing was
  /// written since the last call at that tier.
  fn serialize(&mut self, tier: Tier) -> Result<String>;

  fn compute_weight(&mut self, tier: Tier) -> Result<usize> {
    Ok(self.serialize(tier)?.len())
  }

  fn to_create_dto(&self) -> Result<Value>;

  fn to_update_dto(&self) -> Result<Value>;

  /// Apply a server response given as JSON.
  fn confirm_from_json(&mut self, data: Value, clear_overlay: bool) -> Result<()>;

  /// Regenerate the client identity after the server rejected it as taken.
  fn handle_identity_collision(&mut self) -> ClientId;

  /// Take a server id when none is known yet. Pending edits stay in the overlay.
  fn adopt_server_id(&mut self, server_id: i64) -> bool;
}

/// Canonical server state of one entity, as returned by the remote service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord<R> {
  pub id: i64,
  pub client_id: ClientId,
  #[serde(flatten)]
  pub record: R,
}

/// Outbound payload: overlay flattened over base.
#[derive(Debug, Clone, Serialize)]
struct Dto<'a, R> {
  client_id: &'a ClientId,
  #[serde(skip_serializing_if = "Option::is_none")]
  id: Option<i64>,
  #[serde(flatten)]
  record: R,
}

/// Persisted form of an entity. Which base fields are present depends on the tier.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "F: Field"))]
struct Stored<F: Field> {
  id: ClientId,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  previous_ids: Vec<ClientId>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  server_id: Option<i64>,
  #[serde(default, skip_serializing_if = "Map::is_empty")]
  base: Map<String, Value>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  overlay: BTreeMap<F, FieldValue>,
}

#[derive(Debug, Clone)]
pub struct Tracked<R: Record> {
  client_id: ClientId,
  history: Vec<ClientId>,
  server_id: Option<i64>,
  base: R,
  overlay: BTreeMap<R::Field, FieldValue>,
  /// Bumped on every write access; invalidates the serialization cache.
  revision: u64,
  tier_cache: [Option<(u64, String)>; 4],
  loaded_tier: Tier,
  /// Fields whose base value was not in the stored form this entity was restored from.
  unknown_base: BTreeSet<R::Field>,
}

impl<R: Record> Tracked<R> {
  /// A brand-new local entity: fresh identity, no server id, every field in the overlay.
  pub fn create(initial: R) -> Self {
    let mut entity = Self::from_parts(ClientId::generate(), None, R::default());
    for field in R::Field::ALL {
      entity.overlay.insert(*field, initial.get(*field));
    }
    entity
  }

  /// A clean entity mirroring server state.
  pub fn from_server(server: ServerRecord<R>) -> Self {
    Self::from_parts(server.client_id, Some(server.id), server.record)
  }

  fn from_parts(client_id: ClientId, server_id: Option<i64>, base: R) -> Self {
    Self {
      history: vec![client_id.clone()],
      client_id,
      server_id,
      base,
      overlay: BTreeMap::new(),
      revision: 0,
      tier_cache: Default::default(),
      loaded_tier: Tier::Heavy,
      unknown_base: BTreeSet::new(),
    }
  }

  /// Reconstruct from a string produced by `serialize`.
  pub fn deserialize(data: &str, tier: Tier) -> Result<Self> {
    let stored: Stored<R::Field> =
      serde_json::from_str(data).map_err(|e| eyre!("Failed to parse stored {}: {}", R::KIND, e))?;
    let unknown_base = R::Field::ALL
      .iter()
      .filter(|f| !stored.base.contains_key(f.name()))
      .copied()
      .collect();
    let base: R = serde_json::from_value(Value::Object(stored.base))
      .map_err(|e| eyre!("Failed to parse stored {} base: {}", R::KIND, e))?;

    let mut history = stored.previous_ids;
    history.push(stored.id.clone());

    Ok(Self {
      client_id: stored.id,
      history,
      server_id: stored.server_id,
      base,
      overlay: stored.overlay,
      revision: 0,
      tier_cache: Default::default(),
      loaded_tier: tier,
      unknown_base,
    })
  }

  pub fn base(&self) -> &R {
    &self.base
  }

  pub fn overlay(&self) -> &BTreeMap<R::Field, FieldValue> {
    &self.overlay
  }

  /// Current value of a field: overlay if present, else base.
  pub fn get(&self, field: R::Field) -> FieldValue {
    self
      .overlay
      .get(&field)
      .cloned()
      .unwrap_or_else(|| self.base.get(field))
  }

  pub fn text(&self, field: R::Field) -> String {
    match self.get(field) {
      FieldValue::Text(s) => s,
      _ => String::new(),
    }
  }

  pub fn flag(&self, field: R::Field) -> bool {
    self.get(field).as_flag().unwrap_or(false)
  }

  /// Record a local edit in the overlay.
  pub fn set(&mut self, field: R::Field, value: impl Into<FieldValue>) {
    self.overlay.insert(field, value.into());
    self.mark_written();
  }

  /// Drop a pending edit for one field.
  pub fn revert(&mut self, field: R::Field) {
    if self.overlay.remove(&field).is_some() {
      self.mark_written();
    }
  }

  /// The effective record: overlay values applied over base.
  pub fn flattened(&self) -> R {
    let mut record = self.base.clone();
    for (field, value) in &self.overlay {
      if !record.set(*field, value.clone()) {
        warn!(kind = %R::KIND, field = ?field, "overlay value has the wrong type, ignored");
      }
    }
    record
  }

  /// Tier this entity was hydrated from; lighter than heavy means base fields are missing.
  pub fn loaded_tier(&self) -> Tier {
    self.loaded_tier
  }

  pub fn needs_refetch(&self) -> bool {
    self.loaded_tier < Tier::Heavy && self.server_id.is_some()
  }

  /// Apply server state to the base.
  ///
  /// With `clear_overlay` the round trip this client started has completed and
  /// the overlay is dropped. Without it, a collaborator's push is being
  /// absorbed: every text field with a pending edit gets its overlay value
  /// rewritten as `merge(old_base, overlay, incoming)`, and the base always
  /// takes the incoming value. A field whose old base was never restored has
  /// no ancestor to merge against, so its overlay value is kept as is.
  pub fn on_server_confirmed(&mut self, server: ServerRecord<R>, clear_overlay: bool) {
    let old_base = std::mem::replace(&mut self.base, server.record);
    let unknown_base = std::mem::take(&mut self.unknown_base);
    self.server_id = Some(server.id);
    self.loaded_tier = Tier::Heavy;

    if clear_overlay {
      self.overlay.clear();
    } else {
      for (field, value) in self.overlay.iter_mut() {
        if !field.is_text() {
          continue;
        }
        if unknown_base.contains(field) {
          debug!(kind = %R::KIND, id = %self.client_id, field = ?field, "no restored base to merge against, keeping pending edit");
          continue;
        }
        let (FieldValue::Text(old), FieldValue::Text(mine), FieldValue::Text(theirs)) =
          (old_base.get(*field), &*value, self.base.get(*field))
        else {
          continue;
        };
        let merged = merge(&old, mine, &theirs);
        debug!(kind = %R::KIND, id = %self.client_id, field = ?field, "merged pending edit onto pushed value");
        *value = FieldValue::Text(merged);
      }
    }
    self.mark_written();
  }

  fn mark_written(&mut self) {
    self.revision += 1;
  }

  fn render(&self, tier: Tier) -> Result<String> {
    if tier == Tier::Forget && !self.is_dirty() {
      return Ok(String::new());
    }
    if self.base.is_deleted() && !self.is_dirty() {
      return Ok(String::new());
    }

    // Base values under a pending edit are the merge ancestor and are kept at any tier.
    let mut base = Map::new();
    let full = serde_json::to_value(&self.base)
      .map_err(|e| eyre!("Failed to serialize {} base: {}", R::KIND, e))?;
    if let Value::Object(fields) = full {
      for (name, value) in fields {
        let field = field_of::<R>(&name);
        if field.is_some_and(|f| self.unknown_base.contains(&f)) {
          continue;
        }
        let pending = field.is_some_and(|f| self.overlay.contains_key(&f));
        let by_tier = tier >= Tier::Feather && field.map_or(Tier::Heavy, |f| f.tier()) <= tier;
        if pending || by_tier {
          base.insert(name, value);
        }
      }
    }

    let stored = Stored {
      id: self.client_id.clone(),
      previous_ids: self.history[..self.history.len().saturating_sub(1)].to_vec(),
      server_id: self.server_id,
      base,
      overlay: self.overlay.clone(),
    };
    serde_json::to_string(&stored).map_err(|e| eyre!("Failed to serialize {}: {}", R::KIND, e))
  }
}

/// Descriptor for a serialized base field. Fields outside the descriptor set
/// (server-managed timestamps) have none and persist only at heavy.
fn field_of<R: Record>(name: &str) -> Option<R::Field> {
  R::Field::ALL.iter().find(|f| f.name() == name).copied()
}

impl<R: Record> Cacheable for Tracked<R> {
  fn kind(&self) -> EntityKind {
    R::KIND
  }

  fn client_id(&self) -> &ClientId {
    &self.client_id
  }

  fn identity_history(&self) -> &[ClientId] {
    &self.history
  }

  fn server_id(&self) -> Option<i64> {
    self.server_id
  }

  fn is_dirty(&self) -> bool {
    !self.overlay.is_empty()
  }

  fn is_deleted(&self) -> bool {
    self.flattened().is_deleted()
  }

  fn serialize(&mut self, tier: Tier) -> Result<String> {
    let slot = tier.index();
    if let Some((revision, cached)) = &self.tier_cache[slot] {
      if *revision == self.revision {
        return Ok(cached.clone());
      }
    }
    let rendered = self.render(tier)?;
    self.tier_cache[slot] = Some((self.revision, rendered.clone()));
    Ok(rendered)
  }

  fn to_create_dto(&self) -> Result<Value> {
    let dto = Dto {
      client_id: &self.client_id,
      id: None,
      record: self.flattened(),
    };
    serde_json::to_value(dto).map_err(|e| eyre!("Failed to build {} create payload: {}", R::KIND, e))
  }

  fn to_update_dto(&self) -> Result<Value> {
    let dto = Dto {
      client_id: &self.client_id,
      id: self.server_id,
      record: self.flattened(),
    };
    serde_json::to_value(dto).map_err(|e| eyre!("Failed to build {} update payload: {}", R::KIND, e))
  }

  fn confirm_from_json(&mut self, data: Value, clear_overlay: bool) -> Result<()> {
    let server: ServerRecord<R> = serde_json::from_value(data)
      .map_err(|e| eyre!("Failed to parse {} from server: {}", R::KIND, e))?;
    self.on_server_confirmed(server, clear_overlay);
    Ok(())
  }

  fn handle_identity_collision(&mut self) -> ClientId {
    let fresh = ClientId::generate();
    debug!(kind = %R::KIND, old = %self.client_id, new = %fresh, "regenerated client identity");
    self.history.push(fresh.clone());
    self.client_id = fresh.clone();
    self.mark_written();
    fresh
  }

  fn adopt_server_id(&mut self, server_id: i64) -> bool {
    if self.server_id.is_some() {
      return false;
    }
    self.server_id = Some(server_id);
    self.mark_written();
    true
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::domain::{Prompt, PromptField};

  fn server_prompt(id: i64, client_id: &ClientId, title: &str, body: &str) -> ServerRecord<Prompt> {
    ServerRecord {
      id,
      client_id: client_id.clone(),
      record: Prompt {
        title: title.to_string(),
        body: body.to_string(),
        ..Prompt::default()
      },
    }
  }

  fn clean_prompt(title: &str, body: &str) -> Tracked<Prompt> {
    Tracked::from_server(server_prompt(1, &ClientId::from("u1"), title, body))
  }

  #[test]
  fn test_create_populates_overlay() {
    let entity = Tracked::create(Prompt {
      title: "Hello".to_string(),
      ..Prompt::default()
    });
    assert!(entity.is_dirty());
    assert_eq!(entity.server_id(), None);
    assert_eq!(entity.overlay().len(), PromptField::ALL.len());
    assert_eq!(entity.identity_history(), &[entity.client_id().clone()]);
  }

  #[test]
  fn test_overlay_shadows_base() {
    let mut entity = clean_prompt("Original", "text");
    assert!(!entity.is_dirty());
    entity.set(PromptField::Title, "Mine");
    assert_eq!(entity.text(PromptField::Title), "Mine");
    assert_eq!(entity.base().title, "Original");
    assert!(entity.is_dirty());

    entity.revert(PromptField::Title);
    assert_eq!(entity.text(PromptField::Title), "Original");
    assert!(!entity.is_dirty());
  }

  #[test]
  fn test_confirm_clears_overlay_and_is_idempotent() {
    let mut entity = clean_prompt("Original", "text");
    entity.set(PromptField::Title, "Mine");
    let response = server_prompt(1, &ClientId::from("u1"), "Mine", "text");

    entity.on_server_confirmed(response.clone(), true);
    let once = entity.base().clone();
    assert!(!entity.is_dirty());

    entity.on_server_confirmed(response, true);
    assert!(!entity.is_dirty());
    assert_eq!(entity.base().title, once.title);
    assert_eq!(entity.base().body, once.body);
  }

  #[test]
  fn test_push_merges_pending_text_edit() {
    let mut entity = clean_prompt("Original", "text");
    entity.set(PromptField::Title, "Mine");

    entity.on_server_confirmed(server_prompt(1, &ClientId::from("u1"), "Theirs", "text"), false);

    assert_eq!(entity.base().title, "Theirs");
    let expected = merge("Original", "Mine", "Theirs");
    assert_eq!(entity.overlay().get(&PromptField::Title), Some(&FieldValue::Text(expected.clone())));
    assert_ne!(expected, "Mine");
    assert_ne!(expected, "Theirs");
  }

  #[test]
  fn test_push_merge_is_per_field() {
    let mut entity = clean_prompt("a title", "a body");
    entity.set(PromptField::Title, "a better title");
    entity.set(PromptField::Body, "a body, extended");
    entity.set(PromptField::Archived, true);

    entity.on_server_confirmed(server_prompt(1, &ClientId::from("u1"), "the title", "the body"), false);

    assert_eq!(entity.text(PromptField::Title), merge("a title", "a better title", "the title"));
    assert_eq!(entity.text(PromptField::Body), merge("a body", "a body, extended", "the body"));
    // Non-text overlay values are untouched.
    assert!(entity.flag(PromptField::Archived));
    assert_eq!(entity.base().body, "the body");
  }

  #[test]
  fn test_push_without_pending_edit_just_replaces_base() {
    let mut entity = clean_prompt("Original", "text");
    entity.on_server_confirmed(server_prompt(1, &ClientId::from("u1"), "Theirs", "new"), false);
    assert!(!entity.is_dirty());
    assert_eq!(entity.text(PromptField::Title), "Theirs");
  }

  #[test]
  fn test_tiered_serialization_monotonic() {
    let mut entity = clean_prompt("A title", "A much longer body of text");
    assert_eq!(entity.serialize(Tier::Forget).unwrap(), "");
    let feather = entity.serialize(Tier::Feather).unwrap();
    let light = entity.serialize(Tier::Light).unwrap();
    let heavy = entity.serialize(Tier::Heavy).unwrap();
    assert!(heavy.len() >= light.len());
    assert!(light.len() >= feather.len());
    assert!(!feather.contains("A title"));
    assert!(light.contains("A title"));
    assert!(!light.contains("longer body"));
    assert!(heavy.contains("longer body"));

    entity.set(PromptField::Title, "Edited");
    let forget = entity.serialize(Tier::Forget).unwrap();
    assert!(forget.contains("Edited"));
  }

  #[test]
  fn test_deleted_clean_entity_serializes_empty() {
    let mut entity = clean_prompt("gone", "gone");
    entity.set(PromptField::Deleted, true);
    assert!(!entity.serialize(Tier::Heavy).unwrap().is_empty());

    let mut response = server_prompt(1, &ClientId::from("u1"), "gone", "gone");
    response.record.deleted = true;
    entity.on_server_confirmed(response, true);
    assert_eq!(entity.serialize(Tier::Heavy).unwrap(), "");
  }

  #[test]
  fn test_serialization_cache_invalidated_by_write() {
    let mut entity = clean_prompt("One", "body");
    let first = entity.serialize(Tier::Light).unwrap();
    assert_eq!(entity.serialize(Tier::Light).unwrap(), first);
    entity.set(PromptField::Title, "Two");
    let second = entity.serialize(Tier::Light).unwrap();
    assert_ne!(first, second);
    assert_eq!(entity.compute_weight(Tier::Light).unwrap(), second.len());
  }

  #[test]
  fn test_deserialize_restores_tier_content() {
    let mut entity = clean_prompt("Title", "Body");
    entity.set(PromptField::Body, "Edited body");
    let light = entity.serialize(Tier::Light).unwrap();

    let restored = Tracked::<Prompt>::deserialize(&light, Tier::Light).unwrap();
    assert_eq!(restored.client_id(), entity.client_id());
    assert_eq!(restored.server_id(), Some(1));
    assert_eq!(restored.base().title, "Title");
    // Body is heavy, but its base is the ancestor of a pending edit.
    assert_eq!(restored.base().body, "Body");
    assert_eq!(restored.text(PromptField::Body), "Edited body");
    assert!(restored.needs_refetch());

    let mut clean = clean_prompt("Title", "Body");
    let light = clean.serialize(Tier::Light).unwrap();
    assert!(!light.contains("Body"));
  }

  #[test]
  fn test_push_after_light_restore_keeps_pending_edit() {
    let mut entity = clean_prompt("Title", "Original body");
    entity.set(PromptField::Body, "Original body, edited");
    let light = entity.serialize(Tier::Light).unwrap();

    let mut restored = Tracked::<Prompt>::deserialize(&light, Tier::Light).unwrap();
    restored.on_server_confirmed(
      server_prompt(1, &ClientId::from("u1"), "New title", "Original body"),
      false,
    );

    assert_eq!(restored.text(PromptField::Title), "New title");
    assert_eq!(restored.text(PromptField::Body), "Original body, edited");
    assert_eq!(restored.loaded_tier(), Tier::Heavy);
  }

  #[test]
  fn test_push_without_restored_base_keeps_overlay() {
    // Stored form written without the base of the edited field.
    let data = r#"{"id":"u1","server_id":1,"base":{"title":"Title"},"overlay":{"body":"Edited body"}}"#;
    let mut restored = Tracked::<Prompt>::deserialize(data, Tier::Light).unwrap();
    restored.on_server_confirmed(server_prompt(1, &ClientId::from("u1"), "Title", "Their body"), false);

    assert_eq!(restored.text(PromptField::Body), "Edited body");
    assert_eq!(restored.base().body, "Their body");

    // Once a full base arrived, later pushes merge again.
    restored.on_server_confirmed(server_prompt(1, &ClientId::from("u1"), "Title", "Their body v2"), false);
    assert_eq!(restored.text(PromptField::Body), merge("Their body", "Edited body", "Their body v2"));
  }

  #[test]
  fn test_identity_collision_keeps_history() {
    let mut entity = Tracked::create(Prompt::default());
    let original = entity.client_id().clone();
    let fresh = entity.handle_identity_collision();
    assert_ne!(fresh, original);
    assert_eq!(entity.client_id(), &fresh);
    assert_eq!(entity.identity_history(), &[original.clone(), fresh.clone()]);

    let stored = entity.serialize(Tier::Feather).unwrap();
    let restored = Tracked::<Prompt>::deserialize(&stored, Tier::Feather).unwrap();
    assert_eq!(restored.identity_history(), &[original, fresh]);
  }

  #[test]
  fn test_adopt_server_id_only_once() {
    let mut entity = Tracked::create(Prompt {
      title: "Draft".to_string(),
      ..Prompt::default()
    });
    assert!(entity.adopt_server_id(7));
    assert!(!entity.adopt_server_id(8));
    assert_eq!(entity.server_id(), Some(7));
    assert!(entity.is_dirty());
    assert_eq!(entity.to_update_dto().unwrap()["id"], 7);
  }

  #[test]
  fn test_dtos_flatten_overlay() {
    let mut entity = clean_prompt("Original", "text");
    entity.set(PromptField::Title, "Mine");
    let dto = entity.to_update_dto().unwrap();
    assert_eq!(dto["title"], "Mine");
    assert_eq!(dto["body"], "text");
    assert_eq!(dto["id"], 1);
    assert_eq!(dto["client_id"], "u1");

    let created = Tracked::create(Prompt {
      title: "New".to_string(),
      ..Prompt::default()
    });
    let dto = created.to_create_dto().unwrap();
    assert_eq!(dto["title"], "New");
    assert!(dto.get("id").is_none());
  }

  #[test]
  fn test_confirm_from_json() {
    let mut entity = Tracked::create(Prompt {
      title: "Draft".to_string(),
      ..Prompt::default()
    });
    let data = serde_json::json!({
      "id": 42,
      "client_id": entity.client_id().as_str(),
      "title": "Draft",
      "body": "",
      "created_at": "2024-05-01T10:00:00Z",
      "updated_at": "2024-05-01T10:00:00Z",
    });
    entity.confirm_from_json(data, true).unwrap();
    assert_eq!(entity.server_id(), Some(42));
    assert!(!entity.is_dirty());
    assert!(entity.base().updated_at.is_some());
  }
}

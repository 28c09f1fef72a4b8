//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;

/// Named category of cacheable record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Profile,
  Prompt,
}

impl EntityKind {
  pub const ALL: &'static [EntityKind] = &[EntityKind::Profile, EntityKind::Prompt];

  pub fn name(self) -> &'static str {
    match self {
      EntityKind::Profile => "profile",
      EntityKind::Prompt => "prompt",
    }
  }

  /// Fixed durable-store key holding this kind's serialized collection.
  pub fn store_key(self) -> String {
    format!("kind:{}", self.name())
  }

  pub fn parse(s: &str) -> Option<Self> {
    Self::ALL.iter().copied().find(|k| k.name() == s)
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Stable client-side identity. Opaque, generated locally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
  pub fn generate() -> Self {
    Self(uuid::Uuid::new_v4().simple().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<&str> for ClientId {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for ClientId {
  fn from(s: String) -> Self {
    Self(s)
  }
}

impl fmt::Display for ClientId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// How much of an entity gets persisted, in increasing detail.
#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
  /// Nothing, unless the entity has unconfirmed edits
  #[default]
  Forget,
  /// Identity fields and overlay only
  Feather,
  /// Feather plus short human-meaningful fields
  Light,
  /// Every field
  Heavy,
}

impl Tier {
  pub const ALL: [Tier; 4] = [Tier::Forget, Tier::Feather, Tier::Light, Tier::Heavy];

  pub fn index(self) -> usize {
    self as usize
  }
}

/// A single field value as held in an overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
  Flag(bool),
  Int(i64),
  Text(String),
}

impl FieldValue {
  pub fn as_text(&self) -> Option<&str> {
    match self {
      FieldValue::Text(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_flag(&self) -> Option<bool> {
    match self {
      FieldValue::Flag(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      FieldValue::Int(i) => Some(*i),
      _ => None,
    }
  }
}

impl From<String> for FieldValue {
  fn from(s: String) -> Self {
    FieldValue::Text(s)
  }
}

impl From<&str> for FieldValue {
  fn from(s: &str) -> Self {
    FieldValue::Text(s.to_string())
  }
}

impl From<bool> for FieldValue {
  fn from(b: bool) -> Self {
    FieldValue::Flag(b)
  }
}

impl From<i64> for FieldValue {
  fn from(i: i64) -> Self {
    FieldValue::Int(i)
  }
}

/// Closed set of editable fields for one entity kind.
pub trait Field:
  Copy + Eq + Ord + Hash + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
  const ALL: &'static [Self];

  /// Serialized name; matches the record's serde field name.
  fn name(self) -> &'static str;

  /// Lightest tier that still persists this field's base value.
  fn tier(self) -> Tier;

  /// Text-bearing fields are three-way merged when a push collides with an edit.
  fn is_text(self) -> bool;
}

/// Base (server-confirmed) representation of one entity kind.
///
/// Serde field names must match `Field::name`, and the struct must tolerate
/// missing fields (`#[serde(default)]`) so lighter tiers can be hydrated.
pub trait Record: Clone + Default + fmt::Debug + Serialize + DeserializeOwned + Send + Sync {
  type Field: Field;

  const KIND: EntityKind;

  fn get(&self, field: Self::Field) -> FieldValue;

  /// Write a value into the base. Returns false on a type mismatch.
  fn set(&mut self, field: Self::Field, value: FieldValue) -> bool;

  /// Whether the server considers this record deleted.
  fn is_deleted(&self) -> bool {
    false
  }
}

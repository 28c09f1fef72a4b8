//! Writing prompts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{EntityKind, Field, FieldValue, Record, Tier, Tracked};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Prompt {
  pub title: String,
  pub body: String,
  pub archived: bool,
  pub deleted: bool,
  pub created_at: Option<DateTime<Utc>>,
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptField {
  Title,
  Body,
  Archived,
  Deleted,
}

impl Field for PromptField {
  const ALL: &'static [Self] = &[
    PromptField::Title,
    PromptField::Body,
    PromptField::Archived,
    PromptField::Deleted,
  ];

  fn name(self) -> &'static str {
    match self {
      PromptField::Title => "title",
      PromptField::Body => "body",
      PromptField::Archived => "archived",
      PromptField::Deleted => "deleted",
    }
  }

  fn tier(self) -> Tier {
    match self {
      PromptField::Deleted => Tier::Feather,
      PromptField::Title | PromptField::Archived => Tier::Light,
      PromptField::Body => Tier::Heavy,
    }
  }

  fn is_text(self) -> bool {
    matches!(self, PromptField::Title | PromptField::Body)
  }
}

impl Record for Prompt {
  type Field = PromptField;

  const KIND: EntityKind = EntityKind::Prompt;

  fn get(&self, field: PromptField) -> FieldValue {
    match field {
      PromptField::Title => FieldValue::Text(self.title.clone()),
      PromptField::Body => FieldValue::Text(self.body.clone()),
      PromptField::Archived => FieldValue::Flag(self.archived),
      PromptField::Deleted => FieldValue::Flag(self.deleted),
    }
  }

  fn set(&mut self, field: PromptField, value: FieldValue) -> bool {
    match (field, value) {
      (PromptField::Title, FieldValue::Text(s)) => self.title = s,
      (PromptField::Body, FieldValue::Text(s)) => self.body = s,
      (PromptField::Archived, FieldValue::Flag(b)) => self.archived = b,
      (PromptField::Deleted, FieldValue::Flag(b)) => self.deleted = b,
      _ => return false,
    }
    true
  }

  fn is_deleted(&self) -> bool {
    self.deleted
  }
}

pub type PromptEntity = Tracked<Prompt>;

impl Tracked<Prompt> {
  pub fn title(&self) -> String {
    self.text(PromptField::Title)
  }

  pub fn set_title(&mut self, title: impl Into<String>) {
    self.set(PromptField::Title, title.into());
  }

  pub fn body(&self) -> String {
    self.text(PromptField::Body)
  }

  pub fn set_body(&mut self, body: impl Into<String>) {
    self.set(PromptField::Body, body.into());
  }

  pub fn archived(&self) -> bool {
    self.flag(PromptField::Archived)
  }

  pub fn set_archived(&mut self, archived: bool) {
    self.set(PromptField::Archived, archived);
  }

  pub fn mark_deleted(&mut self) {
    self.set(PromptField::Deleted, true);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_field_names_match_serde() {
    let value = serde_json::to_value(Prompt::default()).unwrap();
    for field in PromptField::ALL {
      assert!(value.get(field.name()).is_some(), "missing {}", field.name());
      let key = serde_json::to_value(field).unwrap();
      assert_eq!(key, field.name());
    }
  }

  #[test]
  fn test_set_rejects_wrong_type() {
    let mut prompt = Prompt::default();
    assert!(!prompt.set(PromptField::Title, FieldValue::Flag(true)));
    assert!(prompt.set(PromptField::Archived, FieldValue::Flag(true)));
    assert!(prompt.archived);
  }

  #[test]
  fn test_accessors_read_through_overlay() {
    let mut entity = PromptEntity::create(Prompt::default());
    entity.set_title("Draft");
    entity.set_body("Once upon a time");
    entity.set_archived(true);
    assert_eq!(entity.title(), "Draft");
    assert_eq!(entity.body(), "Once upon a time");
    assert!(entity.archived());
    assert_eq!(entity.base().title, "");
  }
}

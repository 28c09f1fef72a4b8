//! User profiles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{EntityKind, Field, FieldValue, Record, Tier, Tracked};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
  pub username: String,
  pub display_name: String,
  pub bio: String,
  pub avatar_url: Option<String>,
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
  Username,
  DisplayName,
  Bio,
  AvatarUrl,
}

impl Field for ProfileField {
  const ALL: &'static [Self] = &[
    ProfileField::Username,
    ProfileField::DisplayName,
    ProfileField::Bio,
    ProfileField::AvatarUrl,
  ];

  fn name(self) -> &'static str {
    match self {
      ProfileField::Username => "username",
      ProfileField::DisplayName => "display_name",
      ProfileField::Bio => "bio",
      ProfileField::AvatarUrl => "avatar_url",
    }
  }

  fn tier(self) -> Tier {
    match self {
      ProfileField::Username | ProfileField::DisplayName => Tier::Light,
      ProfileField::Bio | ProfileField::AvatarUrl => Tier::Heavy,
    }
  }

  fn is_text(self) -> bool {
    matches!(self, ProfileField::DisplayName | ProfileField::Bio)
  }
}

impl Record for Profile {
  type Field = ProfileField;

  const KIND: EntityKind = EntityKind::Profile;

  fn get(&self, field: ProfileField) -> FieldValue {
    match field {
      ProfileField::Username => FieldValue::Text(self.username.clone()),
      ProfileField::DisplayName => FieldValue::Text(self.display_name.clone()),
      ProfileField::Bio => FieldValue::Text(self.bio.clone()),
      ProfileField::AvatarUrl => FieldValue::Text(self.avatar_url.clone().unwrap_or_default()),
    }
  }

  fn set(&mut self, field: ProfileField, value: FieldValue) -> bool {
    match (field, value) {
      (ProfileField::Username, FieldValue::Text(s)) => self.username = s,
      (ProfileField::DisplayName, FieldValue::Text(s)) => self.display_name = s,
      (ProfileField::Bio, FieldValue::Text(s)) => self.bio = s,
      (ProfileField::AvatarUrl, FieldValue::Text(s)) => {
        self.avatar_url = if s.is_empty() { None } else { Some(s) }
      }
      _ => return false,
    }
    true
  }
}

pub type ProfileEntity = Tracked<Profile>;

impl Tracked<Profile> {
  pub fn username(&self) -> String {
    self.text(ProfileField::Username)
  }

  pub fn display_name(&self) -> String {
    self.text(ProfileField::DisplayName)
  }

  pub fn set_display_name(&mut self, name: impl Into<String>) {
    self.set(ProfileField::DisplayName, name.into());
  }

  pub fn bio(&self) -> String {
    self.text(ProfileField::Bio)
  }

  pub fn set_bio(&mut self, bio: impl Into<String>) {
    self.set(ProfileField::Bio, bio.into());
  }

  pub fn avatar_url(&self) -> Option<String> {
    Some(self.text(ProfileField::AvatarUrl)).filter(|s| !s.is_empty())
  }

  pub fn set_avatar_url(&mut self, url: Option<String>) {
    self.set(ProfileField::AvatarUrl, url.unwrap_or_default());
  }
}

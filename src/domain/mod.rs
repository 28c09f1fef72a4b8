//! Domain entity kinds cached by the client.

mod profile;
mod prompt;

pub use profile::{Profile, ProfileEntity, ProfileField};
pub use prompt::{Prompt, PromptEntity, PromptField};

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use crate::cache::{Cacheable, EntityKind, Record, ServerRecord, Tier, Tracked};

/// Any tracked entity, tagged by kind.
#[derive(Debug, Clone)]
pub enum AnyEntity {
  Profile(ProfileEntity),
  Prompt(PromptEntity),
}

impl AnyEntity {
  pub fn kind(&self) -> EntityKind {
    match self {
      AnyEntity::Profile(_) => EntityKind::Profile,
      AnyEntity::Prompt(_) => EntityKind::Prompt,
    }
  }

  pub fn as_cacheable(&self) -> &dyn Cacheable {
    match self {
      AnyEntity::Profile(e) => e,
      AnyEntity::Prompt(e) => e,
    }
  }

  pub fn as_cacheable_mut(&mut self) -> &mut dyn Cacheable {
    match self {
      AnyEntity::Profile(e) => e,
      AnyEntity::Prompt(e) => e,
    }
  }

  /// Rebuild an entity of the given kind from its persisted form.
  pub fn deserialize(kind: EntityKind, data: &str, tier: Tier) -> Result<Self> {
    Ok(match kind {
      EntityKind::Profile => AnyEntity::Profile(Tracked::deserialize(data, tier)?),
      EntityKind::Prompt => AnyEntity::Prompt(Tracked::deserialize(data, tier)?),
    })
  }

  /// A clean entity from a server payload.
  pub fn from_server_json(kind: EntityKind, data: Value) -> Result<Self> {
    fn parse<R: Record>(data: Value) -> Result<Tracked<R>> {
      let server: ServerRecord<R> = serde_json::from_value(data)
        .map_err(|e| eyre!("Failed to parse {} from server: {}", R::KIND, e))?;
      Ok(Tracked::from_server(server))
    }

    Ok(match kind {
      EntityKind::Profile => AnyEntity::Profile(parse(data)?),
      EntityKind::Prompt => AnyEntity::Prompt(parse(data)?),
    })
  }
}

/// Typed access into `AnyEntity` for one record type.
pub trait Kind: Record {
  fn wrap(entity: Tracked<Self>) -> AnyEntity;

  fn peek(entity: &AnyEntity) -> Option<&Tracked<Self>>;

  fn peek_mut(entity: &mut AnyEntity) -> Option<&mut Tracked<Self>>;
}

impl Kind for Profile {
  fn wrap(entity: Tracked<Self>) -> AnyEntity {
    AnyEntity::Profile(entity)
  }

  fn peek(entity: &AnyEntity) -> Option<&Tracked<Self>> {
    match entity {
      AnyEntity::Profile(e) => Some(e),
      _ => None,
    }
  }

  fn peek_mut(entity: &mut AnyEntity) -> Option<&mut Tracked<Self>> {
    match entity {
      AnyEntity::Profile(e) => Some(e),
      _ => None,
    }
  }
}

impl Kind for Prompt {
  fn wrap(entity: Tracked<Self>) -> AnyEntity {
    AnyEntity::Prompt(entity)
  }

  fn peek(entity: &AnyEntity) -> Option<&Tracked<Self>> {
    match entity {
      AnyEntity::Prompt(e) => Some(e),
      _ => None,
    }
  }

  fn peek_mut(entity: &mut AnyEntity) -> Option<&mut Tracked<Self>> {
    match entity {
      AnyEntity::Prompt(e) => Some(e),
      _ => None,
    }
  }
}

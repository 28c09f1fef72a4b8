//! Tier assignment for durable writes.
//!
//! Records are visited hottest first. Rank decides the starting tier, then a
//! per-kind byte budget downgrades whatever no longer fits. Unconfirmed edits
//! are never dropped: a dirty entity keeps at least its feather form even when
//! the budget is exhausted.

use color_eyre::Result;
use tracing::debug;

use super::entity::Cacheable;
use super::traits::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistencePolicy {
  /// Number of hottest records persisted in full
  pub heavy_slots: usize,
  /// Number of following records persisted with short fields only
  pub light_slots: usize,
  /// Upper bound on serialized bytes per kind; `None` means unbounded
  pub byte_budget: Option<usize>,
}

impl Default for PersistencePolicy {
  fn default() -> Self {
    Self {
      heavy_slots: 25,
      light_slots: 200,
      byte_budget: Some(512 * 1024),
    }
  }
}

impl PersistencePolicy {
  pub fn tier_for_rank(&self, rank: usize) -> Tier {
    if rank < self.heavy_slots {
      Tier::Heavy
    } else if rank < self.heavy_slots + self.light_slots {
      Tier::Light
    } else {
      Tier::Feather
    }
  }

  /// Pick the tier for the entity at `rank`, charging its weight to `used`.
  pub fn assign(&self, rank: usize, entity: &mut dyn Cacheable, used: &mut usize) -> Result<Tier> {
    if entity.is_deleted() && !entity.is_dirty() {
      return Ok(Tier::Forget);
    }

    let mut tier = self.tier_for_rank(rank);
    let Some(budget) = self.byte_budget else {
      *used += entity.compute_weight(tier)?;
      return Ok(tier);
    };

    loop {
      let weight = entity.compute_weight(tier)?;
      let floor = if entity.is_dirty() {
        Tier::Feather
      } else {
        Tier::Forget
      };
      if *used + weight <= budget || tier <= floor {
        *used += weight;
        return Ok(tier);
      }
      let lower = match tier {
        Tier::Heavy => Tier::Light,
        Tier::Light => Tier::Feather,
        Tier::Feather | Tier::Forget => Tier::Forget,
      };
      debug!(kind = %entity.kind(), id = %entity.client_id(), from = ?tier, to = ?lower, "over budget, downgrading");
      tier = lower;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{ClientId, ServerRecord, Tracked};
  use crate::domain::{Prompt, PromptEntity};

  fn prompt(body_len: usize) -> PromptEntity {
    Tracked::from_server(ServerRecord {
      id: 1,
      client_id: ClientId::from("p"),
      record: Prompt {
        title: "t".to_string(),
        body: "x".repeat(body_len),
        ..Prompt::default()
      },
    })
  }

  #[test]
  fn test_rank_tiers() {
    let policy = PersistencePolicy {
      heavy_slots: 1,
      light_slots: 2,
      byte_budget: None,
    };
    assert_eq!(policy.tier_for_rank(0), Tier::Heavy);
    assert_eq!(policy.tier_for_rank(1), Tier::Light);
    assert_eq!(policy.tier_for_rank(2), Tier::Light);
    assert_eq!(policy.tier_for_rank(3), Tier::Feather);
  }

  #[test]
  fn test_budget_downgrades_clean_entity_to_forget() {
    let policy = PersistencePolicy {
      heavy_slots: 10,
      light_slots: 0,
      byte_budget: Some(20),
    };
    let mut used = 0;
    let mut entity = prompt(1000);
    assert_eq!(policy.assign(0, &mut entity, &mut used).unwrap(), Tier::Forget);
    assert_eq!(used, 0);
  }

  #[test]
  fn test_budget_downgrades_step_by_step() {
    let mut entity = prompt(1000);
    let light = entity.compute_weight(Tier::Light).unwrap();
    let policy = PersistencePolicy {
      heavy_slots: 10,
      light_slots: 0,
      byte_budget: Some(light),
    };
    let mut used = 0;
    assert_eq!(policy.assign(0, &mut entity, &mut used).unwrap(), Tier::Light);
    assert_eq!(used, light);
  }

  #[test]
  fn test_dirty_entity_keeps_feather_over_budget() {
    let policy = PersistencePolicy {
      heavy_slots: 10,
      light_slots: 0,
      byte_budget: Some(0),
    };
    let mut entity = prompt(10);
    entity.set_title("edited");
    let mut used = 0;
    assert_eq!(policy.assign(0, &mut entity, &mut used).unwrap(), Tier::Feather);
    assert!(used > 0);
  }

  #[test]
  fn test_deleted_clean_entity_is_forgotten() {
    let mut entity = prompt(10);
    entity.on_server_confirmed(
      ServerRecord {
        id: 1,
        client_id: ClientId::from("p"),
        record: Prompt {
          deleted: true,
          ..Prompt::default()
        },
      },
      true,
    );
    let mut used = 0;
    let tier = PersistencePolicy::default()
      .assign(0, &mut entity, &mut used)
      .unwrap();
    assert_eq!(tier, Tier::Forget);
  }
}

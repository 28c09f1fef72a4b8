//! Mutation replay queue.
//!
//! Local creates, updates and deletes are recorded as `MutationUnit`s in the
//! order they were issued. On reconnect the queue is replayed front to back;
//! a unit that fails for a retryable reason goes back to the front and replay
//! stops, so nothing behind it is sent out of order.

mod unit;

pub use unit::{Action, MutationUnit, Outcome};

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::cache::{CacheManager, ClientId, EntityKind, KindError};
use crate::remote::{Remote, RemoteError};

/// Summary of one `replay_all` pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
  pub confirmed: usize,
  pub deleted: usize,
  pub skipped: usize,
  /// Units the server accepted without a readable reply
  pub unconfirmed: usize,
  /// Units removed because retrying cannot succeed
  pub dropped: usize,
  pub collisions: usize,
  /// Set when a failure left units queued
  pub stalled: Option<String>,
}

#[derive(Debug, Default)]
pub struct ReplayQueue {
  units: VecDeque<MutationUnit>,
  next_seq: u64,
  max_collision_retries: u32,
}

impl ReplayQueue {
  pub fn new(max_collision_retries: u32) -> Self {
    Self {
      units: VecDeque::new(),
      next_seq: 0,
      max_collision_retries,
    }
  }

  /// Record a mutation. Queue order is replay order.
  pub fn enqueue(&mut self, kind: EntityKind, action: Action, target: ClientId) -> &MutationUnit {
    self.next_seq += 1;
    let unit = MutationUnit {
      seq: self.next_seq,
      kind,
      action,
      target,
      issued_at: Utc::now(),
    };
    info!(kind = %kind, id = %unit.target, action = %action, seq = unit.seq, "queued mutation");
    self.units.push_back(unit);
    &self.units[self.units.len() - 1]
  }

  pub fn len(&self) -> usize {
    self.units.len()
  }

  pub fn is_empty(&self) -> bool {
    self.units.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &MutationUnit> {
    self.units.iter()
  }

  pub fn pending(&self, kind: EntityKind) -> usize {
    self.units.iter().filter(|u| u.kind == kind).count()
  }

  pub fn clear(&mut self) {
    self.units.clear();
    self.next_seq = 0;
  }

  /// Serialized units of one kind, in queue order, for the kind's durable blob.
  pub fn serialize_kind(&self, kind: EntityKind) -> Result<Vec<String>> {
    self
      .units
      .iter()
      .filter(|u| u.kind == kind)
      .map(|u| serde_json::to_string(u).map_err(|e| eyre!("Failed to serialize mutation {}: {}", u.seq, e)))
      .collect()
  }

  /// Restore units read back from the durable store. Global order is rebuilt
  /// from sequence numbers since each kind's units are stored separately.
  pub fn hydrate(&mut self, serialized: &[String]) -> usize {
    let mut restored = 0;
    for raw in serialized {
      match serde_json::from_str::<MutationUnit>(raw) {
        Ok(unit) => {
          if self.units.iter().any(|u| u.seq == unit.seq) {
            continue;
          }
          self.next_seq = self.next_seq.max(unit.seq);
          self.units.push_back(unit);
          restored += 1;
        }
        Err(e) => warn!(error = %e, "skipping unreadable queued mutation"),
      }
    }
    self.units.make_contiguous().sort_by_key(|u| u.seq);
    restored
  }

  /// Replay every queued unit in order while the remote stays reachable.
  pub async fn replay_all(&mut self, manager: &mut CacheManager, remote: &dyn Remote) -> ReplayReport {
    let mut report = ReplayReport::default();
    if !self.units.is_empty() && !remote.is_online().await {
      report.stalled = Some("remote is offline".to_string());
      return report;
    }

    while let Some(unit) = self.units.pop_front() {
      let mut attempts = 0;
      let failure = loop {
        match unit.replay(manager, remote).await {
          Ok(Outcome::Confirmed) => report.confirmed += 1,
          Ok(Outcome::Deleted) => report.deleted += 1,
          Ok(Outcome::Skipped) => report.skipped += 1,
          Ok(Outcome::Unconfirmed) => report.unconfirmed += 1,
          Err(RemoteError::IdentityCollision) if attempts < self.max_collision_retries => {
            attempts += 1;
            report.collisions += 1;
            if manager
              .handle_identity_collision(unit.kind, &unit.target)
              .is_none()
            {
              report.skipped += 1;
              break None;
            }
            continue;
          }
          Err(RemoteError::Unauthorized(message)) => {
            warn!(kind = %unit.kind, id = %unit.target, seq = unit.seq, "dropping unauthorized mutation");
            manager.set_kind_error(
              unit.kind,
              KindError::Unauthorized {
                id: unit.target.clone(),
                message,
              },
            );
            report.dropped += 1;
          }
          Err(RemoteError::NotFound) => {
            warn!(kind = %unit.kind, id = %unit.target, seq = unit.seq, "entity vanished server-side, dropping mutation");
            manager.untrack(unit.kind, &unit.target);
            manager.set_kind_error(
              unit.kind,
              KindError::NoLongerExists {
                id: unit.target.clone(),
              },
            );
            report.dropped += 1;
          }
          Err(e) => break Some(e.to_string()),
        }
        break None;
      };

      if let Some(reason) = failure {
        warn!(kind = %unit.kind, id = %unit.target, seq = unit.seq, reason = %reason, "replay stalled, unit stays queued");
        self.units.push_front(unit);
        report.stalled = Some(reason);
        break;
      }
    }

    info!(
      confirmed = report.confirmed,
      deleted = report.deleted,
      dropped = report.dropped,
      remaining = self.units.len(),
      "replay finished"
    );
    report
  }
}

//! One signed-in client: the cache manager, the replay queue, the durable
//! store and the remote, wired together.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde_json::Value;
use tracing::{info, warn};

use crate::cache::{
  CacheManager, Cacheable, ClientId, DurableStore, EntityKind, KindError, NoopStore, SqliteStore,
  Tracked,
};
use crate::config::Config;
use crate::domain::{Kind, Prompt};
use crate::remote::{self, HttpRemote, Remote};
use crate::replay::{Action, ReplayQueue, ReplayReport};

/// Per-kind summary for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindStatus {
  pub kind: EntityKind,
  pub tracked: usize,
  pub dirty: usize,
  pub pending: usize,
  pub error: Option<KindError>,
}

pub struct Session {
  manager: CacheManager,
  queue: ReplayQueue,
  store: Box<dyn DurableStore>,
  remote: Box<dyn Remote>,
}

impl Session {
  pub fn new(
    manager: CacheManager,
    queue: ReplayQueue,
    store: Box<dyn DurableStore>,
    remote: Box<dyn Remote>,
  ) -> Self {
    Self {
      manager,
      queue,
      store,
      remote,
    }
  }

  /// Build a session from configuration and restore whatever was persisted.
  pub fn open(config: &Config) -> Result<Self> {
    let store: Box<dyn DurableStore> = if config.cache.enabled {
      Box::new(SqliteStore::open(config.cache.db_path.as_deref())?)
    } else {
      Box::new(NoopStore)
    };
    let token = match Config::get_api_token() {
      Ok(token) => token,
      Err(e) => {
        // Local edits still work; the remote will reject calls until a token is set
        warn!(error = %e, "no API token configured");
        String::new()
      }
    };
    let remote = HttpRemote::new(&config.remote, token)?;

    let mut session = Self::new(
      CacheManager::new(config.cache.policy()),
      ReplayQueue::new(config.replay.max_collision_retries),
      store,
      Box::new(remote),
    );
    session.hydrate();
    Ok(session)
  }

  pub fn manager(&self) -> &CacheManager {
    &self.manager
  }

  pub fn manager_mut(&mut self) -> &mut CacheManager {
    &mut self.manager
  }

  pub fn queue(&self) -> &ReplayQueue {
    &self.queue
  }

  /// Load every kind and the queued mutations from the durable store.
  pub fn hydrate(&mut self) {
    let mut mutations = Vec::new();
    for kind in EntityKind::ALL {
      let hydrated = self.manager.read_from_durable_store(*kind, self.store.as_ref());
      mutations.extend(hydrated.mutations);
    }
    let restored = self.queue.hydrate(&mutations);
    info!(queued = restored, "session hydrated");
  }

  /// Write every kind, with its share of the queue, to the durable store.
  pub fn persist(&mut self) -> Result<()> {
    for kind in EntityKind::ALL {
      let mutations = self.queue.serialize_kind(*kind)?;
      self
        .manager
        .write_to_durable_store(*kind, self.store.as_ref(), mutations)?;
    }
    Ok(())
  }

  // ---------------------------------------------------------------------------
  // Local mutations
  // ---------------------------------------------------------------------------

  /// Track a brand-new local entity and queue its creation.
  pub fn create<R: Kind>(&mut self, initial: R) -> ClientId {
    let id = self.manager.track_entity(Tracked::create(initial));
    self.queue.enqueue(R::KIND, Action::Create, id.clone());
    id
  }

  /// Edit a tracked entity and queue the update.
  pub fn edit<R: Kind, T>(&mut self, id: &ClientId, f: impl FnOnce(&mut Tracked<R>) -> T) -> Result<T> {
    let out = self
      .manager
      .update::<R, T>(id, f)
      .ok_or_else(|| eyre!("{} {} is not cached", R::KIND, id))?;
    self.queue.enqueue(R::KIND, Action::Update, id.clone());
    Ok(out)
  }

  /// Mark a prompt deleted locally and queue the deletion.
  pub fn delete_prompt(&mut self, id: &ClientId) -> Result<()> {
    self
      .manager
      .update::<Prompt, _>(id, |p| p.mark_deleted())
      .ok_or_else(|| eyre!("prompt {} is not cached", id))?;
    self.queue.enqueue(EntityKind::Prompt, Action::Delete, id.clone());
    Ok(())
  }

  // ---------------------------------------------------------------------------
  // Remote reconciliation
  // ---------------------------------------------------------------------------

  /// Fold a server record into the cache as a push. Tombstones with no pending edit are untracked.
  fn absorb(&mut self, kind: EntityKind, data: Value) -> Result<ClientId> {
    let id = self.manager.apply_push(kind, data)?;
    let gone = self
      .manager
      .peek(kind, &id)
      .map(|e| {
        let e = e.as_cacheable();
        e.is_deleted() && !e.is_dirty()
      })
      .unwrap_or(false);
    if gone {
      self.manager.untrack(kind, &id);
    }
    Ok(id)
  }

  fn absorb_all(&mut self, kind: EntityKind, records: Vec<Value>) -> usize {
    let mut newest = self.manager.watermark(kind);
    let mut applied = 0;
    for data in records {
      let at = remote::updated_at(&data);
      match self.absorb(kind, data) {
        Ok(_) => {
          applied += 1;
          newest = newest.max(at);
        }
        Err(e) => warn!(kind = %kind, error = %e, "skipping unreadable server record"),
      }
    }
    if let Some(watermark) = newest {
      self.manager.set_watermark(kind, watermark);
    }
    applied
  }

  /// Read everything changed since the kind's watermark and apply it.
  pub async fn refresh(&mut self, kind: EntityKind) -> Result<usize> {
    let since = self.manager.watermark(kind);
    let records = self.remote.read_since(kind, since).await?;
    let applied = self.absorb_all(kind, records);
    info!(kind = %kind, applied, "refreshed");
    Ok(applied)
  }

  /// Refresh every kind. Reads run concurrently; a failing kind does not stop the others.
  pub async fn refresh_all(&mut self) -> usize {
    let remote = self.remote.as_ref();
    let reads = EntityKind::ALL.iter().map(|kind| {
      let since = self.manager.watermark(*kind);
      async move { (*kind, remote.read_since(*kind, since).await) }
    });
    let results = join_all(reads).await;

    let mut applied = 0;
    for (kind, result) in results {
      match result {
        Ok(records) => applied += self.absorb_all(kind, records),
        Err(e) => warn!(kind = %kind, error = %e, "refresh failed"),
      }
    }
    applied
  }

  /// Read one record by server id and apply it.
  pub async fn fetch_one(&mut self, kind: EntityKind, server_id: i64) -> Result<ClientId> {
    let data = self.remote.read_one(kind, server_id).await?;
    self.absorb(kind, data)
  }

  /// Replay queued mutations, pull what changed meanwhile, and persist.
  pub async fn reconnect(&mut self) -> Result<ReplayReport> {
    let report = self
      .queue
      .replay_all(&mut self.manager, self.remote.as_ref())
      .await;
    if report.stalled.is_none() {
      self.refresh_all().await;
    }
    self.persist()?;
    Ok(report)
  }

  /// Forget everything this session cached, in memory and on disk.
  pub fn sign_out(&mut self) -> Result<()> {
    self.manager.clear();
    self.queue.clear();
    self.store.clear()?;
    info!("signed out");
    Ok(())
  }

  pub fn status(&self) -> Vec<KindStatus> {
    EntityKind::ALL
      .iter()
      .map(|kind| KindStatus {
        kind: *kind,
        tracked: self.manager.len(*kind),
        dirty: self.manager.dirty_count(*kind),
        pending: self.queue.pending(*kind),
        error: self.manager.kind_error(*kind).cloned(),
      })
      .collect()
  }
}

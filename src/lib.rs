//! Offline-first entity cache for a writing client.
//!
//! Tracked entities live in a `CacheManager` that ranks them by recency of
//! local writes, persists the hottest ones at full detail into a durable
//! store, and records every local mutation in a `ReplayQueue` that is
//! resubmitted to the remote service when the client comes back online.

pub mod cache;
pub mod config;
pub mod domain;
pub mod logging;
pub mod remote;
pub mod replay;
pub mod session;

pub use session::{KindStatus, Session};

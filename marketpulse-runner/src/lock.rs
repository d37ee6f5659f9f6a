//! Run exclusivity through an object-store lock marker.
//!
//! The marker lives outside the dataset prefix so the upserter never sees it.
//! A marker older than `stale_after` belongs to a crashed run and is broken.

use chrono::{DateTime, Utc};
use marketpulse_core::store::{ObjectStore, StoreError, JSON_CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const LOCK_KEY: &str = "_locks/pipeline.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
    pub pid: u32,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run ({run_id}, pid {pid}) holds the pipeline lock since {acquired_at}")]
    Held {
        run_id: String,
        pid: u32,
        acquired_at: DateTime<Utc>,
    },

    #[error("pipeline lock storage error: {0}")]
    Store(#[from] StoreError),
}

/// Held pipeline lock. Released on drop.
pub struct RunLock<'a> {
    store: &'a dyn ObjectStore,
    run_id: String,
    released: bool,
}

impl<'a> RunLock<'a> {
    pub fn acquire(
        store: &'a dyn ObjectStore,
        run_id: &str,
        stale_after: Duration,
    ) -> Result<Self, LockError> {
        let record = LockRecord {
            run_id: run_id.to_string(),
            acquired_at: Utc::now(),
            pid: std::process::id(),
        };
        let body = serde_json::to_vec(&record).map_err(|e| {
            StoreError::Unavailable(format!("cannot encode lock record: {e}"))
        })?;

        if store.put_if_absent(LOCK_KEY, &body, JSON_CONTENT_TYPE)? {
            debug!(run_id, "pipeline lock acquired");
            return Ok(Self::held(store, run_id));
        }

        let Some((raw, current)) = read_marker(store)? else {
            // Released between our two looks.
            return Self::claim(store, run_id, &body);
        };
        if let Some(current) = current {
            if !is_stale(&current, record.acquired_at, stale_after) {
                return Err(held_by(Some(current)));
            }
            warn!(previous = %current.run_id, "breaking stale pipeline lock");
        } else {
            warn!("breaking unreadable pipeline lock");
        }

        // Only the exact marker judged stale may go; a fresh one written by
        // another run in the meantime stays.
        if !store.delete_if(LOCK_KEY, &raw)? {
            return Err(held_by(read_record(store)?));
        }
        Self::claim(store, run_id, &body)
    }

    /// Create the marker and confirm it carries our run id.
    fn claim(store: &'a dyn ObjectStore, run_id: &str, body: &[u8]) -> Result<Self, LockError> {
        if !store.put_if_absent(LOCK_KEY, body, JSON_CONTENT_TYPE)? {
            return Err(held_by(read_record(store)?));
        }
        match read_record(store)? {
            Some(current) if current.run_id == run_id => {
                debug!(run_id, "pipeline lock acquired");
                Ok(Self::held(store, run_id))
            }
            other => Err(held_by(other)),
        }
    }

    fn held(store: &'a dyn ObjectStore, run_id: &str) -> Self {
        Self {
            store,
            run_id: run_id.to_string(),
            released: false,
        }
    }

    /// Remove the marker if it is still ours.
    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.remove()
    }

    fn remove(&self) -> Result<(), StoreError> {
        match read_marker(self.store)? {
            Some((raw, Some(current))) if current.run_id == self.run_id => {
                if !self.store.delete_if(LOCK_KEY, &raw)? {
                    warn!(run_id = %self.run_id, "pipeline lock changed while releasing");
                }
                Ok(())
            }
            Some((_, current)) => {
                warn!(
                    ours = %self.run_id,
                    theirs = ?current.map(|r| r.run_id),
                    "pipeline lock was taken over, leaving it in place"
                );
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Drop for RunLock<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove() {
            warn!(error = %e, "failed to release pipeline lock");
        }
    }
}

/// Raw marker bytes plus the decoded record; an unreadable marker decodes to `None`.
fn read_marker(store: &dyn ObjectStore) -> Result<Option<(Vec<u8>, Option<LockRecord>)>, StoreError> {
    let Some(bytes) = store.get(LOCK_KEY)? else {
        return Ok(None);
    };
    let record = match serde_json::from_slice(&bytes) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(error = %e, "unreadable pipeline lock marker");
            None
        }
    };
    Ok(Some((bytes, record)))
}

fn read_record(store: &dyn ObjectStore) -> Result<Option<LockRecord>, StoreError> {
    Ok(read_marker(store)?.and_then(|(_, record)| record))
}

fn held_by(current: Option<LockRecord>) -> LockError {
    match current {
        Some(r) => LockError::Held {
            run_id: r.run_id,
            pid: r.pid,
            acquired_at: r.acquired_at,
        },
        None => LockError::Held {
            run_id: "unknown".to_string(),
            pid: 0,
            acquired_at: Utc::now(),
        },
    }
}

fn is_stale(record: &LockRecord, now: DateTime<Utc>, stale_after: Duration) -> bool {
    let age = now.signed_duration_since(record.acquired_at);
    age.to_std().map(|age| age > stale_after).unwrap_or(false)
}

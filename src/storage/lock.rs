//! Per-stage run lock.
//!
//! A stage may only be run by one process at a time. The lock is the object
//! `locks/{stage}.lock`, created with `put_if_absent`. A lock older than the
//! configured stale age is assumed to belong to a crashed run and is broken;
//! a lock whose body cannot be read is never broken automatically.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::StageId;
use crate::storage::BlobStore;

#[derive(Debug, Serialize, Deserialize)]
struct LockBody {
    created_at: DateTime<Utc>,
    pid: u32,
}

/// Held lock for one stage. Release explicitly with [`StageLock::release`].
pub struct StageLock {
    blobs: Arc<dyn BlobStore>,
    stage: StageId,
    released: bool,
}

impl StageLock {
    pub fn path(stage: StageId) -> String {
        format!("locks/{}.lock", stage.dir_name())
    }

    /// Take the lock for `stage`, breaking it if it is older than `stale_after`.
    pub async fn acquire(
        blobs: Arc<dyn BlobStore>,
        stage: StageId,
        stale_after: Duration,
    ) -> Result<Self> {
        let path = Self::path(stage);
        let body = serde_json::to_vec(&LockBody {
            created_at: Utc::now(),
            pid: std::process::id(),
        })?;

        if !blobs.put_if_absent(&path, &body).await? {
            // An unreadable lock stays held until removed by hand.
            if let Some(bytes) = blobs.get(&path).await? {
                let since = match serde_json::from_slice::<LockBody>(&bytes) {
                    Ok(held) => held.created_at,
                    Err(e) => {
                        log::warn!("Unreadable lock {}: {}", blobs.location(&path), e);
                        return Err(AppError::LockHeld {
                            stage,
                            since: "unknown".into(),
                        });
                    }
                };
                if Utc::now() - since <= stale_after {
                    return Err(AppError::LockHeld {
                        stage,
                        since: since.to_rfc3339(),
                    });
                }
                log::warn!("Breaking stale lock {}", blobs.location(&path));
                blobs.delete(&path).await?;
            }

            if !blobs.put_if_absent(&path, &body).await? {
                return Err(AppError::LockHeld {
                    stage,
                    since: "just now".into(),
                });
            }
        }

        log::debug!("Acquired {}", blobs.location(&path));
        Ok(Self {
            blobs,
            stage,
            released: false,
        })
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.blobs.delete(&Self::path(self.stage)).await?;
        Ok(())
    }
}

impl Drop for StageLock {
    fn drop(&mut self) {
        if !self.released {
            log::warn!(
                "Lock for stage {} dropped without release; it will expire as stale",
                self.stage
            );
        }
    }
}

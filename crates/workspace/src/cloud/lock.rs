//! The container write lock.
//!
//! A writer holds the lock by owning `<containerId>/write-lock.json` in the
//! container's storage. The object is created with a conditional write, so
//! exactly one of several racing writers wins; everybody else fails at once
//! rather than queueing. Locks carry a lease and an expired lease may be
//! taken over by the next writer. Takeover and release are compare-and-swap
//! on the record, so they never clobber a lock somebody else just won.

use exn::ResultExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::CloudContainer;
use crate::error::{ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteLockRecord {
    /// Who holds the lock, for error messages.
    pub holder: String,
    /// Identifies the container instance holding the lock.
    pub session: String,
    /// Unix timestamp after which the lock may be taken over.
    pub expires_at: i64,
}

impl WriteLockRecord {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now.unix_timestamp()
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).or_raise(|| ErrorKind::Io)
    }
}

/// Run `operation` while holding the write lock of `container`.
///
/// On success the changes made by `operation` are published; on failure
/// they are abandoned. Either way the lock is released before returning,
/// and the operation's own error takes precedence over any error from
/// cleaning up after it.
///
/// ```no_run
/// # use stow_workspace::{CloudContainer, with_write_lock, error::Result};
/// # async fn example(container: &CloudContainer) -> Result<()> {
/// with_write_lock("release-bot", container, || async {
///     // mutate dbs of this container here
///     Ok(())
/// })
/// .await
/// # }
/// ```
pub async fn with_write_lock<T, F, Fut>(user: &str, container: &CloudContainer, operation: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    container.acquire_write_lock(user).await?;
    match operation().await {
        Ok(value) => {
            container.release_write_lock().await?;
            Ok(value)
        },
        Err(err) => {
            if let Err(abandon) = container.abandon_changes().await {
                tracing::warn!(container = %container.id(), error = %*abandon, "could not abandon changes");
            }
            if let Err(release) = container.release_write_lock().await {
                tracing::warn!(container = %container.id(), error = %*release, "could not release write lock");
            }
            Err(err)
        },
    }
}

//! Keyspace notification setup
//!
//! Expiration events are only published when `notify-keyspace-events` contains
//! `E` (keyevent channel) and `x` (expired events). This runs once at startup.

use serde::Deserialize;
use tracing::info;

use crate::store::{KeyspaceStore, StoreError};

pub const NOTIFY_PARAMETER: &str = "notify-keyspace-events";

/// Value written by [`RepairMode::Overwrite`].
pub const EXPIRY_FLAGS: &str = "Ex";

const KEYEVENT_FLAG: char = 'E';
const EXPIRED_FLAG: char = 'x';
/// Alias for "all event classes", which includes `x`.
const ALL_EVENTS_FLAG: char = 'A';

/// How a missing flag is repaired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RepairMode {
    /// Add the missing flags to the existing ones.
    #[default]
    Merge,
    /// Replace the whole value with `Ex` unless `E` or `x` is already present.
    /// Other flags are lost.
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyEnabled { current: String },
    Updated { previous: String, applied: String },
}

/// Flag string to write for `current`, or `None` if no write is needed.
pub fn repaired_flags(current: &str, mode: RepairMode) -> Option<String> {
    let has_keyevent = current.contains(KEYEVENT_FLAG);
    let has_expired = current.contains(EXPIRED_FLAG) || current.contains(ALL_EVENTS_FLAG);

    match mode {
        RepairMode::Overwrite => {
            if current.contains(KEYEVENT_FLAG) || current.contains(EXPIRED_FLAG) {
                None
            } else {
                Some(EXPIRY_FLAGS.to_string())
            }
        }
        RepairMode::Merge => {
            if has_keyevent && has_expired {
                return None;
            }
            let mut flags = current.to_string();
            if !has_keyevent {
                flags.push(KEYEVENT_FLAG);
            }
            if !has_expired {
                flags.push(EXPIRED_FLAG);
            }
            Some(flags)
        }
    }
}

/// Make sure the store publishes expiration events.
///
/// Issues at most one `CONFIG SET`. Errors are returned as-is; there is no retry.
pub async fn ensure_expiry_notifications<S: KeyspaceStore + ?Sized>(
    store: &S,
    mode: RepairMode,
) -> Result<EnsureOutcome, StoreError> {
    let current = store.config_get(NOTIFY_PARAMETER).await?;

    let Some(applied) = repaired_flags(&current, mode) else {
        info!(
            "{} is already configured to support expiration notifications ({:?})",
            NOTIFY_PARAMETER, current
        );
        return Ok(EnsureOutcome::AlreadyEnabled { current });
    };

    store.config_set(NOTIFY_PARAMETER, &applied).await?;
    info!(
        "Configured {} to {:?} (was {:?})",
        NOTIFY_PARAMETER, applied, current
    );
    Ok(EnsureOutcome::Updated {
        previous: current,
        applied,
    })
}

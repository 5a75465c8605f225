//! Sweep cycle
//!
//! One cycle walks `SnapshotCreate → SnapshotRead → Drain → Cleanup` and stops at
//! the first error. `TYPE` on each snapshotted key makes the store evaluate the
//! key's expiry, which reclaims keys that expired but were never accessed again.
//!
//! Backlog errors are fatal to the process. Store errors abort the cycle only:
//! the snapshot stays on disk and is merged into the next cycle's snapshot.

pub mod retry;

pub use retry::{RetryConfig, RetryResult};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::backlog::{BacklogError, BacklogStore};
use crate::store::{ExpiredKey, KeyspaceStore, StoreError};
use retry::retry_transient;

/// Upper bound on the pause between two `TYPE` calls.
pub const INTERVAL_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    SnapshotCreate,
    SnapshotRead,
    Drain,
    Cleanup,
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepPhase::SnapshotCreate => "snapshot-create",
            SweepPhase::SnapshotRead => "snapshot-read",
            SweepPhase::Drain => "drain",
            SweepPhase::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("sweep failed during {phase}: {source}")]
    Backlog {
        phase: SweepPhase,
        #[source]
        source: BacklogError,
    },
    #[error("sweep aborted at key {key:?} after {attempts} attempt(s), {remaining} key(s) left: {source}")]
    Store {
        key: String,
        attempts: u32,
        remaining: usize,
        #[source]
        source: StoreError,
    },
}

impl SweepError {
    /// Local storage can no longer be trusted; the process must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SweepError::Backlog { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records moved out of the backlog (duplicates included)
    pub swapped_records: usize,
    /// Unique keys in the snapshot
    pub snapshot_keys: usize,
    /// A snapshot from an interrupted sweep was drained too
    pub recovered: bool,
    pub inspected: usize,
    /// `TYPE` answered `none`: the key is gone
    pub evicted: usize,
    /// `TYPE` found the key alive again (re-created after it expired)
    pub still_present: usize,
    pub retries: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSettings {
    /// Pause between two consecutive `TYPE` calls.
    pub interval: Duration,
    pub retry: RetryConfig,
}

impl Default for SweepSettings {
    fn default() -> Self {
        SweepSettings {
            interval: Duration::from_millis(300),
            retry: RetryConfig::DEFAULT,
        }
    }
}

pub struct Sweeper<S: ?Sized> {
    backlog: Arc<BacklogStore>,
    store: Arc<S>,
    settings: SweepSettings,
}

impl<S: KeyspaceStore + ?Sized> Sweeper<S> {
    pub fn new(backlog: Arc<BacklogStore>, store: Arc<S>, settings: SweepSettings) -> Self {
        debug_assert!(
            settings.interval <= INTERVAL_MAX,
            "Precondition: interval {:?} exceeds max {:?}",
            settings.interval,
            INTERVAL_MAX
        );
        Sweeper {
            backlog,
            store,
            settings,
        }
    }

    /// Run one complete sweep cycle.
    pub async fn run_cycle(&self) -> Result<SweepReport, SweepError> {
        let started = Instant::now();
        info!("Start lazily deleting expired keys");

        let stats = self
            .backlog
            .create_snapshot()
            .map_err(|source| SweepError::Backlog {
                phase: SweepPhase::SnapshotCreate,
                source,
            })?;

        let keys = self
            .backlog
            .read_snapshot()
            .map_err(|source| SweepError::Backlog {
                phase: SweepPhase::SnapshotRead,
                source,
            })?;

        let mut report = SweepReport {
            swapped_records: stats.swapped_records,
            snapshot_keys: keys.len(),
            recovered: stats.recovered,
            ..SweepReport::default()
        };

        self.drain(&keys, &mut report).await?;

        self.backlog
            .discard_snapshot()
            .map_err(|source| SweepError::Backlog {
                phase: SweepPhase::Cleanup,
                source,
            })?;

        report.elapsed = started.elapsed();
        info!(
            snapshot_keys = report.snapshot_keys,
            evicted = report.evicted,
            still_present = report.still_present,
            retries = report.retries,
            recovered = report.recovered,
            "Finished lazily deleting in {:?}",
            report.elapsed
        );
        Ok(report)
    }

    /// Type-inspect every key in order, pausing `interval` between keys.
    async fn drain(&self, keys: &[ExpiredKey], report: &mut SweepReport) -> Result<(), SweepError> {
        for (index, key) in keys.iter().enumerate() {
            if index > 0 && !self.settings.interval.is_zero() {
                tokio::time::sleep(self.settings.interval).await;
            }

            let what = format!("TYPE {}", key);
            let outcome =
                retry_transient(&self.settings.retry, &what, || self.store.key_type(key)).await;

            let (kind, retries) = match outcome {
                RetryResult::Success { value, retries } => (value, retries),
                RetryResult::ExhaustedRetries {
                    last_error,
                    attempts,
                } => {
                    return Err(self.aborted(key, attempts, keys.len() - index, last_error));
                }
                RetryResult::PermanentError(e) => {
                    return Err(self.aborted(key, 1, keys.len() - index, e));
                }
            };

            report.inspected += 1;
            report.retries += retries;
            if kind.exists() {
                report.still_present += 1;
                debug!("Key {} still exists as {:?}", key, kind);
            } else {
                report.evicted += 1;
                debug!("Got type of key {}", key);
            }
        }
        Ok(())
    }

    fn aborted(&self, key: &ExpiredKey, attempts: u32, remaining: usize, source: StoreError) -> SweepError {
        SweepError::Store {
            key: key.to_string(),
            attempts,
            remaining,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::FsyncPolicy;
    use crate::store::{InMemoryStore, KeyType};
    use tempfile::tempdir;

    fn settings(interval_ms: u64, max_retries: u32) -> SweepSettings {
        SweepSettings {
            interval: Duration::from_millis(interval_ms),
            retry: RetryConfig {
                max_retries,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                backoff_multiplier: 2.0,
            },
        }
    }

    fn setup(names: &[&str]) -> (tempfile::TempDir, Arc<BacklogStore>, Arc<InMemoryStore>) {
        let dir = tempdir().unwrap();
        let backlog = Arc::new(BacklogStore::open(dir.path(), FsyncPolicy::Never).unwrap());
        for &name in names {
            backlog.append(&ExpiredKey::from(name)).unwrap();
        }
        (dir, backlog, Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn test_cycle_inspects_unique_keys_in_order() {
        let (_dir, backlog, store) = setup(&["k1", "k2", "k1", "k3"]);
        let sweeper = Sweeper::new(backlog.clone(), store.clone(), settings(0, 0));

        let report = sweeper.run_cycle().await.unwrap();

        assert_eq!(store.inspected_keys(), vec!["k1", "k2", "k3"]);
        assert_eq!(report.swapped_records, 4);
        assert_eq!(report.snapshot_keys, 3);
        assert_eq!(report.evicted, 3);
        assert!(!backlog.paths().snapshot.exists());
    }

    #[tokio::test]
    async fn test_drain_respects_interval() {
        let (_dir, backlog, store) = setup(&["a", "b", "c", "d"]);
        let sweeper = Sweeper::new(backlog, store.clone(), settings(25, 0));

        let report = sweeper.run_cycle().await.unwrap();

        let calls = store.type_calls();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(25));
        }
        assert!(report.elapsed >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn test_live_keys_are_counted_separately() {
        let (_dir, backlog, store) = setup(&["gone", "back"]);
        store.insert_key("back", KeyType::Hash);
        let sweeper = Sweeper::new(backlog, store, settings(0, 0));

        let report = sweeper.run_cycle().await.unwrap();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.still_present, 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (_dir, backlog, store) = setup(&["k1", "k2"]);
        store.fail_next_type_calls(2);
        let sweeper = Sweeper::new(backlog, store.clone(), settings(0, 3));

        let report = sweeper.run_cycle().await.unwrap();
        assert_eq!(report.retries, 2);
        assert_eq!(report.inspected, 2);
        assert_eq!(store.inspected_keys(), vec!["k1", "k1", "k1", "k2"]);
    }

    #[tokio::test]
    async fn test_store_failure_keeps_snapshot_for_next_cycle() {
        let (_dir, backlog, store) = setup(&["k1", "k2"]);
        store.reject_type_calls(true);
        let sweeper = Sweeper::new(backlog.clone(), store.clone(), settings(0, 3));

        let err = sweeper.run_cycle().await.unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(err, SweepError::Store { attempts: 1, remaining: 2, .. }));
        assert!(backlog.paths().snapshot.exists());

        store.reject_type_calls(false);
        backlog.append(&ExpiredKey::from("k3")).unwrap();
        let report = sweeper.run_cycle().await.unwrap();
        assert!(report.recovered);
        assert_eq!(report.snapshot_keys, 3);
    }

    #[tokio::test]
    async fn test_empty_backlog_is_a_no_op() {
        let (_dir, backlog, store) = setup(&[]);
        let sweeper = Sweeper::new(backlog, store.clone(), settings(0, 0));

        let report = sweeper.run_cycle().await.unwrap();
        assert_eq!(report.snapshot_keys, 0);
        assert!(store.type_calls().is_empty());
    }

    #[test]
    fn test_only_backlog_errors_are_fatal() {
        let backlog = SweepError::Backlog {
            phase: SweepPhase::Cleanup,
            source: BacklogError::Io {
                op: "remove",
                path: ".expired_keys.bak".into(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
        };
        assert!(backlog.is_fatal());
        assert!(backlog.to_string().contains("cleanup"));
    }
}

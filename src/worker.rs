//! Worker wiring
//!
//! Startup order: enable expiration notifications, open the backlog, subscribe,
//! start the subscriber task, then sweep on the schedule. Any startup failure is
//! returned before sweeping begins.

use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::backlog::{BacklogError, BacklogStore};
use crate::config::WorkerConfig;
use crate::notify::ensure_expiry_notifications;
use crate::scheduler::Scheduler;
use crate::store::{KeyspaceStore, RedisStore, StoreError};
use crate::subscriber::{EventSubscriber, SubscriberExit};
use crate::sweeper::{SweepError, SweepReport, Sweeper};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to enable expiration notifications: {0}")]
    Notifications(#[source] StoreError),
    #[error("failed to subscribe to expiration events: {0}")]
    Subscribe(#[source] StoreError),
    #[error(transparent)]
    Backlog(#[from] BacklogError),
    #[error(transparent)]
    Sweep(#[from] SweepError),
    #[error("subscriber task failed: {0}")]
    Subscriber(#[from] JoinError),
}

/// Run against the store named in `config` until Ctrl-C or a fatal error.
pub async fn run(config: &WorkerConfig) -> Result<(), WorkerError> {
    let store = Arc::new(RedisStore::new(config.store.clone()));
    run_with_store(config, store).await
}

pub async fn run_with_store<S: KeyspaceStore + ?Sized>(
    config: &WorkerConfig,
    store: Arc<S>,
) -> Result<(), WorkerError> {
    info!(
        "Starting expiry sweeper for {} db {} (data dir {})",
        config.store.addr,
        config.store.db,
        config.data_dir.display()
    );

    ensure_expiry_notifications(store.as_ref(), config.notify_repair)
        .await
        .map_err(WorkerError::Notifications)?;

    let backlog = Arc::new(BacklogStore::open(&config.data_dir, config.fsync)?);
    if backlog.has_pending_snapshot() {
        warn!(
            "Found a snapshot from an interrupted sweep in {}; it will be merged into the next one",
            config.data_dir.display()
        );
    }

    let subscription = store
        .subscribe_expired(config.store.db)
        .await
        .map_err(WorkerError::Subscribe)?;
    let mut subscriber = EventSubscriber::new(backlog.clone()).spawn(subscription);

    let sweeper = Sweeper::new(backlog, store, config.sweep);

    if config.run_once {
        let result = sweeper.run_cycle().await;
        subscriber.abort();
        return result.map(|_: SweepReport| ()).map_err(WorkerError::from);
    }

    let scheduler = Scheduler::daily_at_local_midnight();
    let sweeping = scheduler.run(|| sweeper.run_cycle());
    tokio::pin!(sweeping);
    let mut subscriber_done = false;

    loop {
        tokio::select! {
            result = &mut sweeping => {
                subscriber.abort();
                return match result {
                    Ok(never) => match never {},
                    Err(e) => Err(e.into()),
                };
            }
            joined = &mut subscriber, if !subscriber_done => {
                subscriber_done = true;
                subscriber_stopped(joined)?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                subscriber.abort();
                return Ok(());
            }
        }
    }
}

/// Backlog errors and panics are fatal; a closed subscription is not.
fn subscriber_stopped(
    joined: Result<Result<SubscriberExit, BacklogError>, JoinError>,
) -> Result<(), WorkerError> {
    match joined?? {
        SubscriberExit::Closed { received } => {
            warn!(
                "Expiration subscription ended after {} events; new expirations are no longer recorded",
                received
            );
        }
        SubscriberExit::Failed { received, error: e } => {
            error!(
                "Expiration subscription failed after {} events: {}; new expirations are no longer recorded",
                received, e
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::{FsyncPolicy, BACKLOG_FILE};
    use crate::config::{Args, FileConfig};
    use crate::notify::NOTIFY_PARAMETER;
    use crate::store::InMemoryStore;
    use crate::subscriber::SubscriberHandle;
    use tempfile::tempdir;

    fn run_once_config(data_dir: &std::path::Path) -> WorkerConfig {
        let args = Args {
            data_dir: Some(data_dir.to_path_buf()),
            interval: Some(0),
            run_once: true,
            ..Args::default()
        };
        WorkerConfig::from_sources(args, FileConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_run_once_sweeps_existing_backlog() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(BACKLOG_FILE), b"k1\nk2\nk1\n").unwrap();
        let store = Arc::new(InMemoryStore::with_config(NOTIFY_PARAMETER, ""));

        run_with_store(&run_once_config(dir.path()), store.clone())
            .await
            .unwrap();

        assert_eq!(store.config_value(NOTIFY_PARAMETER).as_deref(), Some("Ex"));
        assert_eq!(store.inspected_keys(), vec!["k1", "k2"]);
        let backlog = BacklogStore::open(dir.path(), FsyncPolicy::Never).unwrap();
        assert!(!backlog.has_pending_snapshot());
    }

    #[tokio::test]
    async fn test_subscribe_failure_stops_startup() {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        store.fail_subscribe(true);

        let err = run_with_store(&run_once_config(dir.path()), store.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Subscribe(_)));
        assert!(store.type_calls().is_empty());
    }

    #[tokio::test]
    async fn test_notification_failure_stops_startup() {
        let dir = tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        store.fail_config_get(true);

        let err = run_with_store(&run_once_config(dir.path()), store)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Notifications(_)));
    }

    #[tokio::test]
    async fn test_closed_subscription_is_not_fatal() {
        let handle = tokio::spawn(async { Ok(SubscriberExit::Closed { received: 7 }) });
        assert!(subscriber_stopped(handle.await).is_ok());

        let dir = tempdir().unwrap();
        let failing: SubscriberHandle = tokio::spawn({
            let path = dir.path().to_path_buf();
            async move {
                Err(BacklogError::Io {
                    op: "append to",
                    path,
                    source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                })
            }
        });
        assert!(matches!(
            subscriber_stopped(failing.await),
            Err(WorkerError::Backlog(_))
        ));
    }
}

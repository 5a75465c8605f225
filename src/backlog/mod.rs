//! Durable backlog of expired keys
//!
//! Files in the data directory:
//!
//! | File | Role |
//! |------|------|
//! | `.expired_keys` | append-only backlog, one record per expired key |
//! | `.expired_keys.swap` | backlog renamed aside at snapshot time |
//! | `.expired_keys.bak` | deduplicated snapshot drained by the current sweep |
//!
//! ## Snapshot swap
//!
//! The backlog is never truncated in place. Under the writer lock the append
//! handle is closed and the backlog is renamed to the swap file; the next append
//! creates a fresh backlog. The swap file is then folded into the snapshot
//! (merged with any snapshot left by an interrupted sweep, deduplicated, written
//! via temp file + rename) and removed. Every crash point leaves either the swap
//! file or the snapshot on disk, and both are picked up by the next sweep.

pub mod encoding;

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::store::ExpiredKey;
use encoding::{decode_records, dedup_first_occurrence, encode_record, encode_records};

pub const BACKLOG_FILE: &str = ".expired_keys";
pub const SWAP_FILE: &str = ".expired_keys.swap";
pub const SNAPSHOT_FILE: &str = ".expired_keys.bak";
const SNAPSHOT_TMP_FILE: &str = ".expired_keys.bak.tmp";

/// When appended records are fsync'd
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FsyncPolicy {
    /// fsync after every append. No acknowledged key is lost on power failure.
    Always,
    /// Leave flushing to the OS.
    #[default]
    Never,
}

#[derive(Debug, thiserror::Error)]
pub enum BacklogError {
    #[error("failed to {op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_error<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> BacklogError + 'a {
    move |source| BacklogError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Syncs a directory so renames and removals inside it are durable.
fn fsync_dir(dir: &Path) -> Result<(), BacklogError> {
    let handle = File::open(dir).map_err(io_error("open directory", dir))?;
    handle.sync_all().map_err(io_error("fsync directory", dir))
}

/// Contents of `path`, or `None` if it does not exist.
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, BacklogError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read", path)(e)),
    }
}

#[derive(Debug, Clone)]
pub struct BacklogPaths {
    pub dir: PathBuf,
    pub backlog: PathBuf,
    pub swap: PathBuf,
    pub snapshot: PathBuf,
    snapshot_tmp: PathBuf,
}

impl BacklogPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        BacklogPaths {
            backlog: dir.join(BACKLOG_FILE),
            swap: dir.join(SWAP_FILE),
            snapshot: dir.join(SNAPSHOT_FILE),
            snapshot_tmp: dir.join(SNAPSHOT_TMP_FILE),
            dir,
        }
    }
}

/// Outcome of the SnapshotCreate step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotStats {
    /// Records moved out of the backlog by this swap
    pub swapped_records: usize,
    /// A snapshot or swap file from an interrupted sweep was merged in
    pub recovered: bool,
}

/// Shared by the subscriber (appends) and the sweeper (snapshots).
pub struct BacklogStore {
    paths: BacklogPaths,
    fsync: FsyncPolicy,
    /// Append handle, opened lazily; `None` right after a swap.
    writer: Mutex<Option<File>>,
}

impl BacklogStore {
    /// Open the backlog in `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>, fsync: FsyncPolicy) -> Result<Self, BacklogError> {
        let paths = BacklogPaths::new(dir);
        fs::create_dir_all(&paths.dir).map_err(io_error("create directory", &paths.dir))?;
        Ok(BacklogStore {
            paths,
            fsync,
            writer: Mutex::new(None),
        })
    }

    pub fn paths(&self) -> &BacklogPaths {
        &self.paths
    }

    /// Append one record for `key`.
    pub fn append(&self, key: &ExpiredKey) -> Result<(), BacklogError> {
        if key.is_empty() {
            // An empty record reads back as a blank line and is skipped anyway.
            warn!("Not recording expired key with an empty name");
            return Ok(());
        }

        let mut record = BytesMut::with_capacity(key.as_bytes().len() + 1);
        encode_record(key, &mut record);

        let mut writer = self.writer.lock();
        let mut file = match writer.take() {
            Some(file) => file,
            None => self.create_backlog_file()?,
        };
        let result = self.write_record(&mut file, &record);
        *writer = Some(file);
        result
    }

    /// Open (or create) the backlog for appending.
    ///
    /// With [`FsyncPolicy::Always`] the directory is synced too, so a backlog
    /// created after a swap survives power loss along with its first record.
    fn create_backlog_file(&self) -> Result<File, BacklogError> {
        let path = &self.paths.backlog;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_error("open", path))?;
        if self.fsync == FsyncPolicy::Always {
            fsync_dir(&self.paths.dir)?;
        }
        Ok(file)
    }

    fn write_record(&self, file: &mut File, record: &[u8]) -> Result<(), BacklogError> {
        let path = &self.paths.backlog;
        file.write_all(record).map_err(io_error("append to", path))?;
        if self.fsync == FsyncPolicy::Always {
            file.sync_data().map_err(io_error("fsync", path))?;
        }
        Ok(())
    }

    /// Keys currently in the backlog, in append order.
    pub fn read_back(&self) -> Result<Vec<ExpiredKey>, BacklogError> {
        Ok(read_optional(&self.paths.backlog)?
            .map(|data| decode_records(&data))
            .unwrap_or_default())
    }

    /// Whether an interrupted sweep left a snapshot or swap file behind.
    pub fn has_pending_snapshot(&self) -> bool {
        self.paths.snapshot.exists() || self.paths.swap.exists()
    }

    /// SnapshotCreate: move the backlog into the deduplicated snapshot.
    ///
    /// Afterwards the backlog reads back empty; appends made from here on land in
    /// a new backlog file and belong to the next sweep.
    pub fn create_snapshot(&self) -> Result<SnapshotStats, BacklogError> {
        let mut stats = SnapshotStats {
            recovered: self.has_pending_snapshot(),
            ..SnapshotStats::default()
        };

        // A swap file can only exist here if a previous sweep crashed mid-fold.
        self.fold_swap()?;

        if self.swap_out_backlog()? {
            stats.swapped_records = self.fold_swap()?;
        }

        debug_assert!(
            !self.paths.swap.exists(),
            "Postcondition: swap file must be folded into the snapshot"
        );
        Ok(stats)
    }

    /// SnapshotRead: keys of the current snapshot in first-occurrence order.
    pub fn read_snapshot(&self) -> Result<Vec<ExpiredKey>, BacklogError> {
        Ok(read_optional(&self.paths.snapshot)?
            .map(|data| decode_records(&data))
            .unwrap_or_default())
    }

    /// Cleanup: delete the snapshot. A missing snapshot is not an error.
    pub fn discard_snapshot(&self) -> Result<(), BacklogError> {
        let path = &self.paths.snapshot;
        match fs::remove_file(path) {
            Ok(()) => fsync_dir(&self.paths.dir),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", path)(e)),
        }
    }

    /// Rename the backlog to the swap file. Returns false if there was no backlog.
    fn swap_out_backlog(&self) -> Result<bool, BacklogError> {
        let mut writer = self.writer.lock();
        // Close the handle so the next append creates a fresh backlog.
        writer.take();

        match fs::rename(&self.paths.backlog, &self.paths.swap) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("rename", &self.paths.backlog)(e)),
        }
    }

    /// Merge the swap file into the snapshot and remove it.
    ///
    /// Returns the number of records taken from the swap file.
    fn fold_swap(&self) -> Result<usize, BacklogError> {
        let Some(swapped) = read_optional(&self.paths.swap)? else {
            return Ok(0);
        };
        let swapped = decode_records(&swapped);
        let swapped_records = swapped.len();
        let previous = self.read_snapshot()?;
        let carried_over = previous.len();

        let merged = dedup_first_occurrence(previous.into_iter().chain(swapped));
        self.write_snapshot(&merged)?;

        fs::remove_file(&self.paths.swap).map_err(io_error("remove", &self.paths.swap))?;
        fsync_dir(&self.paths.dir)?;

        info!(
            swapped_records,
            carried_over,
            unique_keys = merged.len(),
            "Folded backlog into snapshot {}",
            self.paths.snapshot.display()
        );
        Ok(swapped_records)
    }

    /// Write the snapshot atomically (temp file, fsync, rename, fsync dir).
    fn write_snapshot(&self, keys: &[ExpiredKey]) -> Result<(), BacklogError> {
        let tmp = &self.paths.snapshot_tmp;
        let mut file = File::create(tmp).map_err(io_error("create", tmp))?;
        file.write_all(&encode_records(keys))
            .map_err(io_error("write", tmp))?;
        file.sync_all().map_err(io_error("fsync", tmp))?;
        drop(file);

        fs::rename(tmp, &self.paths.snapshot).map_err(io_error("rename", tmp))?;
        fsync_dir(&self.paths.dir)
    }
}

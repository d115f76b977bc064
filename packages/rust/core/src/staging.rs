//! Per-run staging areas for downloaded artifacts.
//!
//! Layout:
//! ```text
//! <root>/run-<run_id>/
//! ├── slot-00000.pdf
//! ├── slot-00001.pdf
//! └── ...
//! ```
//!
//! Each run gets its own directory keyed by its [`RunId`], so concurrent runs
//! never touch each other's files and no locking is needed.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, warn};

use aipbinder_shared::{AipBinderError, Result, RunId};

/// Sweeps attempted before giving up on a staging area that keeps refilling.
const RELEASE_PASSES: usize = 3;

/// Location of one target's intermediate artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingSlot {
    /// Position of the target in the run's input.
    pub index: usize,
    /// File the download is written to.
    pub path: PathBuf,
}

/// A run-scoped staging directory.
#[derive(Debug, Clone)]
pub struct StagingArea {
    run_id: RunId,
    path: PathBuf,
}

impl StagingArea {
    /// Directory backing this area.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The run this area belongs to.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Slot for the target at `index`. Same index, same path.
    pub fn slot_for(&self, index: usize) -> StagingSlot {
        StagingSlot {
            index,
            path: self.path.join(format!("slot-{index:05}.pdf")),
        }
    }
}

/// Allocates and releases staging areas under a common root directory.
#[derive(Debug, Clone)]
pub struct Stager {
    root: PathBuf,
}

impl Stager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory that holds every run's area.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (or reuse) the staging area for `run_id`.
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub fn prepare(&self, run_id: &RunId) -> Result<StagingArea> {
        let path = self.root.join(format!("run-{run_id}"));
        std::fs::create_dir_all(&path).map_err(|e| AipBinderError::staging(&path, e))?;

        debug!(path = %path.display(), "staging area ready");

        Ok(StagingArea {
            run_id: run_id.clone(),
            path,
        })
    }

    /// Remove every slot and the area itself.
    ///
    /// Never fails: missing files are ignored and any other deletion error is
    /// logged so the remaining entries are still removed. Returns the number
    /// of entries deleted.
    #[instrument(skip_all, fields(run_id = %area.run_id))]
    pub fn release(&self, area: &StagingArea) -> usize {
        let mut removed = 0;

        for pass in 1..=RELEASE_PASSES {
            match sweep(&area.path) {
                Some(count) => removed += count,
                None => return removed,
            }

            match std::fs::remove_dir(&area.path) {
                Ok(()) => {
                    debug!(path = %area.path.display(), removed, "staging area released");
                    break;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => break,
                // A write dropped mid-flight can still land after the sweep.
                Err(e) if e.kind() == ErrorKind::DirectoryNotEmpty && pass < RELEASE_PASSES => {
                    debug!(pass, "staging area refilled during release, sweeping again");
                }
                Err(e) => {
                    warn!(path = %area.path.display(), error = %e, "could not remove staging area");
                    break;
                }
            }
        }

        removed
    }
}

/// Delete every entry of `dir`; `None` if `dir` does not exist.
fn sweep(dir: &Path) -> Option<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "could not list staging area");
            return Some(0);
        }
    };

    let mut removed = 0;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "could not read staging entry");
                continue;
            }
        };

        let path = entry.path();
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };

        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not remove staged file");
            }
        }
    }
    Some(removed)
}

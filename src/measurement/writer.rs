//! Throttled, atomic writes of the live snapshot.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::Result;
use crate::measurement::snapshot::LiveSnapshot;

/// Writes the snapshot file every `every_ticks` calls to [`tick`](Self::tick).
///
/// Each write goes to a sibling temp file that is then renamed over the
/// target, so readers never see a partially written document.
pub struct LiveStateWriter {
    path: PathBuf,
    every_ticks: u64,
    ticks: u64,
    written: u64,
}

impl LiveStateWriter {
    pub fn new<P: Into<PathBuf>>(path: P, every_ticks: u64) -> Self {
        Self {
            path: path.into(),
            every_ticks: every_ticks.max(1),
            ticks: 0,
            written: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshots written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Advance the tick counter; true when a snapshot is due.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        self.ticks % self.every_ticks == 0
    }

    /// Overwrite the snapshot file.
    pub fn write(&mut self, snapshot: &LiveSnapshot) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(&mut out, snapshot)?;
            out.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        self.written += 1;
        debug!("Live snapshot written to {}", self.path.display());
        Ok(())
    }
}

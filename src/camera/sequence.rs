//! Recorded image sequence, for offline replay.
//!
//! Layout:
//! ```text
//! <root>/data.csv      # timestamp,filename  ('#' comments allowed)
//! <root>/data/<filename>
//! ```

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use csv::ReaderBuilder;
use opencv::core::Mat;
use opencv::imgcodecs;
use opencv::prelude::*;
use tracing::warn;

use crate::camera::source::FrameSource;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

pub struct ImageSequenceSource {
    root: PathBuf,
    entries: Vec<SequenceEntry>,
    cursor: usize,
    frame_period: Duration,
    last_emit: Option<Instant>,
}

impl ImageSequenceSource {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let entries = load_index(&root.join("data.csv"))?;
        Ok(Self {
            root,
            entries,
            cursor: 0,
            frame_period: Duration::ZERO,
            last_emit: None,
        })
    }

    /// Minimum spacing between emitted frames.
    pub fn with_frame_period(mut self, period: Duration) -> Self {
        self.frame_period = period;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn frame_path(&self, entry: &SequenceEntry) -> PathBuf {
        self.root.join("data").join(&entry.filename)
    }
}

fn load_index(csv_path: &Path) -> Result<Vec<SequenceEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(csv_path)?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let Ok(timestamp_ns) = rec[0].trim().parse::<u64>() else {
            warn!("Skipping sequence row with bad timestamp: {:?}", &rec[0]);
            continue;
        };
        entries.push(SequenceEntry {
            timestamp_ns,
            filename: rec[1].trim().to_string(),
        });
    }
    Ok(entries)
}

impl FrameSource for ImageSequenceSource {
    fn init(&mut self) -> std::result::Result<(), String> {
        if self.entries.is_empty() {
            return Err(format!("no frames listed under {}", self.root.display()));
        }
        self.cursor = 0;
        self.last_emit = None;
        Ok(())
    }

    fn grab(&mut self, timeout: Duration) -> Option<Mat> {
        if self.is_exhausted() {
            thread::sleep(timeout);
            return None;
        }
        if let Some(last) = self.last_emit {
            let wait = self.frame_period.saturating_sub(last.elapsed());
            if wait > timeout {
                thread::sleep(timeout);
                return None;
            }
            thread::sleep(wait);
        }

        let entry = self.entries[self.cursor].clone();
        self.cursor += 1;
        self.last_emit = Some(Instant::now());

        let path = self.frame_path(&entry);
        let image = path
            .to_str()
            .map(|p| imgcodecs::imread(p, imgcodecs::IMREAD_GRAYSCALE));
        match image {
            Some(Ok(image)) if !image.empty() => Some(image),
            _ => {
                warn!("Could not read sequence frame {:?}", path);
                None
            }
        }
    }

    fn close(&mut self) {
        self.cursor = self.entries.len();
    }

    fn is_exhausted(&self) -> bool {
        self.cursor >= self.entries.len()
    }
}

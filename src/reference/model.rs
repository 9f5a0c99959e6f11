//! Typed reference model for the front and back sides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use nalgebra::Point2;
use opencv::core::Mat;
use opencv::imgcodecs;
use opencv::prelude::*;
use tracing::{info, warn};

use crate::error::{Result, SessionError};
use crate::reference::annotation::{AnnotationRecord, PlacementBox};
use crate::reference::types::{KeypointRole, PairIndex, Side};

/// An annotated landmark in reference-image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub index: usize,
    pub position: Point2<f64>,
    pub role: KeypointRole,
}

/// Everything known about one side of the garment.
///
/// Read-only during tracking except for `target_distances`, which the QC
/// engine fills in when it establishes a new baseline.
pub struct ReferenceSide {
    pub side: Side,
    /// Grayscale reference image.
    pub gray: Mat,
    pub keypoints: Vec<Keypoint>,
    pub target_distances: BTreeMap<PairIndex, f64>,
    pub placement_box: Option<PlacementBox>,
    pub pair_names: Vec<String>,
    /// Where the annotation came from; baselines are written back here.
    pub annotation_path: Option<PathBuf>,
    record: AnnotationRecord,
}

impl ReferenceSide {
    /// Load annotation + reference image for one side.
    pub fn load(
        side: Side,
        annotation_path: &Path,
        image_path: &Path,
        corner_count: usize,
    ) -> Result<Self> {
        let record = AnnotationRecord::load(annotation_path)?;
        let gray = load_reference_gray(image_path)?;
        let mut reference = Self::from_record(side, gray, record, corner_count)?;
        reference.annotation_path = Some(annotation_path.to_path_buf());

        info!(
            "Loaded {} reference: {} keypoints, {} targets, image {}x{}",
            side,
            reference.keypoints.len(),
            reference.target_distances.len(),
            reference.width(),
            reference.height()
        );
        Ok(reference)
    }

    /// Build from an in-memory record and image.
    pub fn from_record(
        side: Side,
        gray: Mat,
        record: AnnotationRecord,
        corner_count: usize,
    ) -> Result<Self> {
        if gray.empty() {
            return Err(SessionError::ReferenceImageUnreadable(PathBuf::new()));
        }

        let keypoints = record
            .keypoints
            .iter()
            .enumerate()
            .map(|(index, p)| Keypoint {
                index,
                position: Point2::new(p[0], p[1]),
                role: KeypointRole::for_index(index, corner_count),
            })
            .collect::<Vec<_>>();

        let pair_count = keypoints.len() / 2;
        let mut target_distances = BTreeMap::new();
        for (pair, cm) in &record.target_distances {
            if pair.get() as usize > pair_count {
                warn!(
                    "{} side: ignoring target for {} (only {} pairs annotated)",
                    side, pair, pair_count
                );
                continue;
            }
            target_distances.insert(*pair, *cm);
        }

        Ok(Self {
            side,
            gray,
            keypoints,
            target_distances,
            placement_box: record.placement_box,
            pair_names: record.keypoint_names.clone(),
            annotation_path: None,
            record,
        })
    }

    pub fn width(&self) -> i32 {
        self.gray.cols()
    }

    pub fn height(&self) -> i32 {
        self.gray.rows()
    }

    pub fn positions(&self) -> Vec<Point2<f64>> {
        self.keypoints.iter().map(|k| k.position).collect()
    }

    pub fn target(&self, pair: PairIndex) -> Option<f64> {
        self.target_distances.get(&pair).copied()
    }

    pub fn set_target(&mut self, pair: PairIndex, cm: f64) {
        self.target_distances.insert(pair, cm);
    }

    /// Display name for a pair.
    pub fn pair_name(&self, pair: PairIndex) -> String {
        self.pair_names
            .get(pair.get().saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_else(|| format!("Measurement {}", pair.get()))
    }

    /// Current state as an annotation record (with up-to-date targets).
    ///
    /// Targets ignored at load time for lack of a matching pair are kept.
    pub fn to_record(&self) -> AnnotationRecord {
        let mut record = self.record.clone();
        record.keypoints = self
            .keypoints
            .iter()
            .map(|k| [k.position.x, k.position.y])
            .collect();
        record
            .target_distances
            .extend(self.target_distances.iter().map(|(pair, cm)| (*pair, *cm)));
        record.placement_box = self.placement_box;
        record
    }

    /// Re-save the annotation with the current targets. No-op without a path.
    pub fn save_annotation(&self) -> Result<()> {
        if let Some(path) = &self.annotation_path {
            self.to_record().save(path)?;
        }
        Ok(())
    }
}

fn load_reference_gray(path: &Path) -> Result<Mat> {
    let path_str = path
        .to_str()
        .ok_or_else(|| SessionError::ReferenceImageUnreadable(path.to_path_buf()))?;
    let gray = imgcodecs::imread(path_str, imgcodecs::IMREAD_GRAYSCALE)?;
    if gray.empty() {
        return Err(SessionError::ReferenceImageUnreadable(path.to_path_buf()));
    }
    Ok(gray)
}

/// Front and (optional) back references.
#[derive(Default)]
pub struct ReferenceModel {
    pub front: Option<ReferenceSide>,
    pub back: Option<ReferenceSide>,
}

impl ReferenceModel {
    pub fn get(&self, side: Side) -> Option<&ReferenceSide> {
        match side {
            Side::Front => self.front.as_ref(),
            Side::Back => self.back.as_ref(),
        }
    }

    pub fn get_mut(&mut self, side: Side) -> Option<&mut ReferenceSide> {
        match side {
            Side::Front => self.front.as_mut(),
            Side::Back => self.back.as_mut(),
        }
    }

    pub fn insert(&mut self, reference: ReferenceSide) {
        match reference.side {
            Side::Front => self.front = Some(reference),
            Side::Back => self.back = Some(reference),
        }
    }

    pub fn has(&self, side: Side) -> bool {
        self.get(side).is_some()
    }
}

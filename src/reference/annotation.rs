//! Annotation record (JSON) as authored by the annotation tool.
//!
//! ```json
//! {
//!   "keypoints": [[x, y], ...],
//!   "target_distances": { "1": 52.3, "2": 61.0 },
//!   "placement_box": [x1, y1, x2, y2],
//!   "annotation_date": "2025-03-01T10:15:00",
//!   "source": "...", "article_style": "...", "size": "..."
//! }
//! ```
//!
//! `placement_box` is written as `[]` when absent.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::reference::types::PairIndex;

/// Axis-aligned guide rectangle `[x1, y1, x2, y2]` in reference pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacementBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub keypoints: Vec<[f64; 2]>,

    #[serde(default)]
    pub target_distances: BTreeMap<PairIndex, f64>,

    #[serde(default, with = "placement_box_format")]
    pub placement_box: Option<PlacementBox>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub article_style: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Optional display names, one per pair.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keypoint_names: Vec<String>,
}

impl AnnotationRecord {
    pub fn new(keypoints: Vec<[f64; 2]>) -> Self {
        Self {
            keypoints,
            target_distances: BTreeMap::new(),
            placement_box: None,
            annotation_date: None,
            source: None,
            article_style: None,
            size: None,
            keypoint_names: Vec::new(),
        }
    }

    /// Read and validate an annotation file.
    ///
    /// Any failure (missing file, bad JSON, no keypoints, invalid targets) is
    /// reported as `AnnotationMissingOrCorrupt`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let corrupt = |reason: String| SessionError::AnnotationMissingOrCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| corrupt(e.to_string()))?;
        let record: AnnotationRecord =
            serde_json::from_reader(file).map_err(|e| corrupt(e.to_string()))?;
        record.validate().map_err(corrupt)?;
        Ok(record)
    }

    /// Write the record, stamping `annotation_date`.
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.annotation_date = Some(chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string());
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Number of complete keypoint pairs.
    pub fn pair_count(&self) -> usize {
        self.keypoints.len() / 2
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.keypoints.is_empty() {
            return Err("no keypoints".to_string());
        }
        if let Some(i) = self
            .keypoints
            .iter()
            .position(|p| !p[0].is_finite() || !p[1].is_finite())
        {
            return Err(format!("keypoint {} is not finite", i));
        }
        for (pair, cm) in &self.target_distances {
            if pair.get() == 0 {
                return Err("target distance keyed by pair 0 (pairs are 1-based)".to_string());
            }
            if !cm.is_finite() || *cm < 0.0 {
                return Err(format!("target distance for {} is invalid: {}", pair, cm));
            }
        }
        Ok(())
    }
}

mod placement_box_format {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::PlacementBox;

    pub fn serialize<S: Serializer>(value: &Option<PlacementBox>, s: S) -> Result<S::Ok, S::Error> {
        let coords: Vec<f64> = match value {
            Some(b) => vec![b.x1, b.y1, b.x2, b.y2],
            None => Vec::new(),
        };
        s.collect_seq(coords)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<PlacementBox>, D::Error> {
        let coords = Option::<Vec<f64>>::deserialize(d)?.unwrap_or_default();
        match coords.as_slice() {
            [] => Ok(None),
            [x1, y1, x2, y2] => Ok(Some(PlacementBox {
                x1: *x1,
                y1: *y1,
                x2: *x2,
                y2: *y2,
            })),
            other => Err(D::Error::custom(format!(
                "placement_box must have 0 or 4 values, got {}",
                other.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AnnotationRecord {
        let mut record = AnnotationRecord::new(vec![
            [100.0, 200.0],
            [300.0, 200.0],
            [120.0, 400.0],
            [320.0, 410.0],
            [50.0, 60.0],
        ]);
        record.target_distances.insert(PairIndex::new(1), 52.5);
        record.target_distances.insert(PairIndex::new(2), 61.25);
        record.placement_box = Some(PlacementBox {
            x1: 10.0,
            y1: 20.0,
            x2: 500.0,
            y2: 600.0,
        });
        record.article_style = Some("NKE-TS-001".to_string());
        record
    }

    #[test]
    fn round_trip_preserves_geometry_and_targets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("front_annotation.json");

        let mut original = sample();
        original.save(&path).unwrap();
        let loaded = AnnotationRecord::load(&path).unwrap();

        assert_eq!(loaded.keypoints, original.keypoints);
        assert_eq!(loaded.target_distances, original.target_distances);
        assert_eq!(loaded.placement_box, original.placement_box);
        assert_eq!(loaded.article_style.as_deref(), Some("NKE-TS-001"));
        assert!(loaded.annotation_date.is_some());
        assert_eq!(loaded.pair_count(), 2);
    }

    #[test]
    fn target_keys_are_json_strings() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["target_distances"]["2"], 61.25);
        assert_eq!(json["placement_box"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn empty_placement_box_reads_as_none_and_writes_as_empty() {
        let json = r#"{"keypoints": [[1, 2], [3, 4]], "target_distances": {"1": 10}, "placement_box": []}"#;
        let record: AnnotationRecord = serde_json::from_str(json).unwrap();
        assert!(record.placement_box.is_none());
        assert_eq!(record.target_distances.get(&PairIndex::new(1)), Some(&10.0));

        let out = serde_json::to_value(&record).unwrap();
        assert_eq!(out["placement_box"], serde_json::json!([]));
    }

    #[test]
    fn malformed_records_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let missing = dir.path().join("missing.json");
        assert!(matches!(
            AnnotationRecord::load(&missing),
            Err(SessionError::AnnotationMissingOrCorrupt { .. })
        ));

        let cases = [
            r#"{"keypoints": []}"#,
            r#"{"keypoints": [[1, 2]], "target_distances": {"zero": 5}}"#,
            r#"{"keypoints": [[1, 2]], "target_distances": {"0": 5}}"#,
            r#"{"keypoints": [[1, 2]], "placement_box": [1, 2, 3]}"#,
            "not json",
        ];
        for (i, body) in cases.iter().enumerate() {
            let path = dir.path().join(format!("bad_{}.json", i));
            std::fs::write(&path, body).unwrap();
            assert!(
                matches!(
                    AnnotationRecord::load(&path),
                    Err(SessionError::AnnotationMissingOrCorrupt { .. })
                ),
                "case {} should be rejected",
                i
            );
        }
    }
}

//! JSON snapshot consumed by external dashboards.

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::measurement::engine::MeasurementRecord;
use crate::reference::{Calibration, Side};

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeasurement {
    pub id: u32,
    pub name: String,
    /// 0.0 when uncalibrated.
    pub actual_cm: f64,
    pub target_cm: Option<f64>,
    pub pixel_distance: f64,
    pub tolerance_plus: f64,
    pub tolerance_minus: f64,
    pub min_valid: Option<f64>,
    pub max_valid: Option<f64>,
    pub qc_passed: bool,
    pub is_fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub timestamp: String,
    pub annotation_name: String,
    pub side: Side,
    pub is_calibrated: bool,
    pub pixels_per_cm: f64,
    pub tolerance_cm: f64,
    pub is_stabilized: bool,
    pub measurements: Vec<SnapshotMeasurement>,
}

impl LiveSnapshot {
    pub fn new(
        annotation_name: &str,
        side: Side,
        calibration: &Calibration,
        tolerance_cm: f64,
        is_stabilized: bool,
        records: &[MeasurementRecord],
    ) -> Self {
        let measurements = records
            .iter()
            .map(|r| SnapshotMeasurement {
                id: r.pair.get(),
                name: r.name.clone(),
                actual_cm: round2(r.measured_cm.unwrap_or(0.0)),
                target_cm: r.target_cm.map(round2),
                pixel_distance: round2(r.pixel_distance),
                tolerance_plus: round2(tolerance_cm),
                tolerance_minus: round2(tolerance_cm),
                min_valid: r.tolerance_bounds.map(|(lo, _)| round2(lo)),
                max_valid: r.tolerance_bounds.map(|(_, hi)| round2(hi)),
                qc_passed: r.passed,
                is_fallback: r.is_fallback,
            })
            .collect();

        Self {
            timestamp: Local::now().to_rfc3339(),
            annotation_name: annotation_name.to_string(),
            side,
            is_calibrated: calibration.is_calibrated,
            pixels_per_cm: round2(calibration.pixels_per_cm),
            tolerance_cm: round2(tolerance_cm),
            is_stabilized,
            measurements,
        }
    }
}

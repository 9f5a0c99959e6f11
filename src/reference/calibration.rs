//! Pixels-per-centimeter calibration.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

/// On-disk calibration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    #[serde(default)]
    pub pixels_per_cm: f64,
    #[serde(default)]
    pub reference_length_cm: f64,
    #[serde(default)]
    pub is_calibrated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_date: Option<String>,
}

/// Process-wide scale factor used to convert pixel distances to centimeters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub pixels_per_cm: f64,
    pub reference_length_cm: f64,
    pub is_calibrated: bool,
}

impl Calibration {
    pub fn new(pixels_per_cm: f64, reference_length_cm: f64) -> Self {
        Self {
            pixels_per_cm,
            reference_length_cm,
            is_calibrated: pixels_per_cm.is_finite() && pixels_per_cm > 0.0,
        }
    }

    /// Pixel-only mode: distances are reported in pixels, QC is disabled.
    pub fn uncalibrated() -> Self {
        Self {
            pixels_per_cm: 0.0,
            reference_length_cm: 0.0,
            is_calibrated: false,
        }
    }

    /// Load a calibration file.
    ///
    /// A missing file yields `CalibrationMissing`. A record flagged calibrated
    /// but with a non-positive scale is treated as uncalibrated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SessionError::CalibrationMissing(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let record: CalibrationRecord = serde_json::from_reader(file)?;
        Ok(Self::from(record))
    }

    /// Write the calibration, stamping `calibration_date`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let record = CalibrationRecord {
            pixels_per_cm: self.pixels_per_cm,
            reference_length_cm: self.reference_length_cm,
            is_calibrated: self.is_calibrated,
            calibration_date: Some(chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
        };
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(BufWriter::new(file), &record)?;
        Ok(())
    }

    /// Convert a pixel distance to centimeters. `None` when uncalibrated.
    pub fn to_cm(&self, pixel_distance: f64) -> Option<f64> {
        if self.is_calibrated {
            Some(pixel_distance / self.pixels_per_cm)
        } else {
            None
        }
    }
}

impl From<CalibrationRecord> for Calibration {
    fn from(record: CalibrationRecord) -> Self {
        let usable = record.is_calibrated
            && record.pixels_per_cm.is_finite()
            && record.pixels_per_cm > 0.0;
        Self {
            pixels_per_cm: record.pixels_per_cm,
            reference_length_cm: record.reference_length_cm,
            is_calibrated: usable,
        }
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Self::uncalibrated()
    }
}

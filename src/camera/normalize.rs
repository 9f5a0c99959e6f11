//! Grayscale normalization of incoming frames.

use opencv::core::Mat;
use opencv::imgproc;
use opencv::prelude::*;

use crate::error::Result;

/// Return a single-channel copy of `frame` (BGR, BGRA or already mono).
pub fn ensure_grayscale(frame: &Mat) -> Result<Mat> {
    let mut gray = Mat::default();
    match frame.channels() {
        1 => return Ok(frame.try_clone()?),
        3 => imgproc::cvt_color_def(frame, &mut gray, imgproc::COLOR_BGR2GRAY)?,
        4 => imgproc::cvt_color_def(frame, &mut gray, imgproc::COLOR_BGRA2GRAY)?,
        n => {
            return Err(opencv::Error::new(
                opencv::core::StsBadArg,
                format!("unsupported channel count {}", n),
            )
            .into())
        }
    }
    Ok(gray)
}

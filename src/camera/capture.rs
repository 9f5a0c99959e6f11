//! Live camera via OpenCV `VideoCapture`.

use std::time::Duration;

use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio::{self, VideoCapture};
use tracing::warn;

use crate::camera::normalize::ensure_grayscale;
use crate::camera::source::FrameSource;

pub struct CameraSource {
    index: i32,
    capture: Option<VideoCapture>,
}

impl CameraSource {
    pub fn new(index: i32) -> Self {
        Self {
            index,
            capture: None,
        }
    }
}

impl FrameSource for CameraSource {
    fn init(&mut self) -> Result<(), String> {
        let capture = VideoCapture::new(self.index, videoio::CAP_ANY).map_err(|e| e.to_string())?;
        if !capture.is_opened().map_err(|e| e.to_string())? {
            return Err(format!("capture device {} did not open", self.index));
        }
        self.capture = Some(capture);
        Ok(())
    }

    // VideoCapture::read blocks on the driver; the timeout is enforced by
    // ThreadedSource when this source runs on the grabber thread.
    fn grab(&mut self, _timeout: Duration) -> Option<Mat> {
        let capture = self.capture.as_mut()?;
        let mut frame = Mat::default();
        match capture.read(&mut frame) {
            Ok(true) if !frame.empty() => match ensure_grayscale(&frame) {
                Ok(gray) => Some(gray),
                Err(e) => {
                    warn!("Frame conversion failed: {}", e);
                    None
                }
            },
            Ok(_) => None,
            Err(e) => {
                warn!("Camera read failed: {}", e);
                None
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.release() {
                warn!("Camera release failed: {}", e);
            }
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.close();
    }
}

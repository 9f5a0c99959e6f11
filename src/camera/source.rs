//! Frame source contract.

use std::thread;
use std::time::Duration;

use opencv::core::Mat;
use tracing::{info, warn};

use crate::error::{Result, SessionError};

/// A supplier of sequential grayscale frames.
pub trait FrameSource: Send {
    /// Open the device. Errors carry a human-readable reason.
    fn init(&mut self) -> std::result::Result<(), String>;

    /// Next frame, waiting at most `timeout`. `None` on timeout or read failure.
    fn grab(&mut self, timeout: Duration) -> Option<Mat>;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);

    /// True once a finite source has delivered its last frame.
    fn is_exhausted(&self) -> bool {
        false
    }

    /// Stop (or resume) pulling frames from the device without releasing it.
    /// Sources that only read on `grab` have nothing to do here.
    fn set_paused(&mut self, _paused: bool) {}
}

/// Initialize `source`, retrying with a fixed backoff.
pub fn init_with_retry(
    source: &mut dyn FrameSource,
    attempts: u32,
    backoff: Duration,
) -> Result<()> {
    let attempts = attempts.max(1);
    let mut last_reason = String::new();
    for attempt in 1..=attempts {
        match source.init() {
            Ok(()) => {
                info!("Frame source ready (attempt {}/{})", attempt, attempts);
                return Ok(());
            }
            Err(reason) => {
                warn!(
                    "Frame source init failed (attempt {}/{}): {}",
                    attempt, attempts, reason
                );
                last_reason = reason;
                if attempt < attempts {
                    thread::sleep(backoff);
                }
            }
        }
    }
    Err(SessionError::CameraUnavailable {
        attempts,
        reason: last_reason,
    })
}

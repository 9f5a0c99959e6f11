//! I/O thread feeding a single-slot frame buffer.
//!
//! The grabber thread owns the underlying source. Each new frame replaces any
//! frame the consumer has not picked up yet, so the loop always sees the most
//! recent image.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use opencv::core::Mat;
use tracing::{info, warn};

use crate::camera::source::FrameSource;

/// How long the grabber waits on the inner source per attempt.
const INNER_GRAB_TIMEOUT: Duration = Duration::from_millis(100);

/// Idle poll interval while paused.
const PAUSE_POLL: Duration = Duration::from_millis(10);

struct GrabberFlags {
    paused: AtomicBool,
    stop: AtomicBool,
    exhausted: AtomicBool,
}

pub struct ThreadedSource {
    inner: Option<Box<dyn FrameSource>>,
    flags: Arc<GrabberFlags>,
    receiver: Option<Receiver<Mat>>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadedSource {
    pub fn new(inner: Box<dyn FrameSource>) -> Self {
        Self {
            inner: Some(inner),
            flags: Arc::new(GrabberFlags {
                paused: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                exhausted: AtomicBool::new(false),
            }),
            receiver: None,
            handle: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::SeqCst)
    }
}

fn grab_loop(
    mut source: Box<dyn FrameSource>,
    flags: Arc<GrabberFlags>,
    sender: Sender<Mat>,
    drain: Receiver<Mat>,
) {
    info!("Frame grabber thread started");
    while !flags.stop.load(Ordering::SeqCst) {
        if flags.paused.load(Ordering::SeqCst) {
            thread::sleep(PAUSE_POLL);
            continue;
        }
        if source.is_exhausted() {
            flags.exhausted.store(true, Ordering::SeqCst);
            break;
        }
        let Some(frame) = source.grab(INNER_GRAB_TIMEOUT) else {
            continue;
        };
        match sender.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                // Replace the stale frame.
                let _ = drain.try_recv();
                let _ = sender.try_send(frame);
            }
            Err(TrySendError::Disconnected(_)) => break,
        }
    }
    source.close();
    info!("Frame grabber thread stopped");
}

impl FrameSource for ThreadedSource {
    fn init(&mut self) -> Result<(), String> {
        let mut source = self
            .inner
            .take()
            .ok_or_else(|| "grabber already started".to_string())?;
        if let Err(reason) = source.init() {
            self.inner = Some(source);
            return Err(reason);
        }

        let (sender, receiver) = bounded::<Mat>(1);
        let drain = receiver.clone();
        let flags = Arc::clone(&self.flags);
        let handle = thread::Builder::new()
            .name("frame-grabber".to_string())
            .spawn(move || grab_loop(source, flags, sender, drain))
            .map_err(|e| e.to_string())?;

        self.receiver = Some(receiver);
        self.handle = Some(handle);
        Ok(())
    }

    fn grab(&mut self, timeout: Duration) -> Option<Mat> {
        let receiver = self.receiver.as_ref()?;
        match receiver.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn close(&mut self) {
        self.flags.stop.store(true, Ordering::SeqCst);
        self.receiver = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Frame grabber thread panicked");
            }
        }
        if let Some(inner) = self.inner.as_mut() {
            inner.close();
        }
    }

    fn is_exhausted(&self) -> bool {
        self.flags.exhausted.load(Ordering::SeqCst)
            && self.receiver.as_ref().map_or(true, |r| r.is_empty())
    }

    fn set_paused(&mut self, paused: bool) {
        self.flags.paused.store(paused, Ordering::SeqCst);
    }
}

impl Drop for ThreadedSource {
    fn drop(&mut self) {
        self.close();
    }
}

//! State shared between the measurement loop and its controllers.
//!
//! The loop owns all mutable per-session data; other threads only flip flags,
//! request a side switch, or read the latest published snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::measurement::LiveSnapshot;
use crate::reference::Side;

pub struct SharedState {
    /// While set, the loop stops grabbing and keeps the last frame and results.
    pub paused: AtomicBool,

    /// Cooperative stop for the measurement loop.
    pub shutdown_requested: AtomicBool,

    /// Pending side switch, consumed by the loop at the next tick.
    pub requested_side: RwLock<Option<Side>>,

    /// Most recent snapshot, refreshed by every transfer.
    pub latest: RwLock<Option<LiveSnapshot>>,
}

impl SharedState {
    /// Fresh state behind an `Arc`, ready to hand to controller threads.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True while a pause is requested.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Request a pause (or resume); the loop forwards it to the frame source.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Ask the loop to exit after its current iteration.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    /// True once a stop has been requested.
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Queue a side switch. A later request replaces an unconsumed one.
    pub fn request_side(&self, side: Side) {
        *self.requested_side.write() = Some(side);
    }

    /// Take the pending side request, if any.
    pub fn take_side_request(&self) -> Option<Side> {
        self.requested_side.write().take()
    }

    /// Replace the latest snapshot.
    pub fn publish(&self, snapshot: LiveSnapshot) {
        *self.latest.write() = Some(snapshot);
    }

    /// Copy of the latest snapshot, if any transfer has run.
    pub fn latest_snapshot(&self) -> Option<LiveSnapshot> {
        self.latest.read().clone()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            requested_side: RwLock::new(None),
            latest: RwLock::new(None),
        }
    }
}

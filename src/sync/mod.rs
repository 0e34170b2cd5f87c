// src/sync/mod.rs

//! Presentation synchronisation.
//!
//! A `Synchronizer` owns the single outstanding presentation request of one
//! CRTC. Two strategies exist: waiting for vblank and mode-setting after it,
//! or submitting a page flip and waiting for its completion event.

pub mod page_flip;
pub mod vblank;

use crate::error::SyncError;

pub use page_flip::{FlipCompletion, FlipEventQueue, PageFlipSync};
pub use vblank::VblankSync;

/// A buffer handed to the display, not yet confirmed on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationRequest {
    pub crtc_id: u32,
    pub fb_id: u32,
    /// Per-CRTC submission counter, starting at 1.
    pub sequence: u64,
}

pub trait Synchronizer {
    /// Queues `fb_id` for presentation.
    ///
    /// Fails with `SyncError::FlipPending` while an earlier request is
    /// outstanding; the earlier request is left untouched.
    fn submit(&mut self, fb_id: u32) -> Result<PresentationRequest, SyncError>;

    /// Blocks until the pending request is on screen.
    ///
    /// After an error, `pending()` tells whether the request is still
    /// outstanding (the wait may be retried) or was dropped.
    fn wait_for_sync(&mut self) -> Result<(), SyncError>;

    fn pending(&self) -> Option<&PresentationRequest>;

    /// Settles the outstanding request before presentation stops, waiting at
    /// most once more for it. Afterwards `pending()` is `None`.
    ///
    /// Returns `true` if the request was confirmed on screen.
    fn drain(&mut self) -> bool;
}

/// Hands out request sequence numbers for one CRTC.
#[derive(Debug)]
pub(crate) struct RequestCounter {
    crtc_id: u32,
    next: u64,
}

impl RequestCounter {
    pub(crate) fn new(crtc_id: u32) -> Self {
        Self { crtc_id, next: 1 }
    }

    pub(crate) fn issue(&mut self, fb_id: u32) -> PresentationRequest {
        let request = PresentationRequest {
            crtc_id: self.crtc_id,
            fb_id,
            sequence: self.next,
        };
        self.next += 1;
        request
    }
}

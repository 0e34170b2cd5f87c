// src/sync/vblank.rs

use crate::error::SyncError;
use crate::kms::binder::commit;
use crate::kms::device::{DeviceHandle, KmsDevice, VblankFlags};
use crate::kms::modes::OutputMode;
use crate::sync::{PresentationRequest, RequestCounter, Synchronizer};
use log::{debug, trace, warn};
use std::io;

/// Waits for the next vblank on the CRTC, then mode-sets the pending buffer.
pub struct VblankSync<'a, D: KmsDevice> {
    device: &'a D,
    output: OutputMode,
    /// `None` when the CRTC index is beyond what the device can address.
    flags: Option<VblankFlags>,
    allow_unsynchronized: bool,
    counter: RequestCounter,
    pending: Option<PresentationRequest>,
}

impl<'a, D: KmsDevice> VblankSync<'a, D> {
    /// With `allow_unsynchronized`, a failed vblank wait presents anyway
    /// instead of returning `SyncError::WaitFailed`.
    pub fn new(
        handle: &'a DeviceHandle<D>,
        output: OutputMode,
        allow_unsynchronized: bool,
    ) -> Self {
        let flags = handle.capabilities().vblank_flags(output.crtc_index);
        if flags.is_none() {
            warn!(
                "card{} cannot address vblanks on CRTC {} (index {})",
                handle.index(),
                output.crtc_id,
                output.crtc_index
            );
        }
        Self {
            device: handle.device(),
            output,
            flags,
            allow_unsynchronized,
            counter: RequestCounter::new(output.crtc_id),
            pending: None,
        }
    }
}

impl<D: KmsDevice> Synchronizer for VblankSync<'_, D> {
    fn submit(&mut self, fb_id: u32) -> Result<PresentationRequest, SyncError> {
        if self.pending.is_some() {
            return Err(SyncError::FlipPending {
                crtc_id: self.output.crtc_id,
            });
        }
        let request = self.counter.issue(fb_id);
        self.pending = Some(request);
        Ok(request)
    }

    fn wait_for_sync(&mut self) -> Result<(), SyncError> {
        let crtc_id = self.output.crtc_id;
        let waited = match self.flags {
            Some(flags) => self.device.wait_vblank(flags, 1).map(|reply| reply.sequence),
            None => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "device lacks high-CRTC vblank support",
            )),
        };
        match waited {
            Ok(sequence) => trace!("CRTC {} vblank {}", crtc_id, sequence),
            Err(source) if self.allow_unsynchronized => {
                warn!(
                    "Vblank wait on CRTC {} failed ({}); presenting unsynchronized",
                    crtc_id, source
                );
            }
            Err(source) => return Err(SyncError::WaitFailed { crtc_id, source }),
        }

        let Some(request) = self.pending.take() else {
            return Ok(());
        };
        commit(self.device, &self.output, request.fb_id).map_err(|source| {
            SyncError::CommitFailed {
                crtc_id,
                fb_id: request.fb_id,
                source,
            }
        })
    }

    fn pending(&self) -> Option<&PresentationRequest> {
        self.pending.as_ref()
    }

    /// Nothing reaches the hardware before its vblank; the request is dropped.
    fn drain(&mut self) -> bool {
        if let Some(request) = self.pending.take() {
            debug!(
                "CRTC {} dropping uncommitted framebuffer {}",
                self.output.crtc_id, request.fb_id
            );
        }
        false
    }
}

// src/kms/binder.rs

//! Binds a double-buffered pair of framebuffers to an output's CRTC and puts
//! the CRTC back the way it was found.

use crate::error::{BindError, RestoreError};
use crate::kms::device::{CrtcConfig, CrtcState, DeviceHandle, KmsDevice};
use crate::kms::framebuffer::{self, Framebuffer};
use crate::kms::modes::OutputMode;
use log::{debug, info, trace, warn};
use std::io;
use std::thread;
use std::time::Duration;

/// What a CRTC was doing before `bind` took it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedConfiguration {
    pub crtc: CrtcState,
    pub connectors: Vec<u32>,
}

/// Front and back framebuffers bound to one output.
///
/// `front` is being scanned out; `back` is free for painting. Both are
/// `None` once `destroy_buffers` has run.
pub struct BufferSet<'d, D: KmsDevice> {
    owner: &'d DeviceHandle<D>,
    output: OutputMode,
    front: Option<Framebuffer<'d, D>>,
    back: Option<Framebuffer<'d, D>>,
    saved: Option<SavedConfiguration>,
}

/// How `bind` lets the output stabilise after its first mode-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Wait for one vblank on the CRTC, sleeping for the duration instead if
    /// the device cannot report one.
    Vblank(Duration),
    /// Sleep only; page-flip runs never issue vblank waits.
    Delay(Duration),
}

/// Mode-sets `fb_id` onto the output's CRTC at offset (0, 0).
pub fn commit<D: KmsDevice>(device: &D, output: &OutputMode, fb_id: u32) -> io::Result<()> {
    let connectors = [output.connector_id];
    device.set_crtc(&CrtcConfig {
        crtc_id: output.crtc_id,
        fb_id,
        x: 0,
        y: 0,
        connectors: &connectors,
        mode: Some(&output.mode),
    })
}

/// Allocates front and back buffers, saves the CRTC's state and shows the
/// (black) front buffer on it.
///
/// On error every buffer allocated here has already been released.
pub fn bind<D: KmsDevice>(
    owner: &DeviceHandle<D>,
    output: OutputMode,
    settle: Settle,
) -> Result<BufferSet<'_, D>, BindError> {
    let device = owner.device();
    let (width, height) = (output.width(), output.height());

    let mut front = framebuffer::allocate(owner, width, height)?;
    let mut back = framebuffer::allocate(owner, width, height)?;

    let crtc = device
        .crtc(output.crtc_id)
        .map_err(|source| BindError::SaveFailed {
            crtc_id: output.crtc_id,
            source,
        })?;
    let saved = SavedConfiguration {
        crtc,
        connectors: if crtc.mode.is_some() {
            vec![output.connector_id]
        } else {
            Vec::new()
        },
    };
    debug!("Saved CRTC {} configuration: {:?}", output.crtc_id, saved);

    front.clear();
    back.clear();

    commit(device, &output, front.fb_id()).map_err(|source| BindError::ModeSetFailed {
        crtc_id: output.crtc_id,
        source,
    })?;
    info!(
        "CRTC {} now scanning out framebuffer {} ({}x{})",
        output.crtc_id,
        front.fb_id(),
        width,
        height
    );
    settle_output(owner, &output, settle);

    Ok(BufferSet {
        owner,
        output,
        front: Some(front),
        back: Some(back),
        saved: Some(saved),
    })
}

fn settle_output<D: KmsDevice>(owner: &DeviceHandle<D>, output: &OutputMode, settle: Settle) {
    let fallback = match settle {
        Settle::Delay(delay) => delay,
        Settle::Vblank(fallback) => {
            let waited = match owner.capabilities().vblank_flags(output.crtc_index) {
                Some(flags) => owner.device().wait_vblank(flags, 1),
                None => Err(io::Error::from(io::ErrorKind::Unsupported)),
            };
            match waited {
                Ok(reply) => {
                    trace!(
                        "CRTC {} settled at vblank sequence {}",
                        output.crtc_id,
                        reply.sequence
                    );
                    return;
                }
                Err(e) => {
                    debug!(
                        "CRTC {} vblank query failed ({}); settling for {:?}",
                        output.crtc_id, e, fallback
                    );
                    fallback
                }
            }
        }
    };
    if !fallback.is_zero() {
        thread::sleep(fallback);
    }
}

impl<'d, D: KmsDevice> BufferSet<'d, D> {
    pub fn output(&self) -> &OutputMode {
        &self.output
    }

    pub fn owner(&self) -> &'d DeviceHandle<D> {
        self.owner
    }

    pub fn saved(&self) -> Option<&SavedConfiguration> {
        self.saved.as_ref()
    }

    pub fn front(&self) -> Option<&Framebuffer<'d, D>> {
        self.front.as_ref()
    }

    pub fn back(&self) -> Option<&Framebuffer<'d, D>> {
        self.back.as_ref()
    }

    pub fn back_mut(&mut self) -> Option<&mut Framebuffer<'d, D>> {
        self.back.as_mut()
    }

    /// Called once the back buffer is on screen.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
    }

    /// Releases back then front. Safe to call more than once.
    pub fn destroy_buffers(&mut self) -> Vec<RestoreError> {
        let mut failures = Vec::new();
        for fb in [self.back.take(), self.front.take()].into_iter().flatten() {
            failures.extend(fb.destroy());
        }
        failures
    }

    /// Re-applies the saved configuration. Returns `Ok(false)` if it was
    /// already consumed.
    pub fn try_restore(&mut self) -> Result<bool, RestoreError> {
        let Some(saved) = self.saved.take() else {
            return Ok(false);
        };
        let crtc = saved.crtc;
        self.owner
            .device()
            .set_crtc(&CrtcConfig {
                crtc_id: crtc.crtc_id,
                fb_id: crtc.fb_id,
                x: crtc.x,
                y: crtc.y,
                connectors: &saved.connectors,
                mode: crtc.mode.as_ref(),
            })
            .map_err(|source| RestoreError::ModeSet {
                crtc_id: crtc.crtc_id,
                source,
            })?;
        info!(
            "Restored CRTC {} to framebuffer {} ({})",
            crtc.crtc_id,
            crtc.fb_id,
            crtc.mode.map_or_else(|| "disabled".to_string(), |m| format!("{m:?}"))
        );
        Ok(true)
    }

    /// Best-effort `try_restore`; failures are logged.
    pub fn restore(&mut self) {
        if let Err(e) = self.try_restore() {
            warn!("{}", e);
        }
    }
}

impl<D: KmsDevice> Drop for BufferSet<'_, D> {
    fn drop(&mut self) {
        if self.saved.is_some() || self.front.is_some() || self.back.is_some() {
            debug!(
                "BufferSet for CRTC {} dropped without teardown; releasing",
                self.output.crtc_id
            );
            self.destroy_buffers();
            self.restore();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::mock::{MockDevice, CONSOLE_FB_ID, FIRST_CRTC_ID};
    use crate::kms::modes;
    use crate::kms::device::VblankFlags;
    use crate::render::canvas::Rgb;

    fn setup(mock: MockDevice) -> (DeviceHandle<MockDevice>, OutputMode) {
        let handle = DeviceHandle::from_device(mock, 0).unwrap();
        let output = modes::enumerate(&handle).unwrap()[0];
        (handle, output)
    }

    #[test_log::test]
    fn bind_then_restore_round_trips_the_crtc() {
        let (handle, output) = setup(MockDevice::single_output(320, 200));
        let before = handle.device().state().crtc_snapshot(output.crtc_id);
        assert_eq!(before.0.unwrap().fb_id, CONSOLE_FB_ID);

        let mut set = bind(&handle, output, Settle::Delay(Duration::ZERO)).unwrap();
        let front_id = set.front().unwrap().fb_id();
        assert_eq!(handle.device().state().crtcs[&output.crtc_id].fb_id, front_id);

        assert!(set.try_restore().unwrap());
        let after = handle.device().state().crtc_snapshot(output.crtc_id);
        assert_eq!(before, after);

        assert!(set.destroy_buffers().is_empty());
        drop(set);
        assert_eq!(handle.device().state().live_dumbs(), 0);
    }

    #[test_log::test]
    fn restore_is_consumed_once() {
        let (handle, output) = setup(MockDevice::single_output(64, 64));
        let mut set = bind(&handle, output, Settle::Delay(Duration::ZERO)).unwrap();
        assert!(set.try_restore().unwrap());
        let mode_sets = handle.device().state().counters.mode_sets;
        assert!(!set.try_restore().unwrap());
        set.restore();
        assert_eq!(handle.device().state().counters.mode_sets, mode_sets);
    }

    #[test_log::test]
    fn bound_buffers_start_black_and_swap_roles() {
        let (handle, output) = setup(MockDevice::single_output(64, 48));
        let mut set = bind(&handle, output, Settle::Delay(Duration::ZERO)).unwrap();
        assert!(set.front().unwrap().pixels().iter().all(|&b| b == 0));
        assert!(set.back().unwrap().pixels().iter().all(|&b| b == 0));

        let front_id = set.front().unwrap().fb_id();
        let back_id = set.back().unwrap().fb_id();
        set.back_mut().unwrap().canvas().fill(Rgb::new(255, 0, 0));
        set.swap();
        assert_eq!(set.front().unwrap().fb_id(), back_id);
        assert_eq!(set.back().unwrap().fb_id(), front_id);
    }

    #[test_log::test]
    fn mode_set_failure_releases_both_buffers() {
        let (handle, output) = setup(MockDevice::single_output(128, 64));
        handle.device().state().failures.mode_set = true;

        let err = bind(&handle, output, Settle::Delay(Duration::ZERO)).err().unwrap();
        assert!(matches!(
            err,
            BindError::ModeSetFailed { crtc_id: FIRST_CRTC_ID, .. }
        ));
        let state = handle.device().state();
        assert_eq!(state.counters.dumbs_created, 2);
        assert_eq!(state.live_dumbs(), 0);
        assert_eq!(state.live_fbs(), 0);
        assert_eq!(state.live_mappings(), 0);
        assert_eq!(state.crtcs[&FIRST_CRTC_ID].fb_id, CONSOLE_FB_ID);
        drop(state);
        assert!(handle.live_resources().is_empty());
    }

    #[test_log::test]
    fn unreadable_crtc_fails_with_save_error() {
        let (handle, output) = setup(MockDevice::single_output(32, 32));
        handle.device().state().failures.get_crtc = true;
        let err = bind(&handle, output, Settle::Delay(Duration::ZERO)).err().unwrap();
        assert!(matches!(err, BindError::SaveFailed { .. }));
        assert_eq!(handle.device().state().live_dumbs(), 0);
    }

    #[test_log::test]
    fn allocation_failure_surfaces_as_bind_error() {
        let (handle, output) = setup(MockDevice::single_output(32, 32));
        handle.device().state().failures.create_dumb_on_call = Some(2);
        let err = bind(&handle, output, Settle::Delay(Duration::ZERO)).err().unwrap();
        assert!(matches!(err, BindError::Allocation(_)));
        assert_eq!(handle.device().state().live_dumbs(), 0);
    }

    #[test_log::test]
    fn settle_falls_back_when_vblank_is_unsupported() {
        let (handle, output) = setup(MockDevice::single_output(32, 32));
        handle.device().state().failures.vblank = true;
        let set = bind(&handle, output, Settle::Vblank(Duration::from_millis(1))).unwrap();
        assert_eq!(
            handle.device().state().vblank_requests,
            vec![VblankFlags::RELATIVE]
        );
        drop(set);
        let state = handle.device().state();
        assert_eq!(state.live_dumbs(), 0);
        assert_eq!(state.crtcs[&FIRST_CRTC_ID].fb_id, CONSOLE_FB_ID);
    }

    #[test_log::test]
    fn delay_settle_never_waits_on_vblank() {
        let (handle, output) = setup(MockDevice::single_output(32, 32));
        let set = bind(&handle, output, Settle::Delay(Duration::from_millis(1))).unwrap();
        assert!(handle.device().state().vblank_requests.is_empty());
        drop(set);
    }

    #[test_log::test]
    fn vblank_settle_waits_once_on_the_bound_crtc() {
        let (handle, output) = setup(MockDevice::single_output(32, 32));
        let set = bind(&handle, output, Settle::Vblank(Duration::ZERO)).unwrap();
        let state = handle.device().state();
        assert_eq!(state.vblank_requests, vec![VblankFlags::RELATIVE]);
        assert_eq!(state.counters.vblank_waits, 1);
        drop(state);
        drop(set);
    }
}

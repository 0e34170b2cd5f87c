// src/teardown.rs

//! Releases every bound output and puts the display back the way it was.

use crate::kms::binder::BufferSet;
use crate::kms::device::{DeviceHandle, KmsDevice};
use log::{error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub sets: usize,
    pub restored: usize,
    pub release_failures: usize,
    pub restore_failures: usize,
    /// Framebuffers still registered on the device afterwards.
    pub leaked: usize,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.release_failures == 0 && self.restore_failures == 0 && self.leaked == 0
    }
}

/// Tears down `sets` last-bound first: back and front buffers are released,
/// then the CRTC's saved configuration is re-applied.
///
/// Never fails; every problem is logged and counted.
pub fn teardown<D: KmsDevice>(
    handle: &DeviceHandle<D>,
    sets: Vec<BufferSet<'_, D>>,
) -> TeardownReport {
    let mut report = TeardownReport {
        sets: sets.len(),
        ..Default::default()
    };

    for mut set in sets.into_iter().rev() {
        let crtc_id = set.output().crtc_id;
        let failures = set.destroy_buffers();
        report.release_failures += failures.len();

        match set.try_restore() {
            Ok(true) => report.restored += 1,
            Ok(false) => {}
            Err(e) => {
                warn!("{}", e);
                report.restore_failures += 1;
            }
        }
        info!("CRTC {} torn down", crtc_id);
    }

    let leaked = handle.live_resources().snapshot();
    for (fb_id, buffer) in &leaked {
        error!(
            "Framebuffer {} (handle {}, {} bytes) leaked past teardown",
            fb_id, buffer.handle, buffer.size
        );
    }
    report.leaked = leaked.len();

    if report.is_clean() {
        info!("Teardown complete: {} output(s) restored", report.restored);
    } else {
        warn!("Teardown finished with problems: {:?}", report);
    }
    report
}

// src/kms/framebuffer.rs

//! Dumb-buffer framebuffers: allocation, registration, mapping and release.

use crate::error::{AllocError, RestoreError};
use crate::kms::device::{DeviceHandle, FramebufferRequest, KmsDevice, LiveBuffer, MappedRegion};
use crate::render::canvas::{Canvas, BYTES_PER_PIXEL};
use log::{debug, trace, warn};

pub const BITS_PER_PIXEL: u32 = 32;
pub const COLOR_DEPTH: u32 = 24;

/// Destroys a dumb buffer on drop unless disarmed.
struct DumbBufferGuard<'d, D: KmsDevice> {
    device: &'d D,
    handle: Option<u32>,
}

impl<D: KmsDevice> DumbBufferGuard<'_, D> {
    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl<D: KmsDevice> Drop for DumbBufferGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle {
            if let Err(e) = self.device.destroy_dumb(handle) {
                warn!("Unwinding: failed to destroy dumb buffer {}: {}", handle, e);
            }
        }
    }
}

/// Removes a framebuffer registration on drop unless disarmed.
struct FramebufferIdGuard<'d, D: KmsDevice> {
    device: &'d D,
    fb_id: Option<u32>,
}

impl<D: KmsDevice> FramebufferIdGuard<'_, D> {
    fn disarm(&mut self) {
        self.fb_id = None;
    }
}

impl<D: KmsDevice> Drop for FramebufferIdGuard<'_, D> {
    fn drop(&mut self) {
        if let Some(fb_id) = self.fb_id {
            if let Err(e) = self.device.remove_framebuffer(fb_id) {
                warn!("Unwinding: failed to remove framebuffer {}: {}", fb_id, e);
            }
        }
    }
}

/// A registered, CPU-mapped scan-out buffer.
///
/// Owned by exactly one `BufferSet`. Released by `destroy`, or on drop if
/// `destroy` was never called.
pub struct Framebuffer<'d, D: KmsDevice> {
    owner: &'d DeviceHandle<D>,
    fb_id: u32,
    handle: u32,
    width: u32,
    height: u32,
    stride: u32,
    size: u64,
    region: MappedRegion,
    released: bool,
}

/// Allocates a `width` x `height` XRGB8888 framebuffer and maps it zero-filled.
pub fn allocate<D: KmsDevice>(
    owner: &DeviceHandle<D>,
    width: u32,
    height: u32,
) -> Result<Framebuffer<'_, D>, AllocError> {
    let device = owner.device();

    let dumb = device
        .create_dumb(width, height, BITS_PER_PIXEL)
        .map_err(|source| AllocError::AllocationFailed {
            width,
            height,
            source,
        })?;
    let mut dumb_guard = DumbBufferGuard {
        device,
        handle: Some(dumb.handle),
    };
    trace!(
        "Created dumb buffer {}: pitch {}, size {}",
        dumb.handle,
        dumb.pitch,
        dumb.size
    );

    let min_stride = width as u64 * BYTES_PER_PIXEL as u64;
    if (dumb.pitch as u64) < min_stride || dumb.size < dumb.pitch as u64 * height as u64 {
        return Err(AllocError::InvalidLayout {
            width,
            height,
            stride: dumb.pitch,
            size: dumb.size,
        });
    }
    let len = usize::try_from(dumb.size).map_err(|_| AllocError::InvalidLayout {
        width,
        height,
        stride: dumb.pitch,
        size: dumb.size,
    })?;

    let fb_id = device
        .add_framebuffer(&FramebufferRequest {
            width,
            height,
            pitch: dumb.pitch,
            bpp: BITS_PER_PIXEL,
            depth: COLOR_DEPTH,
            handle: dumb.handle,
        })
        .map_err(|source| AllocError::RegistrationFailed {
            handle: dumb.handle,
            source,
        })?;
    let mut fb_guard = FramebufferIdGuard {
        device,
        fb_id: Some(fb_id),
    };

    let offset = device
        .map_dumb(dumb.handle)
        .map_err(|source| AllocError::MapQueryFailed {
            handle: dumb.handle,
            source,
        })?;

    let mut region = device
        .map_region(offset, len)
        .map_err(|source| AllocError::MapFailed {
            handle: dumb.handle,
            size: dumb.size,
            source,
        })?;
    region.as_mut_slice().fill(0);

    fb_guard.disarm();
    dumb_guard.disarm();
    owner.live_resources().register(
        fb_id,
        LiveBuffer {
            handle: dumb.handle,
            size: dumb.size,
        },
    );
    debug!(
        "Allocated framebuffer {} ({}x{}, stride {}, {} bytes, handle {})",
        fb_id, width, height, dumb.pitch, dumb.size, dumb.handle
    );

    Ok(Framebuffer {
        owner,
        fb_id,
        handle: dumb.handle,
        width,
        height,
        stride: dumb.pitch,
        size: dumb.size,
        region,
        released: false,
    })
}

impl<'d, D: KmsDevice> Framebuffer<'d, D> {
    pub fn fb_id(&self) -> u32 {
        self.fb_id
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn mapped_len(&self) -> usize {
        self.region.len()
    }

    pub fn pixels(&self) -> &[u8] {
        self.region.as_slice()
    }

    /// A bounds-checked pixel view over the mapped memory.
    pub fn canvas(&mut self) -> Canvas<'_> {
        Canvas::new(
            self.region.as_mut_slice(),
            self.width,
            self.height,
            self.stride as usize,
        )
    }

    pub fn clear(&mut self) {
        self.region.as_mut_slice().fill(0);
    }

    /// Unmaps, unregisters and frees the buffer, returning every step that failed.
    pub fn destroy(mut self) -> Vec<RestoreError> {
        self.release()
    }

    fn release(&mut self) -> Vec<RestoreError> {
        if self.released {
            return Vec::new();
        }
        self.released = true;
        let device = self.owner.device();
        let mut failures = Vec::new();

        let region = std::mem::replace(&mut self.region, MappedRegion::empty());
        if let Err(source) = device.unmap_region(region) {
            failures.push(RestoreError::Release {
                fb_id: self.fb_id,
                step: "unmap",
                source,
            });
        }
        if let Err(source) = device.remove_framebuffer(self.fb_id) {
            failures.push(RestoreError::Release {
                fb_id: self.fb_id,
                step: "remove framebuffer",
                source,
            });
        }
        if let Err(source) = device.destroy_dumb(self.handle) {
            failures.push(RestoreError::Release {
                fb_id: self.fb_id,
                step: "destroy dumb buffer",
                source,
            });
        }
        self.owner.live_resources().forget(self.fb_id);
        for failure in &failures {
            warn!("{}", failure);
        }
        debug!("Released framebuffer {}", self.fb_id);
        failures
    }
}

impl<D: KmsDevice> Drop for Framebuffer<'_, D> {
    fn drop(&mut self) {
        if !self.released {
            debug!("Framebuffer {} dropped without destroy(); releasing", self.fb_id);
            self.release();
        }
    }
}

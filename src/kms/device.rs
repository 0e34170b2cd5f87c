// src/kms/device.rs

//! The device handle and the narrow interface every other component uses to
//! talk to display hardware.
//!
//! `KmsDevice` is the seam: `DrmCard` implements it with real ioctls, the
//! tests implement it with an in-memory mock. `DeviceHandle` wraps a device
//! with its capability snapshot and the registry of live framebuffers.

use crate::error::DeviceError;
use crate::kms::card::DrmCard;
use crate::kms::ioctl::{
    DrmModeInfo, DRM_CAP_ASYNC_PAGE_FLIP, DRM_CAP_DUMB_BUFFER, DRM_CAP_VBLANK_HIGH_CRTC,
    DRM_MODE_CONNECTED, DRM_VBLANK_HIGH_CRTC_MASK, DRM_VBLANK_HIGH_CRTC_SHIFT,
};
use bitflags::bitflags;
use log::{debug, error, info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

bitflags! {
    /// `DRM_MODE_PAGE_FLIP_*` request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlipFlags: u32 {
        const EVENT = 0x01;
        const ASYNC = 0x02;
    }
}

bitflags! {
    /// `drm_vblank_seq_type` bits. High-CRTC index bits are carried verbatim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VblankFlags: u32 {
        const RELATIVE = 0x0000_0001;
        const SECONDARY = 0x2000_0000;
        const _ = !0;
    }
}

impl VblankFlags {
    /// A relative wait addressed to the CRTC at `crtc_index` in the resource list.
    pub fn relative_for_crtc(crtc_index: usize) -> Self {
        let mut flags = VblankFlags::RELATIVE;
        if crtc_index == 1 {
            flags |= VblankFlags::SECONDARY;
        } else if crtc_index > 1 {
            let high = ((crtc_index as u32) << DRM_VBLANK_HIGH_CRTC_SHIFT) & DRM_VBLANK_HIGH_CRTC_MASK;
            flags |= VblankFlags::from_bits_retain(high);
        }
        flags
    }

    /// The CRTC index these flags address.
    pub fn crtc_index(self) -> usize {
        let high = self.bits() & DRM_VBLANK_HIGH_CRTC_MASK;
        if high != 0 {
            (high >> DRM_VBLANK_HIGH_CRTC_SHIFT) as usize
        } else if self.contains(VblankFlags::SECONDARY) {
            1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub dumb_buffers: bool,
    pub async_page_flip: bool,
    pub vblank_high_crtc: bool,
}

impl Capabilities {
    /// Relative vblank flags for the CRTC at `crtc_index`, or `None` when
    /// that index can only be addressed with high-CRTC bits the device
    /// does not understand.
    pub fn vblank_flags(&self, crtc_index: usize) -> Option<VblankFlags> {
        if crtc_index > 1 && !self.vblank_high_crtc {
            return None;
        }
        Some(VblankFlags::relative_for_crtc(crtc_index))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardResources {
    pub crtc_ids: Vec<u32>,
    pub connector_ids: Vec<u32>,
    pub encoder_ids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Connected,
    Disconnected,
    Unknown,
}

impl From<u32> for Connection {
    fn from(raw: u32) -> Self {
        match raw {
            DRM_MODE_CONNECTED => Connection::Connected,
            2 => Connection::Disconnected,
            _ => Connection::Unknown,
        }
    }
}

/// A display mode, kept in its kernel representation so it can be handed
/// back to a mode-set unchanged.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    raw: DrmModeInfo,
}

impl ModeInfo {
    pub fn from_raw(raw: DrmModeInfo) -> Self {
        Self { raw }
    }

    pub fn as_raw(&self) -> &DrmModeInfo {
        &self.raw
    }

    pub fn width(&self) -> u32 {
        self.raw.hdisplay as u32
    }

    pub fn height(&self) -> u32 {
        self.raw.vdisplay as u32
    }

    pub fn refresh_hz(&self) -> u32 {
        self.raw.vrefresh
    }

    pub fn name(&self) -> String {
        self.raw
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8 as char)
            .collect()
    }

    #[cfg(test)]
    pub fn synthetic(width: u16, height: u16, refresh_hz: u32) -> Self {
        let mut raw = DrmModeInfo {
            hdisplay: width,
            vdisplay: height,
            vrefresh: refresh_hz,
            ..Default::default()
        };
        for (slot, byte) in raw.name.iter_mut().zip(format!("{width}x{height}").bytes()) {
            *slot = byte as libc::c_char;
        }
        Self { raw }
    }
}

impl fmt::Debug for ModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ModeInfo({:?} {}x{}@{}Hz)",
            self.name(),
            self.width(),
            self.height(),
            self.refresh_hz()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorInfo {
    pub connector_id: u32,
    pub connector_type: u32,
    pub connection: Connection,
    /// Currently attached encoder, zero if none.
    pub encoder_id: u32,
    pub encoder_ids: Vec<u32>,
    pub modes: Vec<ModeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderInfo {
    pub encoder_id: u32,
    /// Currently driving CRTC, zero if none.
    pub crtc_id: u32,
    /// Bit `i` set means the CRTC at resource index `i` can drive this encoder.
    pub possible_crtcs: u32,
}

/// What a CRTC is scanning out right now. `mode == None` means disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcState {
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub mode: Option<ModeInfo>,
}

/// Arguments of a legacy mode-set.
#[derive(Debug, Clone, Copy)]
pub struct CrtcConfig<'a> {
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub connectors: &'a [u32],
    pub mode: Option<&'a ModeInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbAllocation {
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferRequest {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub depth: u32,
    pub handle: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankReply {
    pub sequence: u32,
    pub tv_sec: i64,
    pub tv_usec: i64,
}

/// A read/write byte region mapped into this process.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain memory; exclusive access goes through `&mut self`.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// region is handed back to the device that produced it.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// A zero-length placeholder left behind once a region is unmapped.
    pub fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// Low-level operations on a display device.
///
/// Implementations must be usable from several threads at once: render loops
/// for different CRTCs and the event listener share one device.
pub trait KmsDevice: Send + Sync {
    fn capability(&self, capability: u64) -> io::Result<u64>;
    fn resources(&self) -> io::Result<CardResources>;
    fn connector(&self, connector_id: u32) -> io::Result<ConnectorInfo>;
    fn encoder(&self, encoder_id: u32) -> io::Result<EncoderInfo>;
    fn crtc(&self, crtc_id: u32) -> io::Result<CrtcState>;
    fn set_crtc(&self, config: &CrtcConfig<'_>) -> io::Result<()>;

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation>;
    fn destroy_dumb(&self, handle: u32) -> io::Result<()>;
    fn add_framebuffer(&self, request: &FramebufferRequest) -> io::Result<u32>;
    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()>;
    fn map_dumb(&self, handle: u32) -> io::Result<u64>;
    fn map_region(&self, offset: u64, len: usize) -> io::Result<MappedRegion>;
    fn unmap_region(&self, region: MappedRegion) -> io::Result<()>;

    fn page_flip(&self, crtc_id: u32, fb_id: u32, flags: PageFlipFlags, user_data: u64)
        -> io::Result<()>;
    fn wait_vblank(&self, flags: VblankFlags, sequence: u32) -> io::Result<VblankReply>;

    /// Blocks until events can be read or `timeout` passes; `false` on timeout.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;
    /// Reads whole event records into `buf`, returning the byte count.
    fn read_events(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveBuffer {
    pub handle: u32,
    pub size: u64,
}

/// Every framebuffer currently alive on a device, keyed by framebuffer id.
#[derive(Debug, Default)]
pub struct LiveResources {
    buffers: Mutex<BTreeMap<u32, LiveBuffer>>,
}

impl LiveResources {
    pub fn register(&self, fb_id: u32, buffer: LiveBuffer) {
        let previous = self
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(fb_id, buffer);
        if let Some(previous) = previous {
            warn!(
                "Framebuffer id {} re-registered (previous handle {})",
                fb_id, previous.handle
            );
        }
    }

    pub fn forget(&self, fb_id: u32) -> Option<LiveBuffer> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fb_id)
    }

    pub fn len(&self) -> usize {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<(u32, LiveBuffer)> {
        self.buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(&fb_id, &buffer)| (fb_id, buffer))
            .collect()
    }
}

pub fn card_path(index: u32) -> PathBuf {
    PathBuf::from(format!("/dev/dri/card{index}"))
}

/// An open display device plus everything derived from it for one session.
pub struct DeviceHandle<D: KmsDevice> {
    device: D,
    index: u32,
    capabilities: Capabilities,
    live: LiveResources,
}

impl DeviceHandle<DrmCard> {
    /// Opens `/dev/dri/card{index}` and checks its capabilities.
    pub fn open(index: u32) -> Result<Self, DeviceError> {
        let path = card_path(index);
        let card = DrmCard::open(&path).map_err(|source| DeviceError::Open {
            path: path.clone(),
            source,
        })?;
        info!("Opened display device {}", path.display());
        Self::from_device(card, index)
    }
}

impl<D: KmsDevice> DeviceHandle<D> {
    /// Wraps an already-open device, refusing it unless it supports dumb buffers.
    pub fn from_device(device: D, index: u32) -> Result<Self, DeviceError> {
        let dumb = device
            .capability(DRM_CAP_DUMB_BUFFER)
            .map_err(|source| DeviceError::CapabilityQuery {
                capability: DRM_CAP_DUMB_BUFFER,
                source,
            })?;
        if dumb == 0 {
            return Err(DeviceError::DumbBuffersUnsupported);
        }

        let async_page_flip = match device.capability(DRM_CAP_ASYNC_PAGE_FLIP) {
            Ok(value) => value != 0,
            Err(e) => {
                debug!("ASYNC_PAGE_FLIP capability query failed: {}", e);
                false
            }
        };
        if !async_page_flip {
            warn!("Device card{} does not support asynchronous page flips", index);
        }
        let vblank_high_crtc = device
            .capability(DRM_CAP_VBLANK_HIGH_CRTC)
            .map(|value| value != 0)
            .unwrap_or(false);

        let capabilities = Capabilities {
            dumb_buffers: true,
            async_page_flip,
            vblank_high_crtc,
        };
        debug!("card{} capabilities: {:?}", index, capabilities);
        Ok(Self {
            device,
            index,
            capabilities,
            live: LiveResources::default(),
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn live_resources(&self) -> &LiveResources {
        &self.live
    }
}

impl<D: KmsDevice> Drop for DeviceHandle<D> {
    fn drop(&mut self) {
        let leaked = self.live.snapshot();
        if !leaked.is_empty() {
            error!(
                "card{} closing with {} framebuffer(s) still registered: {:?}",
                self.index,
                leaked.len(),
                leaked
            );
        } else {
            debug!("card{} closed", self.index);
        }
    }
}

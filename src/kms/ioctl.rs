// src/kms/ioctl.rs

//! Raw DRM ioctl requests and the kernel structures they exchange.
//!
//! Layouts mirror `include/uapi/drm/drm.h` and `drm_mode.h`. Everything here
//! is `unsafe` to call; `device.rs` wraps it in a safe API.

use libc::{c_char, c_long, c_uint};
use nix::{ioctl_none, ioctl_readwrite};

const DRM_IOCTL_BASE: u8 = b'd';

pub const DRM_CAP_DUMB_BUFFER: u64 = 0x1;
pub const DRM_CAP_VBLANK_HIGH_CRTC: u64 = 0x2;
pub const DRM_CAP_ASYNC_PAGE_FLIP: u64 = 0x7;

pub const DRM_MODE_CONNECTED: u32 = 1;
pub const DRM_DISPLAY_MODE_LEN: usize = 32;

pub const DRM_VBLANK_HIGH_CRTC_SHIFT: u32 = 1;
pub const DRM_VBLANK_HIGH_CRTC_MASK: u32 = 0x0000_003e;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmGetCap {
    pub capability: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrmModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub kind: u32,
    pub name: [c_char; DRM_DISPLAY_MODE_LEN],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCardRes {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCrtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: DrmModeInfo,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeGetEncoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeGetConnector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeFbCmd {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u32,
    pub depth: u32,
    pub handle: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCrtcPageFlip {
    pub crtc_id: u32,
    pub fb_id: u32,
    pub flags: u32,
    pub reserved: u32,
    pub user_data: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeCreateDumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeMapDumb {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmModeDestroyDumb {
    pub handle: u32,
}

/// `union drm_wait_vblank`. The request's `signal` field overlays `tval_sec`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct DrmWaitVblank {
    pub kind: u32,
    pub sequence: u32,
    pub tval_sec: c_long,
    pub tval_usec: c_long,
}

ioctl_none!(drm_set_master, DRM_IOCTL_BASE, 0x1e);
ioctl_readwrite!(drm_get_cap, DRM_IOCTL_BASE, 0x0c, DrmGetCap);
ioctl_readwrite!(drm_wait_vblank, DRM_IOCTL_BASE, 0x3a, DrmWaitVblank);
ioctl_readwrite!(drm_mode_get_resources, DRM_IOCTL_BASE, 0xa0, DrmModeCardRes);
ioctl_readwrite!(drm_mode_get_crtc, DRM_IOCTL_BASE, 0xa1, DrmModeCrtc);
ioctl_readwrite!(drm_mode_set_crtc, DRM_IOCTL_BASE, 0xa2, DrmModeCrtc);
ioctl_readwrite!(drm_mode_get_encoder, DRM_IOCTL_BASE, 0xa6, DrmModeGetEncoder);
ioctl_readwrite!(drm_mode_get_connector, DRM_IOCTL_BASE, 0xa7, DrmModeGetConnector);
ioctl_readwrite!(drm_mode_add_fb, DRM_IOCTL_BASE, 0xae, DrmModeFbCmd);
ioctl_readwrite!(drm_mode_rm_fb, DRM_IOCTL_BASE, 0xaf, c_uint);
ioctl_readwrite!(drm_mode_page_flip, DRM_IOCTL_BASE, 0xb0, DrmModeCrtcPageFlip);
ioctl_readwrite!(drm_mode_create_dumb, DRM_IOCTL_BASE, 0xb2, DrmModeCreateDumb);
ioctl_readwrite!(drm_mode_map_dumb, DRM_IOCTL_BASE, 0xb3, DrmModeMapDumb);
ioctl_readwrite!(drm_mode_destroy_dumb, DRM_IOCTL_BASE, 0xb4, DrmModeDestroyDumb);

// src/kms/events.rs

//! Decoding of the event records the kernel writes to a DRM file descriptor.
//!
//! Each record starts with a `struct drm_event { u32 type; u32 length; }`
//! header; vblank and flip-complete records share the `drm_event_vblank`
//! body.

use log::trace;

pub const DRM_EVENT_VBLANK: u32 = 0x01;
pub const DRM_EVENT_FLIP_COMPLETE: u32 = 0x02;

const HEADER_LEN: usize = 8;
pub const VBLANK_EVENT_LEN: usize = 32;

/// Recommended read buffer; several whole events fit.
pub const EVENT_BUFFER_LEN: usize = 1024;

/// Body shared by vblank and flip-complete events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VblankEvent {
    pub user_data: u64,
    pub tv_sec: u32,
    pub tv_usec: u32,
    pub sequence: u32,
    /// Zero on kernels that predate `DRM_CAP_CRTC_IN_VBLANK_EVENT`.
    pub crtc_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmEvent {
    Vblank(VblankEvent),
    FlipComplete(VblankEvent),
    Unknown { kind: u32, length: u32 },
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_ne_bytes(raw)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}

/// Decodes every whole event in `buf`. A truncated trailing record is dropped.
pub fn decode_events(buf: &[u8]) -> Vec<DrmEvent> {
    let mut events = Vec::new();
    let mut offset = 0;
    while buf.len() - offset >= HEADER_LEN {
        let kind = read_u32(buf, offset);
        let length = read_u32(buf, offset + 4);
        let record_len = length as usize;
        if record_len < HEADER_LEN || record_len > buf.len() - offset {
            trace!(
                "Dropping malformed DRM event record (type {}, length {}) at offset {}",
                kind,
                length,
                offset
            );
            break;
        }
        let record = &buf[offset..offset + record_len];
        let event = match kind {
            DRM_EVENT_VBLANK | DRM_EVENT_FLIP_COMPLETE if record_len >= VBLANK_EVENT_LEN => {
                let body = VblankEvent {
                    user_data: read_u64(record, 8),
                    tv_sec: read_u32(record, 16),
                    tv_usec: read_u32(record, 20),
                    sequence: read_u32(record, 24),
                    crtc_id: read_u32(record, 28),
                };
                if kind == DRM_EVENT_VBLANK {
                    DrmEvent::Vblank(body)
                } else {
                    DrmEvent::FlipComplete(body)
                }
            }
            _ => DrmEvent::Unknown { kind, length },
        };
        events.push(event);
        offset += record_len;
    }
    events
}

/// Encodes a vblank-shaped record the way the kernel lays it out.
#[cfg(test)]
pub fn encode_vblank_event(kind: u32, body: &VblankEvent) -> [u8; VBLANK_EVENT_LEN] {
    let mut record = [0u8; VBLANK_EVENT_LEN];
    record[0..4].copy_from_slice(&kind.to_ne_bytes());
    record[4..8].copy_from_slice(&(VBLANK_EVENT_LEN as u32).to_ne_bytes());
    record[8..16].copy_from_slice(&body.user_data.to_ne_bytes());
    record[16..20].copy_from_slice(&body.tv_sec.to_ne_bytes());
    record[20..24].copy_from_slice(&body.tv_usec.to_ne_bytes());
    record[24..28].copy_from_slice(&body.sequence.to_ne_bytes());
    record[28..32].copy_from_slice(&body.crtc_id.to_ne_bytes());
    record
}

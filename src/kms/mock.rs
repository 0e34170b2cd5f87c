// src/kms/mock.rs

//! In-memory `KmsDevice` for tests.
//!
//! Models one card with configurable connectors, encoders and CRTCs. Every
//! create/destroy, add/remove and map/unmap call is counted so tests can check
//! that nothing leaks, and each step can be made to fail on demand.

use crate::kms::device::{
    CardResources, Connection, ConnectorInfo, CrtcConfig, CrtcState, DumbAllocation, EncoderInfo,
    FramebufferRequest, KmsDevice, MappedRegion, ModeInfo, PageFlipFlags, VblankFlags,
    VblankReply,
};
use crate::kms::events::{decode_events, encode_vblank_event, DrmEvent, VblankEvent,
    DRM_EVENT_FLIP_COMPLETE, VBLANK_EVENT_LEN};
use crate::kms::ioctl::{DRM_CAP_ASYNC_PAGE_FLIP, DRM_CAP_DUMB_BUFFER, DRM_CAP_VBLANK_HIGH_CRTC};
use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Framebuffer id of the "console" image the mock CRTCs show before binding.
pub const CONSOLE_FB_ID: u32 = 5;
pub const FIRST_CONNECTOR_ID: u32 = 21;
pub const FIRST_ENCODER_ID: u32 = 31;
pub const FIRST_CRTC_ID: u32 = 41;

#[derive(Debug, Clone, Copy)]
pub struct MockCapabilities {
    pub dumb_buffers: bool,
    pub async_page_flip: bool,
    pub vblank_high_crtc: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MockCounters {
    pub dumbs_created: usize,
    pub dumbs_destroyed: usize,
    pub fbs_added: usize,
    pub fbs_removed: usize,
    pub regions_mapped: usize,
    pub regions_unmapped: usize,
    pub mode_sets: usize,
    pub page_flips: usize,
    pub vblank_waits: usize,
}

/// Failure injection. `*_on_call` values are 1-based call numbers.
#[derive(Debug, Default, Clone)]
pub struct MockFailures {
    pub create_dumb_on_call: Option<usize>,
    pub add_fb_on_call: Option<usize>,
    pub map_dumb: bool,
    pub map_region: bool,
    pub get_crtc: bool,
    /// Reject mode-sets that scan out one of our own framebuffers.
    pub mode_set: bool,
    pub vblank: bool,
    pub page_flip: bool,
}

#[derive(Debug)]
pub struct MockState {
    pub capabilities: MockCapabilities,
    pub crtc_ids: Vec<u32>,
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub crtcs: BTreeMap<u32, CrtcState>,
    pub crtc_connectors: BTreeMap<u32, Vec<u32>>,
    pub foreign_fbs: BTreeSet<u32>,
    pub dumbs: BTreeMap<u32, DumbAllocation>,
    pub fbs: BTreeMap<u32, u32>,
    pub map_offsets: BTreeMap<u64, u32>,
    pub counters: MockCounters,
    pub failures: MockFailures,
    pub pending_flips: BTreeMap<u32, u32>,
    pub events: Vec<u8>,
    pub deliver_flip_events: bool,
    pub vblank_requests: Vec<VblankFlags>,
    next_handle: u32,
    next_fb_id: u32,
    vblank_sequence: u32,
    create_calls: usize,
    add_fb_calls: usize,
}

impl MockState {
    pub fn empty() -> Self {
        Self {
            capabilities: MockCapabilities {
                dumb_buffers: true,
                async_page_flip: true,
                vblank_high_crtc: true,
            },
            crtc_ids: Vec::new(),
            connectors: Vec::new(),
            encoders: Vec::new(),
            crtcs: BTreeMap::new(),
            crtc_connectors: BTreeMap::new(),
            foreign_fbs: BTreeSet::from([CONSOLE_FB_ID]),
            dumbs: BTreeMap::new(),
            fbs: BTreeMap::new(),
            map_offsets: BTreeMap::new(),
            counters: MockCounters::default(),
            failures: MockFailures::default(),
            pending_flips: BTreeMap::new(),
            events: Vec::new(),
            deliver_flip_events: true,
            vblank_requests: Vec::new(),
            next_handle: 1,
            next_fb_id: 100,
            vblank_sequence: 0,
            create_calls: 0,
            add_fb_calls: 0,
        }
    }

    /// Adds a CRTC currently showing the console image in `mode`.
    pub fn add_crtc(&mut self, mode: Option<ModeInfo>) -> u32 {
        let crtc_id = FIRST_CRTC_ID + self.crtc_ids.len() as u32;
        self.crtc_ids.push(crtc_id);
        self.crtcs.insert(
            crtc_id,
            CrtcState {
                crtc_id,
                fb_id: if mode.is_some() { CONSOLE_FB_ID } else { 0 },
                x: 0,
                y: 0,
                mode,
            },
        );
        crtc_id
    }

    /// Adds an encoder able to drive the CRTCs in `possible_crtcs`, currently
    /// driving `crtc_id` (zero for none).
    pub fn add_encoder(&mut self, crtc_id: u32, possible_crtcs: u32) -> u32 {
        let encoder_id = FIRST_ENCODER_ID + self.encoders.len() as u32;
        self.encoders.push(EncoderInfo {
            encoder_id,
            crtc_id,
            possible_crtcs,
        });
        encoder_id
    }

    pub fn add_connector(
        &mut self,
        connection: Connection,
        encoder_id: u32,
        encoder_ids: Vec<u32>,
        modes: Vec<ModeInfo>,
    ) -> u32 {
        let connector_id = FIRST_CONNECTOR_ID + self.connectors.len() as u32;
        self.connectors.push(ConnectorInfo {
            connector_id,
            connector_type: 11, // HDMI-A
            connection,
            encoder_id,
            encoder_ids,
            modes,
        });
        connector_id
    }

    pub fn live_dumbs(&self) -> usize {
        self.counters.dumbs_created - self.counters.dumbs_destroyed
    }

    pub fn live_fbs(&self) -> usize {
        self.counters.fbs_added - self.counters.fbs_removed
    }

    pub fn live_mappings(&self) -> usize {
        self.counters.regions_mapped - self.counters.regions_unmapped
    }

    pub fn crtc_snapshot(&self, crtc_id: u32) -> (Option<CrtcState>, Option<Vec<u32>>) {
        (
            self.crtcs.get(&crtc_id).copied(),
            self.crtc_connectors.get(&crtc_id).cloned(),
        )
    }
}

fn errno(e: Errno) -> io::Error {
    io::Error::from(e)
}

#[derive(Debug)]
pub struct MockDevice {
    state: Mutex<MockState>,
    readable: Condvar,
}

impl MockDevice {
    pub fn from_state(state: MockState) -> Self {
        Self {
            state: Mutex::new(state),
            readable: Condvar::new(),
        }
    }

    /// One connected output, already lit by the console, plus a spare CRTC.
    pub fn single_output(width: u16, height: u16) -> Self {
        let mut state = MockState::empty();
        let mode = ModeInfo::synthetic(width, height, 60);
        let crtc = state.add_crtc(Some(mode));
        state.add_crtc(None);
        let encoder = state.add_encoder(crtc, 0b11);
        let connector = state.add_connector(
            Connection::Connected,
            encoder,
            vec![encoder],
            vec![mode, ModeInfo::synthetic(640, 480, 60)],
        );
        state.crtc_connectors.insert(crtc, vec![connector]);
        Self::from_state(state)
    }

    /// Two connected outputs on two CRTCs.
    pub fn dual_output(width: u16, height: u16) -> Self {
        let mut state = MockState::empty();
        let mode = ModeInfo::synthetic(width, height, 60);
        let first = state.add_crtc(Some(mode));
        let second = state.add_crtc(Some(mode));
        let enc_a = state.add_encoder(first, 0b01);
        let enc_b = state.add_encoder(second, 0b10);
        let conn_a = state.add_connector(Connection::Connected, enc_a, vec![enc_a], vec![mode]);
        let conn_b = state.add_connector(Connection::Connected, enc_b, vec![enc_b], vec![mode]);
        state.crtc_connectors.insert(first, vec![conn_a]);
        state.crtc_connectors.insert(second, vec![conn_b]);
        Self::from_state(state)
    }

    /// Connectors exist but nothing is plugged in.
    pub fn disconnected() -> Self {
        let mut state = MockState::empty();
        state.add_crtc(None);
        let encoder = state.add_encoder(0, 0b1);
        state.add_connector(Connection::Disconnected, 0, vec![encoder], Vec::new());
        state.add_connector(Connection::Unknown, 0, vec![encoder], Vec::new());
        Self::from_state(state)
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a raw event record as if the kernel had written it.
    pub fn push_event(&self, record: &[u8]) {
        self.state().events.extend_from_slice(record);
        self.readable.notify_all();
    }
}

impl KmsDevice for MockDevice {
    fn capability(&self, capability: u64) -> io::Result<u64> {
        let caps = self.state().capabilities;
        match capability {
            DRM_CAP_DUMB_BUFFER => Ok(caps.dumb_buffers as u64),
            DRM_CAP_ASYNC_PAGE_FLIP => Ok(caps.async_page_flip as u64),
            DRM_CAP_VBLANK_HIGH_CRTC => Ok(caps.vblank_high_crtc as u64),
            _ => Err(errno(Errno::EINVAL)),
        }
    }

    fn resources(&self) -> io::Result<CardResources> {
        let state = self.state();
        Ok(CardResources {
            crtc_ids: state.crtc_ids.clone(),
            connector_ids: state.connectors.iter().map(|c| c.connector_id).collect(),
            encoder_ids: state.encoders.iter().map(|e| e.encoder_id).collect(),
        })
    }

    fn connector(&self, connector_id: u32) -> io::Result<ConnectorInfo> {
        self.state()
            .connectors
            .iter()
            .find(|c| c.connector_id == connector_id)
            .cloned()
            .ok_or_else(|| errno(Errno::ENOENT))
    }

    fn encoder(&self, encoder_id: u32) -> io::Result<EncoderInfo> {
        self.state()
            .encoders
            .iter()
            .find(|e| e.encoder_id == encoder_id)
            .copied()
            .ok_or_else(|| errno(Errno::ENOENT))
    }

    fn crtc(&self, crtc_id: u32) -> io::Result<CrtcState> {
        let state = self.state();
        if state.failures.get_crtc {
            return Err(errno(Errno::EIO));
        }
        state
            .crtcs
            .get(&crtc_id)
            .copied()
            .ok_or_else(|| errno(Errno::ENOENT))
    }

    fn set_crtc(&self, config: &CrtcConfig<'_>) -> io::Result<()> {
        let mut state = self.state();
        if !state.crtcs.contains_key(&config.crtc_id) {
            return Err(errno(Errno::ENOENT));
        }
        let ours = state.fbs.contains_key(&config.fb_id);
        if config.fb_id != 0 && !ours && !state.foreign_fbs.contains(&config.fb_id) {
            return Err(errno(Errno::ENOENT));
        }
        if ours && state.failures.mode_set {
            return Err(errno(Errno::EINVAL));
        }
        state.counters.mode_sets += 1;
        state.crtcs.insert(
            config.crtc_id,
            CrtcState {
                crtc_id: config.crtc_id,
                fb_id: config.fb_id,
                x: config.x,
                y: config.y,
                mode: config.mode.copied(),
            },
        );
        state
            .crtc_connectors
            .insert(config.crtc_id, config.connectors.to_vec());
        Ok(())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let mut state = self.state();
        state.create_calls += 1;
        if state.failures.create_dumb_on_call == Some(state.create_calls) {
            return Err(errno(Errno::ENOMEM));
        }
        let pitch = (width * bpp.div_ceil(8)).next_multiple_of(64);
        let allocation = DumbAllocation {
            handle: state.next_handle,
            pitch,
            size: pitch as u64 * height as u64,
        };
        state.next_handle += 1;
        state.dumbs.insert(allocation.handle, allocation);
        state.counters.dumbs_created += 1;
        Ok(allocation)
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        let mut state = self.state();
        state
            .dumbs
            .remove(&handle)
            .ok_or_else(|| errno(Errno::ENOENT))?;
        state.map_offsets.retain(|_, h| *h != handle);
        state.counters.dumbs_destroyed += 1;
        Ok(())
    }

    fn add_framebuffer(&self, request: &FramebufferRequest) -> io::Result<u32> {
        let mut state = self.state();
        state.add_fb_calls += 1;
        if state.failures.add_fb_on_call == Some(state.add_fb_calls) {
            return Err(errno(Errno::EINVAL));
        }
        if !state.dumbs.contains_key(&request.handle) {
            return Err(errno(Errno::ENOENT));
        }
        let fb_id = state.next_fb_id;
        state.next_fb_id += 1;
        state.fbs.insert(fb_id, request.handle);
        state.counters.fbs_added += 1;
        Ok(fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()> {
        let mut state = self.state();
        state.fbs.remove(&fb_id).ok_or_else(|| errno(Errno::ENOENT))?;
        // Removing a scanned-out framebuffer turns its CRTC off.
        for crtc in state.crtcs.values_mut() {
            if crtc.fb_id == fb_id {
                crtc.fb_id = 0;
                crtc.mode = None;
            }
        }
        state.counters.fbs_removed += 1;
        Ok(())
    }

    fn map_dumb(&self, handle: u32) -> io::Result<u64> {
        let mut state = self.state();
        if state.failures.map_dumb {
            return Err(errno(Errno::EINVAL));
        }
        if !state.dumbs.contains_key(&handle) {
            return Err(errno(Errno::ENOENT));
        }
        let offset = (handle as u64) << 32;
        state.map_offsets.insert(offset, handle);
        Ok(offset)
    }

    fn map_region(&self, offset: u64, len: usize) -> io::Result<MappedRegion> {
        let mut state = self.state();
        if state.failures.map_region {
            return Err(errno(Errno::ENOMEM));
        }
        if !state.map_offsets.contains_key(&offset) {
            return Err(errno(Errno::EINVAL));
        }
        let length = NonZeroUsize::new(len).ok_or_else(|| errno(Errno::EINVAL))?;
        let ptr = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )?
        };
        // Dirty the pages so zero-filling by the allocator is observable.
        unsafe { std::ptr::write_bytes(ptr.as_ptr().cast::<u8>(), 0xA5, len) };
        state.counters.regions_mapped += 1;
        Ok(unsafe { MappedRegion::from_raw_parts(ptr.cast(), len) })
    }

    fn unmap_region(&self, region: MappedRegion) -> io::Result<()> {
        if region.is_empty() {
            return Ok(());
        }
        unsafe { munmap(region.as_ptr().cast(), region.len())? };
        self.state().counters.regions_unmapped += 1;
        Ok(())
    }

    fn page_flip(
        &self,
        crtc_id: u32,
        fb_id: u32,
        flags: PageFlipFlags,
        user_data: u64,
    ) -> io::Result<()> {
        let mut state = self.state();
        if state.failures.page_flip {
            return Err(errno(Errno::EINVAL));
        }
        if state.pending_flips.contains_key(&crtc_id) {
            return Err(errno(Errno::EBUSY));
        }
        if !state.fbs.contains_key(&fb_id) {
            return Err(errno(Errno::ENOENT));
        }
        let crtc = state.crtcs.get_mut(&crtc_id).ok_or_else(|| errno(Errno::ENOENT))?;
        crtc.fb_id = fb_id;
        state.counters.page_flips += 1;
        state.vblank_sequence += 1;

        if flags.contains(PageFlipFlags::EVENT) {
            state.pending_flips.insert(crtc_id, fb_id);
            if state.deliver_flip_events {
                let record = encode_vblank_event(
                    DRM_EVENT_FLIP_COMPLETE,
                    &VblankEvent {
                        user_data,
                        tv_sec: 0,
                        tv_usec: 0,
                        sequence: state.vblank_sequence,
                        crtc_id,
                    },
                );
                state.events.extend_from_slice(&record);
                drop(state);
                self.readable.notify_all();
            }
        }
        Ok(())
    }

    fn wait_vblank(&self, flags: VblankFlags, sequence: u32) -> io::Result<VblankReply> {
        let mut state = self.state();
        state.vblank_requests.push(flags);
        if state.failures.vblank {
            return Err(errno(Errno::EBUSY));
        }
        state.counters.vblank_waits += 1;
        state.vblank_sequence += sequence.max(1);
        Ok(VblankReply {
            sequence: state.vblank_sequence,
            tv_sec: 0,
            tv_usec: 0,
        })
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let guard = self.state();
        let (guard, _) = self
            .readable
            .wait_timeout_while(guard, timeout, |state| state.events.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        Ok(!guard.events.is_empty())
    }

    fn read_events(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.events.is_empty() {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let whole = (buf.len() / VBLANK_EVENT_LEN) * VBLANK_EVENT_LEN;
        let len = whole.min(state.events.len());
        buf[..len].copy_from_slice(&state.events[..len]);
        state.events.drain(..len);
        for event in decode_events(&buf[..len]) {
            if let DrmEvent::FlipComplete(body) = event {
                state.pending_flips.remove(&body.crtc_id);
            }
        }
        Ok(len)
    }
}

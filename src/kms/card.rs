// src/kms/card.rs

//! `KmsDevice` backed by a real `/dev/dri/cardN` node.

use crate::kms::device::{
    CardResources, ConnectorInfo, CrtcConfig, CrtcState, DumbAllocation, EncoderInfo,
    FramebufferRequest, KmsDevice, MappedRegion, ModeInfo, PageFlipFlags, VblankFlags,
    VblankReply,
};
use crate::kms::ioctl::{self, DrmModeInfo};
use crate::os::epoll::{EpollFlags, EventMonitor};
use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::num::NonZeroUsize;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const DRM_EVENT_TOKEN: u64 = 1;

/// Runs an ioctl, retrying while the kernel reports `EINTR` or `EAGAIN`.
fn retry_ioctl(mut call: impl FnMut() -> nix::Result<libc::c_int>) -> io::Result<()> {
    loop {
        match call() {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(errno) => return Err(io::Error::from(errno)),
        }
    }
}

#[derive(Debug)]
pub struct DrmCard {
    file: File,
    path: PathBuf,
    monitor: Mutex<EventMonitor>,
}

impl DrmCard {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)?;

        let monitor = EventMonitor::new()?;
        monitor.add(file.as_raw_fd(), DRM_EVENT_TOKEN, EpollFlags::EPOLLIN)?;

        let card = Self {
            file,
            path: path.to_path_buf(),
            monitor: Mutex::new(monitor),
        };
        // Mode-setting needs master; the first opener usually gets it implicitly.
        if let Err(e) = unsafe { ioctl::drm_set_master(card.fd()) } {
            warn!(
                "Could not become DRM master on {}: {}. Mode-sets may be rejected.",
                card.path.display(),
                e
            );
        }
        Ok(card)
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl KmsDevice for DrmCard {
    fn capability(&self, capability: u64) -> io::Result<u64> {
        let mut req = ioctl::DrmGetCap {
            capability,
            value: 0,
        };
        retry_ioctl(|| unsafe { ioctl::drm_get_cap(self.fd(), &mut req) })?;
        Ok(req.value)
    }

    fn resources(&self) -> io::Result<CardResources> {
        // Hotplug can change the counts between the sizing call and the
        // filling call; retry until both agree.
        loop {
            let mut res = ioctl::DrmModeCardRes::default();
            retry_ioctl(|| unsafe { ioctl::drm_mode_get_resources(self.fd(), &mut res) })?;

            let mut fb_ids = vec![0u32; res.count_fbs as usize];
            let mut crtc_ids = vec![0u32; res.count_crtcs as usize];
            let mut connector_ids = vec![0u32; res.count_connectors as usize];
            let mut encoder_ids = vec![0u32; res.count_encoders as usize];

            let mut filled = ioctl::DrmModeCardRes {
                fb_id_ptr: fb_ids.as_mut_ptr() as u64,
                crtc_id_ptr: crtc_ids.as_mut_ptr() as u64,
                connector_id_ptr: connector_ids.as_mut_ptr() as u64,
                encoder_id_ptr: encoder_ids.as_mut_ptr() as u64,
                count_fbs: res.count_fbs,
                count_crtcs: res.count_crtcs,
                count_connectors: res.count_connectors,
                count_encoders: res.count_encoders,
                ..Default::default()
            };
            retry_ioctl(|| unsafe { ioctl::drm_mode_get_resources(self.fd(), &mut filled) })?;

            if filled.count_fbs != res.count_fbs
                || filled.count_crtcs != res.count_crtcs
                || filled.count_connectors != res.count_connectors
                || filled.count_encoders != res.count_encoders
            {
                trace!("Resource counts changed during query; retrying");
                continue;
            }
            return Ok(CardResources {
                crtc_ids,
                connector_ids,
                encoder_ids,
            });
        }
    }

    fn connector(&self, connector_id: u32) -> io::Result<ConnectorInfo> {
        loop {
            let mut probe = ioctl::DrmModeGetConnector {
                connector_id,
                ..Default::default()
            };
            retry_ioctl(|| unsafe { ioctl::drm_mode_get_connector(self.fd(), &mut probe) })?;

            let mut modes = vec![DrmModeInfo::default(); probe.count_modes as usize];
            let mut encoders = vec![0u32; probe.count_encoders as usize];
            let mut props = vec![0u32; probe.count_props as usize];
            let mut prop_values = vec![0u64; probe.count_props as usize];

            let mut filled = ioctl::DrmModeGetConnector {
                encoders_ptr: encoders.as_mut_ptr() as u64,
                modes_ptr: modes.as_mut_ptr() as u64,
                props_ptr: props.as_mut_ptr() as u64,
                prop_values_ptr: prop_values.as_mut_ptr() as u64,
                count_modes: probe.count_modes,
                count_props: probe.count_props,
                count_encoders: probe.count_encoders,
                connector_id,
                ..Default::default()
            };
            retry_ioctl(|| unsafe { ioctl::drm_mode_get_connector(self.fd(), &mut filled) })?;

            if filled.count_modes != probe.count_modes
                || filled.count_encoders != probe.count_encoders
                || filled.count_props != probe.count_props
            {
                trace!("Connector {} changed during query; retrying", connector_id);
                continue;
            }
            return Ok(ConnectorInfo {
                connector_id: filled.connector_id,
                connector_type: filled.connector_type,
                connection: filled.connection.into(),
                encoder_id: filled.encoder_id,
                encoder_ids: encoders,
                modes: modes.into_iter().map(ModeInfo::from_raw).collect(),
            });
        }
    }

    fn encoder(&self, encoder_id: u32) -> io::Result<EncoderInfo> {
        let mut req = ioctl::DrmModeGetEncoder {
            encoder_id,
            ..Default::default()
        };
        retry_ioctl(|| unsafe { ioctl::drm_mode_get_encoder(self.fd(), &mut req) })?;
        Ok(EncoderInfo {
            encoder_id: req.encoder_id,
            crtc_id: req.crtc_id,
            possible_crtcs: req.possible_crtcs,
        })
    }

    fn crtc(&self, crtc_id: u32) -> io::Result<CrtcState> {
        let mut req = ioctl::DrmModeCrtc {
            crtc_id,
            ..Default::default()
        };
        retry_ioctl(|| unsafe { ioctl::drm_mode_get_crtc(self.fd(), &mut req) })?;
        Ok(CrtcState {
            crtc_id: req.crtc_id,
            fb_id: req.fb_id,
            x: req.x,
            y: req.y,
            mode: (req.mode_valid != 0).then(|| ModeInfo::from_raw(req.mode)),
        })
    }

    fn set_crtc(&self, config: &CrtcConfig<'_>) -> io::Result<()> {
        let mut req = ioctl::DrmModeCrtc {
            set_connectors_ptr: config.connectors.as_ptr() as u64,
            count_connectors: config.connectors.len() as u32,
            crtc_id: config.crtc_id,
            fb_id: config.fb_id,
            x: config.x,
            y: config.y,
            ..Default::default()
        };
        if let Some(mode) = config.mode {
            req.mode = *mode.as_raw();
            req.mode_valid = 1;
        }
        retry_ioctl(|| unsafe { ioctl::drm_mode_set_crtc(self.fd(), &mut req) })
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let mut req = ioctl::DrmModeCreateDumb {
            width,
            height,
            bpp,
            ..Default::default()
        };
        retry_ioctl(|| unsafe { ioctl::drm_mode_create_dumb(self.fd(), &mut req) })?;
        Ok(DumbAllocation {
            handle: req.handle,
            pitch: req.pitch,
            size: req.size,
        })
    }

    fn destroy_dumb(&self, handle: u32) -> io::Result<()> {
        let mut req = ioctl::DrmModeDestroyDumb { handle };
        retry_ioctl(|| unsafe { ioctl::drm_mode_destroy_dumb(self.fd(), &mut req) })
    }

    fn add_framebuffer(&self, request: &FramebufferRequest) -> io::Result<u32> {
        let mut req = ioctl::DrmModeFbCmd {
            fb_id: 0,
            width: request.width,
            height: request.height,
            pitch: request.pitch,
            bpp: request.bpp,
            depth: request.depth,
            handle: request.handle,
        };
        retry_ioctl(|| unsafe { ioctl::drm_mode_add_fb(self.fd(), &mut req) })?;
        Ok(req.fb_id)
    }

    fn remove_framebuffer(&self, fb_id: u32) -> io::Result<()> {
        let mut id: libc::c_uint = fb_id;
        retry_ioctl(|| unsafe { ioctl::drm_mode_rm_fb(self.fd(), &mut id) })
    }

    fn map_dumb(&self, handle: u32) -> io::Result<u64> {
        let mut req = ioctl::DrmModeMapDumb {
            handle,
            ..Default::default()
        };
        retry_ioctl(|| unsafe { ioctl::drm_mode_map_dumb(self.fd(), &mut req) })?;
        Ok(req.offset)
    }

    fn map_region(&self, offset: u64, len: usize) -> io::Result<MappedRegion> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-length mapping"))?;
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "map offset out of range"))?;
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.file,
                offset,
            )?
        };
        trace!("Mapped {} bytes at offset {:#x} of {}", len, offset, self.path.display());
        Ok(unsafe { MappedRegion::from_raw_parts(ptr.cast(), len) })
    }

    fn unmap_region(&self, region: MappedRegion) -> io::Result<()> {
        if region.is_empty() {
            return Ok(());
        }
        unsafe { munmap(region.as_ptr().cast(), region.len())? };
        Ok(())
    }

    fn page_flip(
        &self,
        crtc_id: u32,
        fb_id: u32,
        flags: PageFlipFlags,
        user_data: u64,
    ) -> io::Result<()> {
        let mut req = ioctl::DrmModeCrtcPageFlip {
            crtc_id,
            fb_id,
            flags: flags.bits(),
            reserved: 0,
            user_data,
        };
        // EBUSY here means a flip is still outstanding; it is not retried.
        loop {
            match unsafe { ioctl::drm_mode_page_flip(self.fd(), &mut req) } {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from(errno)),
            }
        }
    }

    fn wait_vblank(&self, flags: VblankFlags, sequence: u32) -> io::Result<VblankReply> {
        let mut req = ioctl::DrmWaitVblank {
            kind: flags.bits(),
            sequence,
            tval_sec: 0,
            tval_usec: 0,
        };
        // The kernel rewrites a relative request to an absolute one, so a
        // restart after EINTR still targets the same vblank.
        retry_ioctl(|| unsafe { ioctl::drm_wait_vblank(self.fd(), &mut req) })?;
        Ok(VblankReply {
            sequence: req.sequence,
            tv_sec: req.tval_sec as i64,
            tv_usec: req.tval_usec as i64,
        })
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        let ready = monitor.wait(timeout)?;
        if ready
            .iter()
            .any(|flags| flags.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP))
        {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "display device reported an error condition",
            ));
        }
        Ok(ready.iter().any(|flags| flags.contains(EpollFlags::EPOLLIN)))
    }

    fn read_events(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match (&self.file).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

impl Drop for DrmCard {
    fn drop(&mut self) {
        debug!("Closing {}", self.path.display());
    }
}

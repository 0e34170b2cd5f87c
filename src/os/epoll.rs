// src/os/epoll.rs

//! A small `epoll` wrapper over raw `libc` calls, used to block until the DRM
//! device has completion events to read.

use bitflags::bitflags;
use log::{debug, trace, warn};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const EPOLL_CREATE_CLOEXEC: libc::c_int = libc::O_CLOEXEC;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EpollFlags: u32 {
        const EPOLLIN = libc::EPOLLIN as u32;
        const EPOLLPRI = libc::EPOLLPRI as u32;
        const EPOLLERR = libc::EPOLLERR as u32;
        const EPOLLHUP = libc::EPOLLHUP as u32;
    }
}

const MAX_EVENTS_BUFFER_SIZE: usize = 4;

#[derive(Debug)]
pub struct EventMonitor {
    epoll_fd: RawFd,
    event_buffer: [libc::epoll_event; MAX_EVENTS_BUFFER_SIZE],
}

impl EventMonitor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(EPOLL_CREATE_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error());
        }
        debug!("EventMonitor created with epoll_fd: {}", epoll_fd);
        Ok(Self {
            epoll_fd,
            event_buffer: [unsafe { std::mem::zeroed() }; MAX_EVENTS_BUFFER_SIZE],
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, flags: EpollFlags) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: flags.bits(),
            u64: token,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } == -1 {
            return Err(io::Error::last_os_error());
        }
        trace!(
            "Added fd {} to epoll_fd {} with token {} and flags {:?}",
            fd,
            self.epoll_fd,
            token,
            flags
        );
        Ok(())
    }

    /// Blocks for at most `timeout` and returns the flags of every ready fd.
    ///
    /// An interrupted wait reports no events rather than an error.
    pub fn wait(&mut self, timeout: Duration) -> io::Result<Vec<EpollFlags>> {
        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.event_buffer.as_mut_ptr(),
                MAX_EVENTS_BUFFER_SIZE as libc::c_int,
                timeout_ms,
            )
        };

        if num_events == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("epoll_wait interrupted (EINTR), reporting no events.");
                return Ok(Vec::new());
            }
            return Err(err);
        }

        Ok(self.event_buffer[..num_events as usize]
            .iter()
            .map(|event| EpollFlags::from_bits_truncate(event.events))
            .collect())
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        if unsafe { libc::close(self.epoll_fd) } == -1 {
            warn!(
                "Failed to close epoll_fd {}: {}",
                self.epoll_fd,
                io::Error::last_os_error()
            );
        } else {
            debug!("Closed epoll_fd {}", self.epoll_fd);
        }
    }
}

// src/sync/page_flip.rs

//! Page-flip presentation and the listener that delivers flip completions.
//!
//! A completion goes to the oldest waiter on the CRTC the kernel names in the
//! event. Events that name no CRTC fall back to the oldest waiter on the
//! device. The kernel's user data is only used for logging.

use crate::error::SyncError;
use crate::kms::device::{KmsDevice, PageFlipFlags};
use crate::kms::events::{decode_events, DrmEvent, EVENT_BUFFER_LEN};
use crate::sync::{PresentationRequest, RequestCounter, Synchronizer};
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A flip-complete event as handed to the waiting render loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipCompletion {
    pub crtc_id: u32,
    pub sequence: u32,
    pub tv_sec: u32,
    pub tv_usec: u32,
}

struct Waiter {
    ticket: u64,
    crtc_id: u32,
    notify: Sender<FlipCompletion>,
}

/// Render loops waiting for a flip to complete on one device, oldest first.
#[derive(Default)]
pub struct FlipEventQueue {
    waiters: Mutex<VecDeque<Waiter>>,
    next_ticket: AtomicU64,
    stopped: AtomicBool,
}

impl FlipEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn waiters(&self) -> MutexGuard<'_, VecDeque<Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins the back of the queue. `None` once the listener has stopped.
    pub fn register(&self, crtc_id: u32) -> Option<(u64, Receiver<FlipCompletion>)> {
        let mut waiters = self.waiters();
        if self.is_stopped() {
            return None;
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (notify, receiver) = mpsc::channel();
        waiters.push_back(Waiter {
            ticket,
            crtc_id,
            notify,
        });
        Some((ticket, receiver))
    }

    /// Leaves the queue without being served.
    pub fn withdraw(&self, ticket: u64) -> bool {
        let mut waiters = self.waiters();
        let before = waiters.len();
        waiters.retain(|w| w.ticket != ticket);
        waiters.len() != before
    }

    pub fn waiting(&self) -> usize {
        self.waiters().len()
    }

    /// Serves one waiter per flip-complete event. Returns how many waiters
    /// were woken.
    pub fn dispatch(&self, events: &[DrmEvent]) -> usize {
        let mut waiters = self.waiters();
        let mut delivered = 0;
        for event in events {
            let body = match event {
                DrmEvent::FlipComplete(body) => body,
                DrmEvent::Vblank(body) => {
                    trace!("Ignoring vblank event {} on CRTC {}", body.sequence, body.crtc_id);
                    continue;
                }
                DrmEvent::Unknown { kind, length } => {
                    debug!("Ignoring DRM event type {} ({} bytes)", kind, length);
                    continue;
                }
            };
            // Kernels before 4.12 leave crtc_id zero.
            let position = if body.crtc_id == 0 {
                (!waiters.is_empty()).then_some(0)
            } else {
                waiters.iter().position(|w| w.crtc_id == body.crtc_id)
            };
            let Some(waiter) = position.and_then(|index| waiters.remove(index)) else {
                warn!(
                    "Flip completion on CRTC {} (user data {}) with nobody waiting",
                    body.crtc_id, body.user_data
                );
                continue;
            };
            let completion = FlipCompletion {
                crtc_id: waiter.crtc_id,
                sequence: body.sequence,
                tv_sec: body.tv_sec,
                tv_usec: body.tv_usec,
            };
            match waiter.notify.send(completion) {
                Ok(()) => delivered += 1,
                Err(_) => debug!("Waiter {} went away before its flip completed", waiter.ticket),
            }
        }
        delivered
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Listener body: reads and dispatches events until `stop` is called or
    /// the device fails. Never touches display state.
    ///
    /// On exit every remaining waiter is dropped, which wakes it with
    /// `SyncError::ListenerStopped`.
    pub fn run<D: KmsDevice>(&self, device: &D, poll_interval: Duration) {
        info!("Flip event listener started");
        let mut buf = [0u8; EVENT_BUFFER_LEN];
        while !self.is_stopped() {
            match device.wait_readable(poll_interval) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!("Flip event listener: waiting for events failed: {}", e);
                    break;
                }
            }
            match device.read_events(&mut buf) {
                Ok(0) => {}
                Ok(len) => {
                    let events = decode_events(&buf[..len]);
                    trace!("Read {} DRM event(s)", events.len());
                    self.dispatch(&events);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("Flip event listener: reading events failed: {}", e);
                    break;
                }
            }
        }

        // Taken under the lock so no waiter can slip in after the drain.
        let mut waiters = self.waiters();
        self.stop();
        if !waiters.is_empty() {
            warn!(
                "Flip event listener exiting with {} waiter(s) still queued",
                waiters.len()
            );
        }
        waiters.clear();
        info!("Flip event listener stopped");
    }
}

/// Submits page flips that request a completion event and waits for the
/// listener to report them.
pub struct PageFlipSync<'a, D: KmsDevice> {
    device: &'a D,
    queue: &'a FlipEventQueue,
    crtc_id: u32,
    flags: PageFlipFlags,
    timeout: Duration,
    counter: RequestCounter,
    pending: Option<PresentationRequest>,
    waiter: Option<(u64, Receiver<FlipCompletion>)>,
}

impl<'a, D: KmsDevice> PageFlipSync<'a, D> {
    pub fn new(
        device: &'a D,
        queue: &'a FlipEventQueue,
        crtc_id: u32,
        timeout: Duration,
        async_flip: bool,
    ) -> Self {
        let mut flags = PageFlipFlags::EVENT;
        if async_flip {
            flags |= PageFlipFlags::ASYNC;
        }
        Self {
            device,
            queue,
            crtc_id,
            flags,
            timeout,
            counter: RequestCounter::new(crtc_id),
            pending: None,
            waiter: None,
        }
    }

    fn clear(&mut self) {
        self.pending = None;
        if let Some((ticket, _)) = self.waiter.take() {
            self.queue.withdraw(ticket);
        }
    }
}

impl<D: KmsDevice> Synchronizer for PageFlipSync<'_, D> {
    fn submit(&mut self, fb_id: u32) -> Result<PresentationRequest, SyncError> {
        let crtc_id = self.crtc_id;
        if self.pending.is_some() {
            return Err(SyncError::FlipPending { crtc_id });
        }
        let (ticket, receiver) = self
            .queue
            .register(crtc_id)
            .ok_or(SyncError::ListenerStopped { crtc_id })?;

        if let Err(source) = self
            .device
            .page_flip(crtc_id, fb_id, self.flags, crtc_id as u64)
        {
            self.queue.withdraw(ticket);
            return Err(SyncError::SubmitFailed { crtc_id, source });
        }
        let request = self.counter.issue(fb_id);
        trace!("CRTC {} flip #{} to framebuffer {}", crtc_id, request.sequence, fb_id);
        self.pending = Some(request);
        self.waiter = Some((ticket, receiver));
        Ok(request)
    }

    fn wait_for_sync(&mut self) -> Result<(), SyncError> {
        let crtc_id = self.crtc_id;
        let Some((_, receiver)) = &self.waiter else {
            return Ok(());
        };
        match receiver.recv_timeout(self.timeout) {
            Ok(done) => {
                trace!("CRTC {} flip complete at sequence {}", crtc_id, done.sequence);
                self.pending = None;
                self.waiter = None;
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(SyncError::Timeout {
                crtc_id,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                self.clear();
                Err(SyncError::ListenerStopped { crtc_id })
            }
        }
    }

    fn pending(&self) -> Option<&PresentationRequest> {
        self.pending.as_ref()
    }

    fn drain(&mut self) -> bool {
        let confirmed = match &self.waiter {
            Some((_, receiver)) => match receiver.recv_timeout(self.timeout) {
                Ok(done) => {
                    trace!("CRTC {} drained flip at sequence {}", self.crtc_id, done.sequence);
                    true
                }
                Err(e) => {
                    warn!(
                        "CRTC {} flip still unconfirmed after {:?} ({}); giving it up",
                        self.crtc_id, self.timeout, e
                    );
                    false
                }
            },
            None => false,
        };
        self.clear();
        confirmed
    }
}

impl<D: KmsDevice> Drop for PageFlipSync<'_, D> {
    fn drop(&mut self) {
        if self.pending.is_some() {
            debug!("CRTC {} abandoning an unconfirmed flip", self.crtc_id);
        }
        self.clear();
    }
}

// src/render/render_loop.rs

//! The per-output Painting/Presenting state machine and the driver that runs
//! one of them per bound output.

use crate::config::{Config, SyncStrategy};
use crate::error::SyncError;
use crate::kms::binder::BufferSet;
use crate::kms::device::{DeviceHandle, KmsDevice};
use crate::os::signals::CancelToken;
use crate::render::canvas::Painter;
use crate::sync::{FlipEventQueue, PageFlipSync, Synchronizer, VblankSync};
use log::{debug, error, info, trace, warn};
use std::any::Any;
use std::io;
use std::thread::{self, ScopedJoinHandle};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Writing the next frame into the back buffer.
    Painting,
    /// Waiting for the submitted back buffer to reach the screen.
    Presenting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    pub dropped: u64,
    pub sync_failures: u64,
}

impl FrameStats {
    fn frames(&self) -> u64 {
        self.presented + self.dropped
    }
}

/// Runs frames on one `BufferSet` until cancelled, out of frames, or the
/// synchroniser keeps failing.
#[derive(Debug, Clone)]
pub struct RenderLoop {
    cancel: CancelToken,
    max_frames: Option<u64>,
    max_consecutive_failures: u32,
}

impl RenderLoop {
    pub fn new(cancel: CancelToken, max_frames: Option<u64>, max_consecutive_failures: u32) -> Self {
        Self {
            cancel,
            max_frames,
            max_consecutive_failures,
        }
    }

    pub fn from_config(config: &Config, cancel: CancelToken) -> Self {
        Self::new(
            cancel,
            config.render.max_frames,
            config.sync.max_consecutive_failures,
        )
    }

    /// Cancellation is only observed at the start of Painting, so a submitted
    /// frame is always waited for before returning `Ok`. When the loop gives
    /// up mid-presentation the outstanding request is drained first, so no
    /// request is ever left pending on return.
    pub fn run<D: KmsDevice>(
        &self,
        set: &mut BufferSet<'_, D>,
        sync: &mut (dyn Synchronizer + '_),
        painter: &mut (dyn Painter + '_),
    ) -> Result<FrameStats, SyncError> {
        let crtc_id = set.output().crtc_id;
        let started = Instant::now();
        let mut phase = Phase::Painting;
        let mut stats = FrameStats::default();
        let mut consecutive_failures = 0u32;
        info!("CRTC {}: render loop started", crtc_id);

        let outcome = loop {
            match phase {
                Phase::Painting => {
                    if self.cancel.is_cancelled() {
                        info!("CRTC {}: stop requested", crtc_id);
                        break Ok(());
                    }
                    if self.max_frames.is_some_and(|max| stats.frames() >= max) {
                        debug!("CRTC {}: frame limit reached", crtc_id);
                        break Ok(());
                    }
                    let Some(back) = set.back_mut() else {
                        warn!("CRTC {}: buffers already released", crtc_id);
                        break Ok(());
                    };
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    painter.paint(&mut back.canvas(), elapsed_ms);
                    let fb_id = back.fb_id();

                    match sync.submit(fb_id) {
                        Ok(request) => {
                            trace!(
                                "CRTC {}: submitted framebuffer {} (#{})",
                                crtc_id,
                                fb_id,
                                request.sequence
                            );
                            phase = Phase::Presenting;
                        }
                        Err(e) => {
                            stats.dropped += 1;
                            if let Err(e) =
                                self.record_failure(crtc_id, e, &mut consecutive_failures, &mut stats)
                            {
                                break Err(e);
                            }
                        }
                    }
                }
                Phase::Presenting => match sync.wait_for_sync() {
                    Ok(()) => {
                        set.swap();
                        stats.presented += 1;
                        consecutive_failures = 0;
                        phase = Phase::Painting;
                    }
                    Err(e) => {
                        if sync.pending().is_none() {
                            stats.dropped += 1;
                            phase = Phase::Painting;
                        }
                        if let Err(e) =
                            self.record_failure(crtc_id, e, &mut consecutive_failures, &mut stats)
                        {
                            break Err(e);
                        }
                    }
                },
            }
        };

        if sync.pending().is_some() {
            if sync.drain() {
                set.swap();
                stats.presented += 1;
            } else {
                stats.dropped += 1;
            }
        }

        info!(
            "CRTC {}: render loop finished ({} presented, {} dropped, {} sync failures)",
            crtc_id, stats.presented, stats.dropped, stats.sync_failures
        );
        outcome.map(|()| stats)
    }

    fn record_failure(
        &self,
        crtc_id: u32,
        err: SyncError,
        consecutive_failures: &mut u32,
        stats: &mut FrameStats,
    ) -> Result<(), SyncError> {
        stats.sync_failures += 1;
        *consecutive_failures += 1;
        if *consecutive_failures > self.max_consecutive_failures {
            error!(
                "CRTC {}: giving up after {} consecutive sync failures",
                crtc_id, consecutive_failures
            );
            return Err(err);
        }
        warn!(
            "CRTC {}: {} (failure {} of {} allowed)",
            crtc_id, err, consecutive_failures, self.max_consecutive_failures
        );
        Ok(())
    }
}

/// Runs one render loop per set, each on its own thread, and returns one
/// result per set, in the order of `sets`.
///
/// With the page-flip strategy a listener thread delivers completions for
/// the whole device and is stopped once every loop has returned. An empty
/// `sets` does nothing.
pub fn drive_outputs<D: KmsDevice>(
    handle: &DeviceHandle<D>,
    sets: &mut [BufferSet<'_, D>],
    config: &Config,
    cancel: &CancelToken,
) -> Vec<Result<FrameStats, SyncError>> {
    if sets.is_empty() {
        info!("No outputs to drive");
        return Vec::new();
    }
    let device = handle.device();
    let queue = FlipEventQueue::new();
    let strategy = config.sync.strategy;
    let async_flip = config.sync.async_flip && handle.capabilities().async_page_flip;
    if config.sync.async_flip && !async_flip {
        warn!("Asynchronous flips requested but unsupported; using synchronous flips");
    }

    thread::scope(|s| {
        let listener = (strategy == SyncStrategy::PageFlip).then(|| {
            let queue = &queue;
            let poll = config.event_poll_interval();
            thread::Builder::new()
                .name("flip-events".into())
                .spawn_scoped(s, move || queue.run(device, poll))
        });

        let loops: Vec<_> = sets
            .iter_mut()
            .map(|set| {
                let queue = &queue;
                let render = RenderLoop::from_config(config, cancel.clone());
                let output = *set.output();
                let spawned = thread::Builder::new()
                    .name(format!("crtc-{}", output.crtc_id))
                    .spawn_scoped(s, move || {
                        let mut painter = config.render.pattern.painter();
                        let mut sync: Box<dyn Synchronizer + '_> = match strategy {
                            SyncStrategy::Vblank => Box::new(VblankSync::new(
                                handle,
                                output,
                                config.sync.allow_unsynchronized,
                            )),
                            SyncStrategy::PageFlip => Box::new(PageFlipSync::new(
                                device,
                                queue,
                                output.crtc_id,
                                config.flip_timeout(),
                                async_flip,
                            )),
                        };
                        render.run(set, sync.as_mut(), painter.as_mut())
                    });
                (output.crtc_id, spawned)
            })
            .collect();

        let (results, panicked) = join_loops(loops);

        queue.stop();
        match listener {
            Some(Ok(h)) => {
                if h.join().is_err() {
                    error!("Flip event listener panicked");
                }
            }
            Some(Err(e)) => error!("Failed to spawn the flip event listener: {}", e),
            None => {}
        }
        if let Some(payload) = panicked {
            std::panic::resume_unwind(payload);
        }
        results
    })
}

type LoopResult = Result<FrameStats, SyncError>;

/// Joins every render loop thread. A loop that never started yields
/// `SyncError::SpawnFailed` in its slot; the first panic payload is handed
/// back for the caller to resume.
fn join_loops(
    loops: Vec<(u32, io::Result<ScopedJoinHandle<'_, LoopResult>>)>,
) -> (Vec<LoopResult>, Option<Box<dyn Any + Send + 'static>>) {
    let mut results = Vec::with_capacity(loops.len());
    let mut panicked = None;
    for (crtc_id, spawned) in loops {
        match spawned.map(|h| h.join()) {
            Ok(Ok(result)) => results.push(result),
            Ok(Err(payload)) => {
                error!("CRTC {}: render loop panicked", crtc_id);
                panicked.get_or_insert(payload);
            }
            Err(source) => {
                error!("CRTC {}: failed to spawn render loop thread: {}", crtc_id, source);
                results.push(Err(SyncError::SpawnFailed { crtc_id, source }));
            }
        }
    }
    (results, panicked)
}

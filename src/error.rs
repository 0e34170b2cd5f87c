// src/error.rs

//! Error taxonomy for the renderer.
//!
//! Each stage owns one error type. Device errors are fatal, allocation and
//! bind errors abort startup after unwinding, sync errors are per-frame and
//! restore errors are only ever logged.

use std::io;
use std::path::PathBuf;

/// Failures opening or querying the display device.
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("failed to open display device {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("capability query {capability:#x} failed: {source}")]
    CapabilityQuery { capability: u64, source: io::Error },

    #[error("device does not support dumb (memory-mapped) buffers")]
    DumbBuffersUnsupported,

    #[error("failed to query {what}: {source}")]
    Query {
        what: &'static str,
        source: io::Error,
    },

    #[error("connector {connector_id} advertises CRTC {crtc_id}, which already drives another output")]
    CrtcConflict { connector_id: u32, crtc_id: u32 },
}

/// Failures creating a single framebuffer. Prior steps are always unwound.
#[derive(thiserror::Error, Debug)]
pub enum AllocError {
    #[error("dumb buffer allocation ({width}x{height}) failed: {source}")]
    AllocationFailed {
        width: u32,
        height: u32,
        source: io::Error,
    },

    #[error("registering buffer handle {handle} as a framebuffer failed: {source}")]
    RegistrationFailed { handle: u32, source: io::Error },

    #[error("querying the map offset of buffer handle {handle} failed: {source}")]
    MapQueryFailed { handle: u32, source: io::Error },

    #[error("mapping {size} bytes of buffer handle {handle} failed: {source}")]
    MapFailed {
        handle: u32,
        size: u64,
        source: io::Error,
    },

    #[error("kernel returned an unusable layout for {width}x{height}: stride {stride}, size {size}")]
    InvalidLayout {
        width: u32,
        height: u32,
        stride: u32,
        size: u64,
    },
}

/// Failures binding a buffer set to a display pipeline.
#[derive(thiserror::Error, Debug)]
pub enum BindError {
    #[error(transparent)]
    Allocation(#[from] AllocError),

    #[error("failed to capture the configuration of CRTC {crtc_id}: {source}")]
    SaveFailed { crtc_id: u32, source: io::Error },

    #[error("mode-set on CRTC {crtc_id} was rejected: {source}")]
    ModeSetFailed { crtc_id: u32, source: io::Error },
}

/// Per-frame synchronisation failures. The caller decides whether to retry.
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("flip already pending on CRTC {crtc_id}")]
    FlipPending { crtc_id: u32 },

    #[error("page flip submission on CRTC {crtc_id} failed: {source}")]
    SubmitFailed { crtc_id: u32, source: io::Error },

    #[error("vblank wait on CRTC {crtc_id} failed: {source}")]
    WaitFailed { crtc_id: u32, source: io::Error },

    #[error("committing framebuffer {fb_id} on CRTC {crtc_id} failed: {source}")]
    CommitFailed {
        crtc_id: u32,
        fb_id: u32,
        source: io::Error,
    },

    #[error("no flip completion on CRTC {crtc_id} within {timeout_ms} ms")]
    Timeout { crtc_id: u32, timeout_ms: u64 },

    #[error("flip event listener stopped while CRTC {crtc_id} was waiting")]
    ListenerStopped { crtc_id: u32 },

    #[error("render loop for CRTC {crtc_id} could not be started: {source}")]
    SpawnFailed { crtc_id: u32, source: io::Error },
}

/// Teardown-time failures. Logged, never escalated.
#[derive(thiserror::Error, Debug)]
pub enum RestoreError {
    #[error("restoring CRTC {crtc_id} failed: {source}")]
    ModeSet { crtc_id: u32, source: io::Error },

    #[error("releasing framebuffer {fb_id}: {step} failed: {source}")]
    Release {
        fb_id: u32,
        step: &'static str,
        source: io::Error,
    },
}

// src/kms/mod.rs

//! Kernel mode-setting: device access, output discovery, framebuffers and
//! CRTC binding.

pub mod binder;
pub mod card;
pub mod device;
pub mod events;
pub mod framebuffer;
pub mod ioctl;
#[cfg(test)]
pub mod mock;
pub mod modes;

pub use binder::{bind, BufferSet};
pub use card::DrmCard;
pub use device::{DeviceHandle, KmsDevice};
pub use modes::{enumerate, OutputMode};

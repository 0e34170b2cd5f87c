// src/render/mod.rs

//! Painting into back buffers and the per-output render loop.

pub mod canvas;
pub mod render_loop;

pub use canvas::{Canvas, Painter, Rgb, SolidFill, XorPattern};
pub use render_loop::{drive_outputs, FrameStats, RenderLoop};

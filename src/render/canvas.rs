// src/render/canvas.rs

//! Bounds-checked pixel access over a mapped XRGB8888 buffer.
//!
//! Pixels are 4 bytes, little-endian `0xXXRRGGBB`, so bytes in memory are
//! B, G, R, X. Rows are `stride` bytes apart.

pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub const fn gray(value: u8) -> Self {
        Self::new(value, value, value)
    }

    fn to_bytes(self) -> [u8; BYTES_PER_PIXEL] {
        [self.b, self.g, self.r, 0]
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        Self::new(bytes[2], bytes[1], bytes[0])
    }
}

pub struct Canvas<'a> {
    bytes: &'a mut [u8],
    width: u32,
    height: u32,
    stride: usize,
}

impl<'a> Canvas<'a> {
    /// Geometry that does not fit `bytes` is clipped to what does.
    pub fn new(bytes: &'a mut [u8], width: u32, height: u32, stride: usize) -> Self {
        let (width, height) = if stride == 0 {
            (0, 0)
        } else {
            let fits_wide = (stride / BYTES_PER_PIXEL).min(width as usize) as u32;
            let fits_tall = (bytes.len() / stride).min(height as usize) as u32;
            (fits_wide, fits_tall)
        };
        Self {
            bytes,
            width,
            height,
            stride,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height)
            .then(|| y as usize * self.stride + x as usize * BYTES_PER_PIXEL)
    }

    pub fn get(&self, x: u32, y: u32) -> Option<Rgb> {
        let at = self.offset(x, y)?;
        Some(Rgb::from_bytes(&self.bytes[at..at + BYTES_PER_PIXEL]))
    }

    /// Writes one pixel; returns `false` if `(x, y)` is outside the canvas.
    pub fn put(&mut self, x: u32, y: u32, color: Rgb) -> bool {
        match self.offset(x, y) {
            Some(at) => {
                self.bytes[at..at + BYTES_PER_PIXEL].copy_from_slice(&color.to_bytes());
                true
            }
            None => false,
        }
    }

    /// Visible pixel bytes of row `y`, padding excluded.
    pub fn row_mut(&mut self, y: u32) -> Option<&mut [u8]> {
        let start = self.offset(0, y)?;
        let end = start + self.width as usize * BYTES_PER_PIXEL;
        Some(&mut self.bytes[start..end])
    }

    pub fn fill(&mut self, color: Rgb) {
        let pixel = color.to_bytes();
        for y in 0..self.height {
            if let Some(row) = self.row_mut(y) {
                for chunk in row.chunks_exact_mut(BYTES_PER_PIXEL) {
                    chunk.copy_from_slice(&pixel);
                }
            }
        }
    }
}

/// Something that draws one frame into a canvas.
pub trait Painter {
    fn paint(&mut self, canvas: &mut Canvas<'_>, elapsed_ms: u64);
}

/// `((x + elapsed_ms) ^ y) & 0xFF` on all three channels.
pub fn xor_value(x: u32, y: u32, elapsed_ms: u64) -> u8 {
    ((x as u64).wrapping_add(elapsed_ms) ^ y as u64) as u8
}

/// A moving XOR texture; deterministic for a given timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct XorPattern;

impl Painter for XorPattern {
    fn paint(&mut self, canvas: &mut Canvas<'_>, elapsed_ms: u64) {
        for y in 0..canvas.height() {
            if let Some(row) = canvas.row_mut(y) {
                for (x, chunk) in row.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
                    let val = xor_value(x as u32, y, elapsed_ms);
                    chunk.copy_from_slice(&Rgb::gray(val).to_bytes());
                }
            }
        }
    }
}

/// Fills every frame with one colour.
#[derive(Debug, Clone, Copy)]
pub struct SolidFill(pub Rgb);

impl Painter for SolidFill {
    fn paint(&mut self, canvas: &mut Canvas<'_>, _elapsed_ms: u64) {
        canvas.fill(self.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_pattern_reference_pixels() {
        let mut bytes = vec![0u8; 4 * 4 * 2];
        let mut canvas = Canvas::new(&mut bytes, 4, 2, 16);
        XorPattern.paint(&mut canvas, 0);

        assert_eq!(canvas.get(1, 1), Some(Rgb::new(0, 0, 0)));
        assert_eq!(canvas.get(3, 0), Some(Rgb::new(3, 3, 3)));
        // Pixel (3, 0) sits at byte offset 12: B, G, R, X.
        assert_eq!(&bytes[12..16], &[3, 3, 3, 0]);
    }

    #[test]
    fn xor_pattern_is_deterministic_per_timestamp() {
        let paint = |elapsed| {
            let mut bytes = vec![0u8; 64 * 8];
            XorPattern.paint(&mut Canvas::new(&mut bytes, 16, 8, 64), elapsed);
            bytes
        };
        assert_eq!(paint(1234), paint(1234));
        assert_ne!(paint(1234), paint(1235));
        assert_eq!(xor_value(10, 3, 250), ((10 + 250) ^ 3) as u8);
        assert_eq!(xor_value(0, 0, u64::MAX), 0xFF);
    }

    #[test]
    fn stride_padding_is_never_written() {
        // 3 pixels wide with a 16-byte stride: 4 bytes of padding per row.
        let mut bytes = vec![0xEEu8; 16 * 2];
        let mut canvas = Canvas::new(&mut bytes, 3, 2, 16);
        canvas.fill(Rgb::new(1, 2, 3));
        assert_eq!(&bytes[0..4], &[3, 2, 1, 0]);
        assert_eq!(&bytes[12..16], &[0xEE; 4]);
        assert_eq!(&bytes[16..20], &[3, 2, 1, 0]);
        assert_eq!(&bytes[28..32], &[0xEE; 4]);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let mut bytes = vec![0u8; 32];
        let mut canvas = Canvas::new(&mut bytes, 4, 2, 16);
        assert!(!canvas.put(4, 0, Rgb::BLACK));
        assert!(!canvas.put(0, 2, Rgb::BLACK));
        assert_eq!(canvas.get(4, 1), None);
        assert!(canvas.put(3, 1, Rgb::new(7, 8, 9)));
        assert_eq!(canvas.get(3, 1), Some(Rgb::new(7, 8, 9)));
    }

    #[test]
    fn oversized_geometry_is_clipped_to_the_buffer() {
        let mut bytes = vec![0u8; 16 * 3];
        let canvas = Canvas::new(&mut bytes, 100, 100, 16);
        assert_eq!((canvas.width(), canvas.height()), (4, 3));
    }
}

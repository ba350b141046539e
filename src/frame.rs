//! The `Frame` entity: a single captured image handed to the guider once.

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

/// A 16-bit monochrome image produced by the camera interface, consumed
/// once by the guider.
///
/// Pixel storage is `Arc<[u16]>` rather than an owned `Vec` so a frame can
/// be hand off to logging/display without a copy, matching the "owned
/// buffers + lifetimes" re-architecture called for by the original
/// design notes (no raw-pointer sharing).
#[derive(Debug, Clone)]
pub struct Frame {
    pub pixels: Arc<[u16]>,
    pub width: usize,
    pub height: usize,
    pub timestamp: std::time::SystemTime,
    pub exposure_s: f64,
    pub bit_depth: u8,
    pub binning: u32,
    pub subframe: Option<Rect>,
}

impl Frame {
    pub fn new(pixels: Vec<u16>, width: usize, height: usize, exposure_s: f64) -> Self {
        assert_eq!(pixels.len(), width * height);
        Self {
            pixels: Arc::from(pixels),
            width,
            height,
            timestamp: std::time::SystemTime::now(),
            exposure_s,
            bit_depth: 16,
            binning: 1,
            subframe: None,
        }
    }

    #[inline]
    pub fn get(&self, x: isize, y: isize) -> Option<u16> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        self.pixels.get(y as usize * self.width + x as usize).copied()
    }

    #[inline]
    pub fn get_unchecked(&self, x: usize, y: usize) -> u16 {
        self.pixels[y * self.width + x]
    }

    pub fn row(&self, y: usize) -> &[u16] {
        &self.pixels[y * self.width..(y + 1) * self.width]
    }
}

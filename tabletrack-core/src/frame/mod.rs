//! frame — RGB frame buffers, colour-space helpers and an image-sequence source
//!
//! Video decoding is left to the caller; the core consumes packed RGB24
//! frames.  The CLI feeds it from a directory of still images.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::{imageops, GrayImage, Luma, RgbImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ── Frame ─────────────────────────────────────────────────────────────────────

/// A single decoded frame in RGB24 format plus its position in the stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>, // packed RGB24, row-major
    pub width: u32,
    pub height: u32,
    pub index: u64,
}

impl Frame {
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>, index: u64) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            bail!(
                "frame buffer is {} bytes, expected {expected} for {width}×{height}",
                data.len()
            );
        }
        Ok(Self {
            data,
            width,
            height,
            index,
        })
    }

    pub fn from_image(image: RgbImage, index: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            index,
        }
    }

    pub fn to_image(&self) -> RgbImage {
        // Length is checked at construction.
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// BT.601 luma.
    pub fn gray(&self) -> GrayImage {
        let luma: Vec<u8> = self
            .data
            .par_chunks_exact(3)
            .map(|px| (0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32) as u8)
            .collect();
        GrayImage::from_raw(self.width, self.height, luma)
            .unwrap_or_else(|| GrayImage::new(self.width, self.height))
    }

    pub fn hsv(&self) -> HsvImage {
        let data = self
            .data
            .par_chunks_exact(3)
            .map(|px| rgb_to_hsv(px[0], px[1], px[2]))
            .collect();
        HsvImage {
            width: self.width,
            height: self.height,
            data,
        }
    }

    /// Copy of the frame with a new stream index.
    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }
}

// ── HSV ───────────────────────────────────────────────────────────────────────

/// 8-bit HSV with hue in `[0, 180)` and saturation/value in `[0, 255]`.
pub struct HsvImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<[u8; 3]>,
}

impl HsvImage {
    pub fn get(&self, x: u32, y: u32) -> [u8; 3] {
        self.data[y as usize * self.width as usize + x as usize]
    }
}

pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (rf, gf, bf) = (r as f32, g as f32, b as f32);
    let v = rf.max(gf).max(bf);
    let min = rf.min(gf).min(bf);
    let diff = v - min;
    let s = if v > 0.0 { 255.0 * diff / v } else { 0.0 };
    let mut h = if diff == 0.0 {
        0.0
    } else if v == rf {
        60.0 * (gf - bf) / diff
    } else if v == gf {
        120.0 + 60.0 * (bf - rf) / diff
    } else {
        240.0 + 60.0 * (rf - gf) / diff
    };
    if h < 0.0 {
        h += 360.0;
    }
    [
        ((h / 2.0).round() as u32 % 180) as u8,
        s.round() as u8,
        v as u8,
    ]
}

/// Inclusive HSV box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsvRange {
    pub lo: [u8; 3],
    pub hi: [u8; 3],
}

impl HsvRange {
    pub const fn new(lo: [u8; 3], hi: [u8; 3]) -> Self {
        Self { lo, hi }
    }

    pub fn contains(&self, px: [u8; 3]) -> bool {
        (0..3).all(|c| self.lo[c] <= px[c] && px[c] <= self.hi[c])
    }
}

/// Binary mask (0/255) of pixels inside any of `ranges`.
pub fn in_range(hsv: &HsvImage, ranges: &[HsvRange]) -> GrayImage {
    let data: Vec<u8> = hsv
        .data
        .par_iter()
        .map(|&px| {
            if ranges.iter().any(|r| r.contains(px)) {
                255
            } else {
                0
            }
        })
        .collect();
    GrayImage::from_raw(hsv.width, hsv.height, data)
        .unwrap_or_else(|| GrayImage::new(hsv.width, hsv.height))
}

// ── Region ────────────────────────────────────────────────────────────────────

/// Half-open pixel rectangle `[x0, x1) × [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Region {
    /// Region from float bounds, clamped to a `width × height` image.
    pub fn clamped(x0: f32, y0: f32, x1: f32, y1: f32, width: u32, height: u32) -> Self {
        let cx = |v: f32| v.round().clamp(0.0, width as f32) as u32;
        let cy = |v: f32| v.round().clamp(0.0, height as f32) as u32;
        Self {
            x0: cx(x0),
            y0: cy(y0),
            x1: cx(x1),
            y1: cy(y1),
        }
    }

    /// Fractional zone, e.g. `(0.1, 0.9)` of the width.
    pub fn fractional(fx: (f32, f32), fy: (f32, f32), width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self::clamped(fx.0 * w, fy.0 * h, fx.1 * w, fy.1 * h, width, height)
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x0: 0,
            y0: 0,
            x1: width,
            y1: height,
        }
    }

    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        (self.x0..self.x1).contains(&x) && (self.y0..self.y1).contains(&y)
    }

    pub fn intersect(&self, other: &Region) -> Region {
        Region {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
    }

    pub fn crop(&self, image: &GrayImage) -> GrayImage {
        imageops::crop_imm(image, self.x0, self.y0, self.width(), self.height()).to_image()
    }
}

/// Zero every pixel of `mask` outside `region`.
pub fn keep_region(mask: &mut GrayImage, region: Region) {
    for (x, y, px) in mask.enumerate_pixels_mut() {
        if !region.contains(x, y) {
            *px = Luma([0]);
        }
    }
}

// ── Downscaling ───────────────────────────────────────────────────────────────

/// Downscale `frame` so its longest side is at most `max_dim`.
///
/// Returns the scaled frame plus the `(sx, sy)` factors that map scaled
/// coordinates back to source pixels, or `None` if no scaling is needed.
pub fn downscale(frame: &Frame, max_dim: u32) -> Option<(Frame, f32, f32)> {
    let longest = frame.width.max(frame.height);
    if longest <= max_dim || max_dim == 0 {
        return None;
    }
    let scale = max_dim as f32 / longest as f32;
    let w = ((frame.width as f32 * scale).round() as u32).max(1);
    let h = ((frame.height as f32 * scale).round() as u32).max(1);
    let scaled = imageops::resize(&frame.to_image(), w, h, imageops::FilterType::Triangle);
    debug!(from_w = frame.width, from_h = frame.height, w, h, "downscaled frame");
    Some((
        Frame::from_image(scaled, frame.index),
        frame.width as f32 / w as f32,
        frame.height as f32 / h as f32,
    ))
}

// ── Image sequence ────────────────────────────────────────────────────────────

const FRAME_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// Frames stored as still images in a directory, in filename order.
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageSequence {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("cannot read frame directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| FRAME_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();
        if paths.is_empty() {
            bail!("no PNG/JPEG frames in {}", dir.display());
        }
        Ok(Self { paths, next: 0 })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Random access, independent of iteration.
    pub fn frame(&self, index: usize) -> Result<Frame> {
        let path = self
            .paths
            .get(index)
            .with_context(|| format!("frame {index} out of range ({} frames)", self.len()))?;
        let image = image::open(path)
            .with_context(|| format!("failed to decode {}", path.display()))?
            .to_rgb8();
        Ok(Frame::from_image(image, index as u64))
    }
}

impl Iterator for ImageSequence {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.paths.len() {
            return None;
        }
        let i = self.next;
        self.next += 1;
        Some(self.frame(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn hsv_matches_8bit_convention() {
        assert_eq!(rgb_to_hsv(255, 0, 0), [0, 255, 255]);
        assert_eq!(rgb_to_hsv(0, 255, 0), [60, 255, 255]);
        assert_eq!(rgb_to_hsv(0, 0, 255), [120, 255, 255]);
        assert_eq!(rgb_to_hsv(128, 128, 128), [0, 0, 128]);
        // Table blue.
        let [h, s, v] = rgb_to_hsv(30, 60, 150);
        assert!((110..=115).contains(&h));
        assert!(s > 190);
        assert_eq!(v, 150);
    }

    #[test]
    fn in_range_unions_ranges() {
        let mut img = RgbImage::new(3, 1);
        img.put_pixel(0, 0, Rgb([255, 255, 255]));
        img.put_pixel(1, 0, Rgb([30, 60, 150]));
        img.put_pixel(2, 0, Rgb([10, 10, 10]));
        let hsv = Frame::from_image(img, 0).hsv();
        let white = HsvRange::new([0, 0, 200], [180, 40, 255]);
        let blue = HsvRange::new([90, 30, 20], [130, 255, 200]);
        let mask = in_range(&hsv, &[white, blue]);
        assert_eq!(mask.as_raw(), &vec![255, 255, 0]);
    }

    #[test]
    fn rejects_wrong_buffer_length() {
        assert!(Frame::from_rgb(4, 4, vec![0; 10], 0).is_err());
        assert!(Frame::from_rgb(2, 2, vec![0; 12], 0).is_ok());
    }

    #[test]
    fn downscale_maps_back_to_source() {
        let frame = Frame::from_image(RgbImage::new(2560, 1440), 7);
        let (small, sx, sy) = downscale(&frame, 1280).unwrap();
        assert_eq!((small.width, small.height), (1280, 720));
        assert_eq!(small.index, 7);
        assert_eq!((sx, sy), (2.0, 2.0));
        assert!(downscale(&small, 1280).is_none());
    }

    #[test]
    fn region_clamps_to_image() {
        let r = Region::clamped(-10.0, 5.0, 900.0, 50.0, 640, 360);
        assert_eq!(r, Region { x0: 0, y0: 5, x1: 640, y1: 50 });
        assert!(Region::clamped(10.0, 10.0, 5.0, 20.0, 640, 360).is_empty());
    }

    #[test]
    fn sequence_reads_frames_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        for (name, shade) in [("b.png", 20u8), ("a.png", 10), ("notes.txt", 0)] {
            let path = dir.path().join(name);
            if name.ends_with(".png") {
                RgbImage::from_pixel(4, 3, Rgb([shade; 3])).save(&path).unwrap();
            } else {
                std::fs::write(&path, "skip me").unwrap();
            }
        }
        let seq = ImageSequence::open(dir.path()).unwrap();
        assert_eq!(seq.len(), 2);
        let frames: Vec<Frame> = seq.map(|f| f.unwrap()).collect();
        assert_eq!(frames[0].data[0], 10);
        assert_eq!(frames[1].data[0], 20);
        assert_eq!(frames[1].index, 1);
    }
}

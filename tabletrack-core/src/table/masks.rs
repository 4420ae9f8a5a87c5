//! Colour bands and binary-mask helpers shared by the table strategies.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology;

use crate::frame::{in_range, HsvImage, HsvRange};

// ── Colour bands (8-bit HSV, hue in [0, 180)) ────────────────────────────────

/// Dark blue playing surface.
pub const SURFACE_BLUE: HsvRange = HsvRange::new([90, 30, 20], [130, 255, 200]);
/// Dark green playing surface.
pub const SURFACE_GREEN: HsvRange = HsvRange::new([35, 30, 20], [90, 255, 200]);
/// Teal / washed-out blue surface.
pub const SURFACE_TEAL: HsvRange = HsvRange::new([80, 20, 15], [135, 255, 220]);

/// Saturated blue used by the last-resort contour strategy.
pub const CONTOUR_BLUE: HsvRange = HsvRange::new([95, 60, 40], [125, 255, 200]);
pub const CONTOUR_GREEN: HsvRange = HsvRange::new([40, 60, 40], [80, 255, 200]);

/// Painted white edge lines.
pub const LINE_WHITE: HsvRange = HsvRange::new([0, 0, 150], [180, 80, 255]);
/// Light grey markings (net tape, worn edge lines).
pub const LINE_LIGHT: HsvRange = HsvRange::new([0, 0, 110], [180, 50, 210]);

/// Pink/magenta arena barriers and border trim.
pub const BORDER_PINK: HsvRange = HsvRange::new([130, 50, 30], [175, 255, 255]);
pub const BORDER_RED: HsvRange = HsvRange::new([0, 50, 30], [12, 255, 255]);
pub const BORDER_WHITE: HsvRange = HsvRange::new([0, 0, 180], [180, 50, 255]);
pub const BORDER_YELLOW: HsvRange = HsvRange::new([15, 40, 150], [35, 255, 255]);
pub const BORDER_CYAN: HsvRange = HsvRange::new([80, 40, 150], [100, 255, 255]);

// ── Masks ─────────────────────────────────────────────────────────────────────

pub fn line_mask(hsv: &HsvImage) -> GrayImage {
    in_range(hsv, &[LINE_WHITE, LINE_LIGHT])
}

pub fn pink_mask(hsv: &HsvImage) -> GrayImage {
    let mask = in_range(hsv, &[BORDER_PINK, BORDER_RED]);
    morphology::close(&mask, Norm::LInf, 1)
}

/// Every colour a table border is painted in.
pub fn color_mask(hsv: &HsvImage) -> GrayImage {
    let mask = in_range(
        hsv,
        &[
            BORDER_PINK,
            BORDER_RED,
            BORDER_WHITE,
            BORDER_YELLOW,
            BORDER_CYAN,
        ],
    );
    let closed = morphology::close(&mask, Norm::LInf, 2);
    morphology::open(&closed, Norm::LInf, 1)
}

/// Pixel-wise OR.
pub fn union(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let mut out = a.clone();
    for (o, p) in out.pixels_mut().zip(b.pixels()) {
        o.0[0] = o.0[0].max(p.0[0]);
    }
    out
}

/// `a` with `b`'s foreground removed.
pub fn subtract(a: &GrayImage, b: &GrayImage) -> GrayImage {
    let mut out = a.clone();
    for (o, p) in out.pixels_mut().zip(b.pixels()) {
        o.0[0] = o.0[0].saturating_sub(p.0[0]);
    }
    out
}

/// Binary threshold: `255` where the pixel is strictly above `level`.
pub fn threshold(image: &GrayImage, level: u8) -> GrayImage {
    let mut out = image.clone();
    for p in out.pixels_mut() {
        *p = Luma([if p.0[0] > level { 255 } else { 0 }]);
    }
    out
}

/// Foreground pixels per row.
pub fn row_counts(mask: &GrayImage) -> Vec<u32> {
    mask.rows()
        .map(|row| row.filter(|p| p.0[0] > 0).count() as u32)
        .collect()
}

/// Foreground pixels per column over rows `y0..y1`.
pub fn column_counts(mask: &GrayImage, y0: u32, y1: u32) -> Vec<u32> {
    let mut counts = vec![0u32; mask.width() as usize];
    for y in y0..y1.min(mask.height()) {
        for (x, c) in counts.iter_mut().enumerate() {
            if mask.get_pixel(x as u32, y).0[0] > 0 {
                *c += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_and_subtract() {
        let a = GrayImage::from_raw(3, 1, vec![255, 0, 255]).unwrap();
        let b = GrayImage::from_raw(3, 1, vec![0, 255, 255]).unwrap();
        assert_eq!(union(&a, &b).as_raw(), &vec![255, 255, 255]);
        assert_eq!(subtract(&a, &b).as_raw(), &vec![255, 0, 0]);
    }

    #[test]
    fn counts_rows_and_columns() {
        let mut m = GrayImage::new(4, 3);
        m.put_pixel(1, 0, Luma([255]));
        m.put_pixel(1, 2, Luma([255]));
        m.put_pixel(3, 2, Luma([255]));
        assert_eq!(row_counts(&m), vec![1, 0, 2]);
        assert_eq!(column_counts(&m, 0, 3), vec![0, 2, 0, 1]);
        assert_eq!(column_counts(&m, 1, 3), vec![0, 1, 0, 1]);
    }
}

//! Playing-surface localisation by colour segmentation.

use image::GrayImage;
use imageproc::contours::{find_contours, Contour};
use imageproc::distance_transform::Norm;
use imageproc::geometry::contour_area;
use imageproc::morphology;

use crate::frame::{in_range, keep_region, HsvImage, HsvRange, Region};

use super::masks::{SURFACE_BLUE, SURFACE_GREEN, SURFACE_TEAL};

/// Finds the largest plausibly-placed blob of table-surface colour.
#[derive(Debug, Clone)]
pub struct SurfaceColorLocator {
    pub ranges: Vec<HsvRange>,
    /// Fractional search zone, `(from, to)` along each axis.
    pub zone_x: (f32, f32),
    pub zone_y: (f32, f32),
    pub close_radius: u8,
    pub open_radius: u8,
    /// Minimum blob area as a fraction of the frame.
    pub min_area_fraction: f32,
    /// Allowed blob centroid, fractional.
    pub centroid_x: (f32, f32),
    pub centroid_y: (f32, f32),
}

impl Default for SurfaceColorLocator {
    fn default() -> Self {
        Self {
            ranges: vec![SURFACE_BLUE, SURFACE_GREEN, SURFACE_TEAL],
            zone_x: (0.05, 0.95),
            zone_y: (0.10, 0.85),
            close_radius: 6,
            open_radius: 4,
            min_area_fraction: 0.015,
            centroid_x: (0.15, 0.85),
            centroid_y: (0.15, 0.80),
        }
    }
}

/// A surface blob: its traced outline and bounding box.
#[derive(Debug, Clone)]
pub struct SurfaceBlob {
    pub contour: Contour<i32>,
    pub area: f64,
    pub bbox: Region,
}

impl SurfaceColorLocator {
    pub fn mask(&self, hsv: &HsvImage) -> GrayImage {
        let mut mask = in_range(hsv, &self.ranges);
        let zone = Region::fractional(self.zone_x, self.zone_y, hsv.width, hsv.height);
        keep_region(&mut mask, zone);
        let closed = morphology::close(&mask, Norm::L2, self.close_radius);
        morphology::open(&closed, Norm::L2, self.open_radius)
    }

    /// Outer blobs passing the area and centroid filters, largest first.
    pub fn blobs(&self, hsv: &HsvImage) -> Vec<SurfaceBlob> {
        let (w, h) = (hsv.width as f32, hsv.height as f32);
        let min_area = (self.min_area_fraction * w * h) as f64;
        let mask = self.mask(hsv);

        let mut blobs: Vec<SurfaceBlob> = find_contours::<i32>(&mask)
            .into_iter()
            .filter(|c| c.parent.is_none() && !c.points.is_empty())
            .filter_map(|contour| {
                let area = contour_area(&contour.points);
                if area < min_area {
                    return None;
                }
                let bbox = bounding_region(&contour)?;
                let cx = (bbox.x0 + bbox.x1) as f32 / 2.0 / w;
                let cy = (bbox.y0 + bbox.y1) as f32 / 2.0 / h;
                let placed = (self.centroid_x.0..=self.centroid_x.1).contains(&cx)
                    && (self.centroid_y.0..=self.centroid_y.1).contains(&cy);
                placed.then_some(SurfaceBlob {
                    contour,
                    area,
                    bbox,
                })
            })
            .collect();
        blobs.sort_by(|a, b| b.area.total_cmp(&a.area));
        blobs
    }

    pub fn locate(&self, hsv: &HsvImage) -> Option<Region> {
        self.blobs(hsv).first().map(|b| b.bbox)
    }
}

/// Half-open bounding box of a contour.
fn bounding_region(contour: &Contour<i32>) -> Option<Region> {
    let x0 = contour.points.iter().map(|p| p.x).min()?;
    let x1 = contour.points.iter().map(|p| p.x).max()?;
    let y0 = contour.points.iter().map(|p| p.y).min()?;
    let y1 = contour.points.iter().map(|p| p.y).max()?;
    Some(Region {
        x0: x0.max(0) as u32,
        y0: y0.max(0) as u32,
        x1: (x1.max(0) + 1) as u32,
        y1: (y1.max(0) + 1) as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    #[test]
    fn locates_centered_blue_surface() {
        let mut img = RgbImage::from_pixel(640, 360, Rgb([40, 40, 40]));
        draw_filled_rect_mut(&mut img, Rect::at(180, 150).of_size(280, 110), Rgb([30, 60, 150]));
        let hsv = Frame::from_image(img, 0).hsv();

        let region = SurfaceColorLocator::default().locate(&hsv).unwrap();
        assert!((region.x0 as i32 - 180).abs() <= 2);
        assert!((region.x1 as i32 - 460).abs() <= 2);
        assert!((region.y0 as i32 - 150).abs() <= 2);
        assert!((region.y1 as i32 - 260).abs() <= 2);
    }

    #[test]
    fn off_center_blob_is_ignored() {
        let mut img = RgbImage::from_pixel(640, 360, Rgb([40, 40, 40]));
        draw_filled_rect_mut(&mut img, Rect::at(40, 40).of_size(80, 50), Rgb([30, 60, 150]));
        let hsv = Frame::from_image(img, 0).hsv();
        assert!(SurfaceColorLocator::default().locate(&hsv).is_none());
    }
}

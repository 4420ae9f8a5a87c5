//! Snap an approximate axis-aligned table box onto real edge lines.

use image::GrayImage;

use crate::frame::Region;
use crate::geometry::{CornerQuad, Line, Segment};

use super::segments::{first_sufficient, SegmentDetector};

const VOTE_THRESHOLDS: [u32; 3] = [20, 12, 8];

/// Re-detects each table edge inside a narrow band around its approximate
/// position and intersects the four refined lines.
pub struct EdgeRefiner<'a> {
    edges: &'a GrayImage,
}

impl<'a> EdgeRefiner<'a> {
    pub fn new(edges: &'a GrayImage) -> Self {
        Self { edges }
    }

    /// `(left, top, right, bottom)` in, refined corners out. Sides with no
    /// usable segment keep their axis line.
    pub fn refine(&self, left: f32, top: f32, right: f32, bottom: f32) -> Option<CornerQuad> {
        let (w, h) = (self.edges.width(), self.edges.height());
        let margin = (w.min(h) as f32 / 50.0).max(15.0);
        let pad = 3.0 * margin;
        let (tw, th) = (right - left, bottom - top);

        let h_len = (tw / 25.0).max(15.0);
        let h_gap = (tw / 10.0).max(20.0);
        let v_len = (th / 25.0).max(15.0);
        let v_gap = (th / 10.0).max(20.0);

        let horizontal = |y: f32| {
            let band = Region::clamped(left - pad, y - margin, right + pad, y + margin + 1.0, w, h);
            self.longest_in(band, h_len, h_gap, |s| s.angle_deg() < 25.0)
                .and_then(|s| s.line())
                .unwrap_or(Line::horizontal(y))
        };
        let vertical = |x: f32| {
            let band = Region::clamped(x - margin, top - pad, x + margin + 1.0, bottom + pad, w, h);
            self.longest_in(band, v_len, v_gap, |s| s.angle_deg() > 65.0)
                .and_then(|s| s.line())
                .unwrap_or(Line::vertical(x))
        };

        let (t, b) = (horizontal(top), horizontal(bottom));
        let (l, r) = (vertical(left), vertical(right));
        Some(CornerQuad::new([
            t.intersect(&l)?,
            t.intersect(&r)?,
            b.intersect(&r)?,
            b.intersect(&l)?,
        ]))
    }

    fn longest_in(
        &self,
        band: Region,
        min_length: f32,
        max_gap: f32,
        keep: impl Fn(&Segment) -> bool,
    ) -> Option<Segment> {
        let detector = SegmentDetector::new(self.edges, band)?;
        let params: Vec<_> = VOTE_THRESHOLDS
            .iter()
            .map(|&t| (t, min_length, max_gap))
            .collect();
        first_sufficient(&detector, &params, 1)
            .into_iter()
            .filter(|s| keep(s))
            .max_by(|a, b| a.length().total_cmp(&b.length()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use image::Luma;
    use imageproc::drawing::draw_hollow_polygon_mut;
    use imageproc::point::Point as IpPoint;

    #[test]
    fn snaps_rough_box_to_drawn_outline() {
        let mut edges = GrayImage::new(640, 360);
        let outline = [
            IpPoint::new(200.0, 140.0),
            IpPoint::new(440.0, 140.0),
            IpPoint::new(460.0, 250.0),
            IpPoint::new(180.0, 250.0),
        ];
        draw_hollow_polygon_mut(&mut edges, &outline, Luma([255u8]));

        let quad = EdgeRefiner::new(&edges)
            .refine(190.0, 146.0, 450.0, 244.0)
            .unwrap();
        let expect = [
            Point::new(200.0, 140.0),
            Point::new(440.0, 140.0),
            Point::new(460.0, 250.0),
            Point::new(180.0, 250.0),
        ];
        for (got, want) in quad.corners().iter().zip(expect) {
            assert!(got.distance(want) < 6.0, "{got:?} vs {want:?}");
        }
    }

    #[test]
    fn blank_edges_keep_the_axis_box() {
        let edges = GrayImage::new(320, 240);
        let quad = EdgeRefiner::new(&edges).refine(50.0, 60.0, 250.0, 160.0).unwrap();
        assert_eq!(quad, CornerQuad::from_bounds(50.0, 60.0, 250.0, 160.0));
    }
}

//! Line-segment extraction: a Hough accumulator over a mask region, then a
//! walk along each peak line that keeps the gap-tolerant runs of foreground.

use image::GrayImage;

use crate::frame::Region;
use crate::geometry::{Point, Segment};

const THETA_BINS: usize = 180;
const NMS_WINDOW_RHO: isize = 4;
const NMS_WINDOW_THETA: isize = 3;
/// Strongest peaks walked per threshold.
const MAX_LINES: usize = 64;

/// Hough accumulator over the foreground of `mask` inside `region`.
///
/// Built once, then queried at several vote thresholds.
pub struct SegmentDetector<'a> {
    mask: &'a GrayImage,
    region: Region,
    votes: Vec<u32>,
    rho_bins: usize,
    max_rho: f32,
    trig: [(f32, f32); THETA_BINS],
}

impl<'a> SegmentDetector<'a> {
    pub fn new(mask: &'a GrayImage, region: Region) -> Option<Self> {
        let region = region.intersect(&Region::full(mask.width(), mask.height()));
        if region.is_empty() {
            return None;
        }
        let (w, h) = (region.width() as f32, region.height() as f32);
        let max_rho = w.hypot(h);
        let rho_bins = (2.0 * max_rho).ceil() as usize + 1;

        let mut trig = [(0.0f32, 0.0f32); THETA_BINS];
        for (deg, t) in trig.iter_mut().enumerate() {
            let rad = (deg as f32).to_radians();
            *t = (rad.cos(), rad.sin());
        }

        let mut votes = vec![0u32; rho_bins * THETA_BINS];
        let mut any = false;
        for y in region.y0..region.y1 {
            for x in region.x0..region.x1 {
                if mask.get_pixel(x, y).0[0] == 0 {
                    continue;
                }
                any = true;
                let (lx, ly) = ((x - region.x0) as f32, (y - region.y0) as f32);
                for (theta, &(c, s)) in trig.iter().enumerate() {
                    let rho = lx * c + ly * s;
                    let idx = (rho + max_rho).round() as usize;
                    votes[theta * rho_bins + idx.min(rho_bins - 1)] += 1;
                }
            }
        }
        if !any {
            return None;
        }

        Some(Self {
            mask,
            region,
            votes,
            rho_bins,
            max_rho,
            trig,
        })
    }

    /// Segments of at least `min_length` pixels along lines with at least
    /// `threshold` votes, bridging gaps of up to `max_gap` pixels.
    pub fn segments(&self, threshold: u32, min_length: f32, max_gap: f32) -> Vec<Segment> {
        self.peaks(threshold)
            .into_iter()
            .flat_map(|(rho, theta)| self.walk(rho, theta, min_length, max_gap))
            .collect()
    }

    /// Local maxima of the accumulator, strongest first.
    fn peaks(&self, threshold: u32) -> Vec<(f32, usize)> {
        let mut peaks: Vec<(u32, usize, usize)> = Vec::new();
        for theta in 0..THETA_BINS {
            for r in 0..self.rho_bins {
                let v = self.votes[theta * self.rho_bins + r];
                if v < threshold.max(1) || !self.is_local_max(r, theta, v) {
                    continue;
                }
                peaks.push((v, theta, r));
            }
        }
        peaks.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        peaks.truncate(MAX_LINES);
        peaks
            .into_iter()
            .map(|(_, theta, r)| (r as f32 - self.max_rho, theta))
            .collect()
    }

    /// Ties go to the cell that comes first in scan order.
    fn is_local_max(&self, r: usize, theta: usize, v: u32) -> bool {
        for dt in -NMS_WINDOW_THETA..=NMS_WINDOW_THETA {
            let t = theta as isize + dt;
            if !(0..THETA_BINS as isize).contains(&t) {
                continue;
            }
            for dr in -NMS_WINDOW_RHO..=NMS_WINDOW_RHO {
                let rr = r as isize + dr;
                if (dt == 0 && dr == 0) || !(0..self.rho_bins as isize).contains(&rr) {
                    continue;
                }
                let other = self.votes[t as usize * self.rho_bins + rr as usize];
                let earlier = (t, rr) < (theta as isize, r as isize);
                if other > v || (other == v && earlier) {
                    return false;
                }
            }
        }
        true
    }

    fn walk(&self, rho: f32, theta: usize, min_length: f32, max_gap: f32) -> Vec<Segment> {
        let (c, s) = self.trig[theta];
        let origin = (rho * c, rho * s);
        let dir = (-s, c);
        let reach = self.max_rho.ceil() as i32;

        let at = |t: i32| (origin.0 + dir.0 * t as f32, origin.1 + dir.1 * t as f32);
        // One pixel of slack across the line absorbs rho quantisation.
        let hits: Vec<i32> = (-reach..=reach)
            .filter(|&t| {
                let (x, y) = at(t);
                self.is_set(x, y) || self.is_set(x + c, y + s) || self.is_set(x - c, y - s)
            })
            .collect();

        let mut out = Vec::new();
        let Some(&first) = hits.first() else {
            return out;
        };
        let (mut start, mut prev) = (first, first);
        let mut flush = |start: i32, end: i32, out: &mut Vec<Segment>| {
            if (end - start) as f32 >= min_length {
                let (ax, ay) = at(start);
                let (bx, by) = at(end);
                let (ox, oy) = (self.region.x0 as f32, self.region.y0 as f32);
                out.push(Segment::new(
                    Point::new(ax + ox, ay + oy),
                    Point::new(bx + ox, by + oy),
                ));
            }
        };
        for &t in &hits[1..] {
            if (t - prev) as f32 > max_gap + 1.0 {
                flush(start, prev, &mut out);
                start = t;
            }
            prev = t;
        }
        flush(start, prev, &mut out);
        out
    }

    /// Foreground test in region-local coordinates.
    fn is_set(&self, x: f32, y: f32) -> bool {
        let (xi, yi) = (x.round(), y.round());
        if xi < 0.0 || yi < 0.0 {
            return false;
        }
        let (xi, yi) = (xi as u32, yi as u32);
        if xi >= self.region.width() || yi >= self.region.height() {
            return false;
        }
        self.mask
            .get_pixel(self.region.x0 + xi, self.region.y0 + yi)
            .0[0]
            > 0
    }
}

/// Run thresholds in order, accumulating segments until at least `enough`
/// have been found.
pub fn accumulate_segments(
    detector: &SegmentDetector<'_>,
    thresholds: &[u32],
    min_length: f32,
    max_gap: f32,
    enough: usize,
) -> Vec<Segment> {
    let mut all = Vec::new();
    for &t in thresholds {
        all.extend(detector.segments(t, min_length, max_gap));
        if all.len() >= enough {
            break;
        }
    }
    all
}

/// Segments at the first threshold that yields at least `enough`.
pub fn first_sufficient(
    detector: &SegmentDetector<'_>,
    params: &[(u32, f32, f32)],
    enough: usize,
) -> Vec<Segment> {
    let mut last = Vec::new();
    for &(threshold, min_length, max_gap) in params {
        last = detector.segments(threshold, min_length, max_gap);
        if last.len() >= enough {
            break;
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::*;
    use imageproc::drawing::draw_line_segment_mut;
    use image::Luma;

    #[test]
    fn finds_horizontal_and_vertical_strokes() {
        let mut mask = GrayImage::new(200, 120);
        draw_line_segment_mut(&mut mask, (20.0, 30.0), (180.0, 30.0), Luma([255]));
        draw_line_segment_mut(&mut mask, (50.0, 10.0), (50.0, 110.0), Luma([255]));

        let det = SegmentDetector::new(&mask, Region::full(200, 120)).unwrap();
        let segs = det.segments(40, 30.0, 5.0);

        let horizontal = segs
            .iter()
            .find(|s| s.angle_deg() < 5.0 && s.length() > 140.0)
            .expect("horizontal stroke");
        assert!((horizontal.midpoint().y - 30.0).abs() <= 1.5);

        let vertical = segs
            .iter()
            .find(|s| s.angle_deg() > 85.0 && s.length() > 80.0)
            .expect("vertical stroke");
        assert!((vertical.midpoint().x - 50.0).abs() <= 1.5);
    }

    #[test]
    fn gaps_split_or_bridge_runs() {
        let mut mask = GrayImage::new(300, 40);
        draw_line_segment_mut(&mut mask, (10.0, 20.0), (100.0, 20.0), Luma([255]));
        draw_line_segment_mut(&mut mask, (140.0, 20.0), (290.0, 20.0), Luma([255]));
        let det = SegmentDetector::new(&mask, Region::full(300, 40)).unwrap();

        let split = det.segments(100, 50.0, 10.0);
        let flat: Vec<_> = split.iter().filter(|s| s.angle_deg() < 1.0).collect();
        assert!(flat.iter().all(|s| s.length() < 160.0));
        assert!(flat.iter().any(|s| s.length() > 140.0));

        let bridged = det.segments(100, 50.0, 60.0);
        assert!(bridged.iter().any(|s| s.angle_deg() < 1.0 && s.length() > 270.0));
    }

    #[test]
    fn region_offsets_are_restored() {
        let mut mask = GrayImage::new(200, 200);
        draw_line_segment_mut(&mut mask, (110.0, 150.0), (190.0, 150.0), Luma([255]));
        let region = Region { x0: 100, y0: 100, x1: 200, y1: 200 };
        let det = SegmentDetector::new(&mask, region).unwrap();
        let segs = det.segments(30, 40.0, 5.0);
        assert!(segs
            .iter()
            .any(|s| (s.midpoint().y - 150.0).abs() <= 1.5 && s.a.x >= 100.0));
    }

    #[test]
    fn empty_mask_has_no_detector() {
        let mask = GrayImage::new(50, 50);
        assert!(SegmentDetector::new(&mask, Region::full(50, 50)).is_none());
    }
}

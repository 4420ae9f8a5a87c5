//! detection — per-frame ball candidates from motion, colour and shape
//!
//! Motion (two-frame differencing ∪ background foreground) is intersected
//! with ball-coloured pixels inside the table ROI, cleaned, and split into
//! connected components. Components that are small, round and compact are
//! scored; the best one, biased toward the previous position, is returned.
//! When no component survives the shape filters, moving white pixels are
//! searched again with only the size and ROI checks, so motion-blurred
//! streaks still yield a low-confidence candidate.

pub mod background;

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_polygon_mut;
use imageproc::geometry::convex_hull;
use imageproc::map::map_colors2;
use imageproc::morphology;
use imageproc::point::Point as IpPoint;
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::frame::{in_range, Frame, HsvRange};
use crate::geometry::{CornerQuad, Point};

use self::background::{BackgroundConfig, BackgroundModel};

// ── Ball colours (8-bit HSV) ─────────────────────────────────────────────────

pub const BALL_WHITE: HsvRange = HsvRange::new([0, 0, 170], [180, 75, 255]);
pub const BALL_ORANGE: HsvRange = HsvRange::new([5, 90, 140], [28, 255, 255]);
pub const BALL_YELLOW: HsvRange = HsvRange::new([18, 70, 170], [42, 255, 255]);

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    /// Absolute intensity change that counts as motion between frames.
    pub diff_threshold: u8,
    /// Frames to observe before any candidate is reported.
    pub warmup_frames: u64,
    pub background: BackgroundConfig,
    /// ROI apex above the table's top edge, as a fraction of frame height.
    pub roi_lift: f32,
    /// Minimum outward ROI dilation in pixels.
    pub roi_margin: u32,
    pub min_circularity: f32,
    pub desperate_min_circularity: f32,
    /// Longest/shortest bounding-box side above which a blob is too elongated.
    pub max_elongation: f32,
    /// Area at which the size score saturates.
    pub ideal_area: f32,
    pub circularity_weight: f32,
    pub size_weight: f32,
    /// Share of the proximity term when blending with confidence.
    pub proximity_weight: f32,
    /// Flat confidence of streak candidates found without an ROI.
    pub fallback_confidence: f32,
    /// Flat confidence of streak candidates found inside an ROI.
    pub fallback_confidence_roi: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            diff_threshold: 15,
            warmup_frames: 3,
            background: BackgroundConfig::default(),
            roi_lift: 0.15,
            roi_margin: 6,
            min_circularity: 0.20,
            desperate_min_circularity: 0.15,
            max_elongation: 2.8,
            ideal_area: 350.0,
            circularity_weight: 0.55,
            size_weight: 0.45,
            proximity_weight: 0.65,
            fallback_confidence: 0.3,
            fallback_confidence_roi: 0.35,
        }
    }
}

// ── ROI ──────────────────────────────────────────────────────────────────────

/// Search area: the table quad extended upward for airborne shots and
/// dilated outward by a small margin.
#[derive(Debug, Clone)]
pub struct Roi {
    polygon: Vec<Point>,
    mask: GrayImage,
}

impl Roi {
    pub fn from_quad(quad: &CornerQuad, width: u32, height: u32, config: &ExtractorConfig) -> Self {
        let (_, top, _, _) = quad.bounds();
        let c = quad.centroid();
        let apex = Point::new(c.x, (top - config.roi_lift * height as f32).max(0.0));

        let pts: Vec<IpPoint<i32>> = quad
            .corners()
            .iter()
            .chain(std::iter::once(&apex))
            .map(|p| IpPoint::new(p.x.round() as i32, p.y.round() as i32))
            .collect();
        let mut hull = convex_hull(pts);
        if hull.len() > 1 && hull.first() == hull.last() {
            hull.pop();
        }

        let mut mask = GrayImage::new(width, height);
        if hull.len() >= 3 {
            draw_polygon_mut(&mut mask, &hull, Luma([255u8]));
        }
        let margin = (width.min(height) / 50).max(config.roi_margin).min(u8::MAX as u32) as u8;
        let mask = morphology::dilate(&mask, Norm::L2, margin);

        Self {
            polygon: hull.iter().map(|p| Point::new(p.x as f32, p.y as f32)).collect(),
            mask,
        }
    }

    pub fn polygon(&self) -> &[Point] {
        &self.polygon
    }

    pub fn contains(&self, p: Point) -> bool {
        if p.x < 0.0 || p.y < 0.0 {
            return false;
        }
        let (x, y) = (p.x as u32, p.y as u32);
        x < self.mask.width() && y < self.mask.height() && self.mask.get_pixel(x, y).0[0] > 0
    }

    fn mask_for(&self, width: u32, height: u32) -> Option<&GrayImage> {
        (self.mask.dimensions() == (width, height)).then_some(&self.mask)
    }
}

// ── Candidates ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BallCandidate {
    pub position: Point,
    pub confidence: f32,
    pub area: u32,
    pub circularity: f32,
}

#[derive(Debug, Clone, Copy)]
struct Blob {
    area: u32,
    /// Pixels with a 4-neighbour outside the blob.
    boundary: u32,
    sum_x: u64,
    sum_y: u64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl Blob {
    fn new() -> Self {
        Self {
            area: 0,
            boundary: 0,
            sum_x: 0,
            sum_y: 0,
            min_x: u32::MAX,
            min_y: u32::MAX,
            max_x: 0,
            max_y: 0,
        }
    }

    fn centroid(&self) -> Point {
        let n = self.area.max(1) as f32;
        Point::new(self.sum_x as f32 / n, self.sum_y as f32 / n)
    }

    /// `4π·area / perimeter²`, capped at 1.
    fn circularity(&self) -> f32 {
        let perimeter = self.boundary.max(1) as f32;
        (4.0 * std::f32::consts::PI * self.area as f32 / (perimeter * perimeter)).min(1.0)
    }

    fn elongation(&self) -> f32 {
        let bw = (self.max_x - self.min_x + 1) as f32;
        let bh = (self.max_y - self.min_y + 1) as f32;
        bw.max(bh) / bw.min(bh)
    }
}

// ── Extractor ────────────────────────────────────────────────────────────────

/// Owns the rolling frame history and background model for one stream.
pub struct BallCandidateExtractor {
    config: ExtractorConfig,
    background: BackgroundModel,
    prev: Option<GrayImage>,
    prev_prev: Option<GrayImage>,
    frames_seen: u64,
}

impl BallCandidateExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            background: BackgroundModel::new(config.background),
            config,
            prev: None,
            prev_prev: None,
            frames_seen: 0,
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Best ball candidate in `frame`, or `None`.
    ///
    /// `search_radius` of `None` means unbounded: the globally best blob is
    /// returned even when a previous position is known.
    pub fn extract(
        &mut self,
        frame: &Frame,
        prev_position: Option<Point>,
        roi: Option<&Roi>,
        search_radius: Option<f32>,
        desperate: bool,
    ) -> Option<BallCandidate> {
        let gray = frame.gray();
        let foreground = self.background.apply(&gray);
        self.frames_seen += 1;

        let motion = self.motion_mask(&gray, &foreground);
        self.prev_prev = self.prev.replace(gray);
        if self.frames_seen < self.config.warmup_frames {
            return None;
        }
        let motion = motion?;

        let hsv = frame.hsv();
        let roi_mask = roi.and_then(|r| r.mask_for(frame.width, frame.height));
        let min_circularity = if desperate {
            self.config.desperate_min_circularity
        } else {
            self.config.min_circularity
        };

        let moving_in = |colours: &[HsvRange]| {
            let mut mask = intersect(&motion, &in_range(&hsv, colours));
            if let Some(r) = roi_mask {
                mask = intersect(&mask, r);
            }
            morphology::open(&mask, Norm::LInf, 1)
        };

        let mask = morphology::close(
            &moving_in(&[BALL_WHITE, BALL_ORANGE, BALL_YELLOW]),
            Norm::LInf,
            2,
        );
        let mut candidates = self.score_blobs(&mask, roi, min_circularity);
        if candidates.is_empty() {
            candidates = self.streak_blobs(&moving_in(&[BALL_WHITE]), roi);
            if candidates.is_empty() {
                return None;
            }
            debug!(frame = frame.index, count = candidates.len(), "streak candidates");
        } else {
            debug!(frame = frame.index, count = candidates.len(), "ball candidates");
        }
        self.choose(&candidates, prev_position, search_radius)
    }

    /// `None` until two earlier frames are available.
    fn motion_mask(&self, gray: &GrayImage, foreground: &GrayImage) -> Option<GrayImage> {
        let t = self.config.diff_threshold;
        let diff = |other: &GrayImage| {
            map_colors2(gray, other, |a, b| {
                Luma([if a.0[0].abs_diff(b.0[0]) > t { 255 } else { 0 }])
            })
        };
        let prev = self.prev.as_ref().filter(|p| p.dimensions() == gray.dimensions())?;
        let mut motion = union(&diff(prev), foreground);
        if let Some(pp) = self.prev_prev.as_ref().filter(|p| p.dimensions() == gray.dimensions()) {
            motion = union(&motion, &diff(pp));
        }
        Some(motion)
    }

    fn score_blobs(&self, mask: &GrayImage, roi: Option<&Roi>, min_circularity: f32) -> Vec<BallCandidate> {
        let (min_area, max_area) = area_range(mask);
        label_blobs(mask)
            .iter()
            .filter_map(|b| {
                let area = b.area as f32;
                let circularity = b.circularity();
                let position = b.centroid();
                let keep = (min_area..=max_area).contains(&area)
                    && circularity >= min_circularity
                    && b.elongation() <= self.config.max_elongation
                    && roi.map_or(true, |r| r.contains(position));
                keep.then(|| BallCandidate {
                    position,
                    confidence: circularity * self.config.circularity_weight
                        + (area.min(self.config.ideal_area) / self.config.ideal_area)
                            * self.config.size_weight,
                    area: b.area,
                    circularity,
                })
            })
            .collect()
    }

    /// Size and ROI checks only; shape is ignored.
    fn streak_blobs(&self, mask: &GrayImage, roi: Option<&Roi>) -> Vec<BallCandidate> {
        let (min_area, max_area) = area_range(mask);
        let confidence = if roi.is_some() {
            self.config.fallback_confidence_roi
        } else {
            self.config.fallback_confidence
        };
        label_blobs(mask)
            .iter()
            .filter(|b| (min_area..=max_area).contains(&(b.area as f32)))
            .filter(|b| roi.map_or(true, |r| r.contains(b.centroid())))
            .map(|b| BallCandidate {
                position: b.centroid(),
                confidence,
                area: b.area,
                circularity: b.circularity(),
            })
            .collect()
    }

    /// Blend confidence with closeness to the previous position for
    /// candidates inside the search radius; without any, fall back to the
    /// most confident candidate overall.
    fn choose(
        &self,
        candidates: &[BallCandidate],
        prev_position: Option<Point>,
        search_radius: Option<f32>,
    ) -> Option<BallCandidate> {
        let most_confident = || {
            candidates
                .iter()
                .copied()
                .fold(None, |best: Option<BallCandidate>, c| match best {
                    Some(b) if b.confidence >= c.confidence => Some(b),
                    _ => Some(c),
                })
        };
        let (Some(prev), Some(radius)) = (prev_position, search_radius) else {
            return most_confident();
        };
        if radius <= 0.0 {
            return most_confident();
        }

        let wp = self.config.proximity_weight;
        let near = candidates
            .iter()
            .filter_map(|c| {
                let d = c.position.distance(prev);
                (d <= radius).then(|| (c.confidence * (1.0 - wp) + (1.0 - d / radius) * wp, *c))
            })
            .fold(None, |best: Option<(f32, BallCandidate)>, cur| match best {
                Some(b) if b.0 >= cur.0 => Some(b),
                _ => Some(cur),
            });
        near.map(|(_, c)| c).or_else(most_confident)
    }
}

/// Connected components of `mask` with their moments and boundary counts.
fn label_blobs(mask: &GrayImage) -> Vec<Blob> {
    let (w, h) = mask.dimensions();
    let labels = connected_components(mask, Connectivity::Eight, Luma([0u8]));
    let mut blobs: Vec<Blob> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let l = label.0[0] as usize;
        if l == 0 {
            continue;
        }
        if blobs.len() < l {
            blobs.resize(l, Blob::new());
        }
        let same = |dx: i64, dy: i64| {
            let (nx, ny) = (x as i64 + dx, y as i64 + dy);
            nx >= 0
                && ny >= 0
                && (nx as u32) < w
                && (ny as u32) < h
                && labels.get_pixel(nx as u32, ny as u32).0[0] as usize == l
        };
        let b = &mut blobs[l - 1];
        b.area += 1;
        b.sum_x += x as u64;
        b.sum_y += y as u64;
        b.min_x = b.min_x.min(x);
        b.min_y = b.min_y.min(y);
        b.max_x = b.max_x.max(x);
        b.max_y = b.max_y.max(y);
        if !(same(-1, 0) && same(1, 0) && same(0, -1) && same(0, 1)) {
            b.boundary += 1;
        }
    }
    blobs.retain(|b| b.area > 0);
    blobs
}

/// Blob area bounds, scaled with resolution.
fn area_range(mask: &GrayImage) -> (f32, f32) {
    let pixels = mask.width() as f32 * mask.height() as f32;
    ((pixels / 100_000.0).max(3.0), (pixels / 800.0).min(2500.0))
}

fn intersect(a: &GrayImage, b: &GrayImage) -> GrayImage {
    map_colors2(a, b, |p, q| Luma([p.0[0].min(q.0[0])]))
}

fn union(a: &GrayImage, b: &GrayImage) -> GrayImage {
    map_colors2(a, b, |p, q| Luma([p.0[0].max(q.0[0])]))
}

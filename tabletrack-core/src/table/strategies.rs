//! The corner-detection cascade. Each strategy looks at the frame on its
//! own and either returns a validated candidate or gives up.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::find_contours;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology;
use rayon::prelude::*;
use tracing::debug;

use crate::frame::{Frame, HsvImage, Region};
use crate::geometry::{polygon_area, CornerQuad, GeometryValidator, Line};

use super::bands::{
    classify, extreme_corners, group_segments, median_split_corners, nearest_band, peak_scan,
    profile_scan, BandPair, Orientation, PairScoring,
};
use super::masks::{color_mask, line_mask, pink_mask, subtract, threshold, union, CONTOUR_BLUE, CONTOUR_GREEN};
use super::refine::EdgeRefiner;
use super::segments::{accumulate_segments, first_sufficient, SegmentDetector};
use super::shapes::{fit_quad, is_convex, max_corner_cosine, min_rect};
use super::surface::SurfaceColorLocator;

/// Binarisation levels per colour channel in the rectangle search.
const RECT_LEVELS: u32 = 11;
const RECT_MIN_AREA: f32 = 2000.0;
/// Largest |cos| of an interior angle for a rectangle candidate.
const RECT_MAX_COSINE: f32 = 0.3;

const KMEANS_CLUSTERS: usize = 4;
const KMEANS_ITERATIONS: usize = 10;
const KMEANS_SAMPLES: usize = 20_000;

/// Zone profile scans: `(y range, x range, row fraction, column fraction)`,
/// tightest zone first.
const PROFILE_PASSES: [((f32, f32), (f32, f32), f32, f32); 3] = [
    ((0.30, 0.62), (0.24, 0.68), 0.10, 0.04),
    ((0.25, 0.68), (0.18, 0.82), 0.06, 0.03),
    ((0.20, 0.75), (0.10, 0.90), 0.04, 0.02),
];

/// Per-frame derived images shared by all strategies.
pub struct FrameContext {
    pub rgb: RgbImage,
    pub gray: GrayImage,
    pub hsv: HsvImage,
}

impl FrameContext {
    pub fn new(frame: &Frame) -> Self {
        Self {
            rgb: frame.to_image(),
            gray: frame.gray(),
            hsv: frame.hsv(),
        }
    }

    pub fn width(&self) -> u32 {
        self.gray.width()
    }

    pub fn height(&self) -> u32 {
        self.gray.height()
    }
}

/// A validated quad, plus the net row when the strategy saw it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub quad: CornerQuad,
    pub net_y: Option<f32>,
}

impl Candidate {
    fn quad(quad: CornerQuad) -> Self {
        Self { quad, net_y: None }
    }
}

// ── Surface + lines ───────────────────────────────────────────────────────────

/// Locate the surface by colour, then snap its box to the painted edge
/// lines found around it.
pub fn surface_lines(ctx: &FrameContext, validator: &GeometryValidator) -> Option<Candidate> {
    let (w, h) = (ctx.width(), ctx.height());
    let surface = SurfaceColorLocator::default().locate(&ctx.hsv)?;
    let (sw, sh) = (surface.width() as f32, surface.height() as f32);
    if sw < 40.0 || sh < 15.0 {
        debug!(sw, sh, "surface too small");
        return None;
    }
    let (sx0, sy0, sx1, sy1) = (
        surface.x0 as f32,
        surface.y0 as f32,
        surface.x1 as f32,
        surface.y1 as f32,
    );
    let search = Region::clamped(
        sx0 - 0.15 * sw,
        sy0 - 0.25 * sh,
        sx1 + 0.15 * sw,
        sy1 + 0.25 * sh,
        w,
        h,
    );

    let lines = morphology::close(&line_mask(&ctx.hsv), Norm::LInf, 1);
    let blurred = gaussian_blur_f32(&ctx.gray, 1.0);
    let edges = union(&canny(&lines, 30.0, 100.0), &canny(&blurred, 50.0, 150.0));
    let detector = SegmentDetector::new(&edges, search)?;

    let side = sw.min(sh);
    let segments = accumulate_segments(
        &detector,
        &[40, 25, 15],
        (side / 5.0).max(25.0),
        (side / 8.0).max(15.0),
        10,
    );
    if segments.len() < 4 {
        debug!(count = segments.len(), "too few segments around surface");
        return None;
    }

    let (horizontal, vertical) = classify(&segments, 25.0, 55.0);
    if horizontal.len() < 2 {
        return None;
    }
    let rows = group_segments(&horizontal, Orientation::Horizontal, (0.10 * sh).max(10.0));
    let cols = group_segments(&vertical, Orientation::Vertical, (0.08 * sw).max(10.0));

    let top = nearest_band(&rows, sy0, |b| b.center < sy0 + 0.35 * sh)?;
    let bottom = nearest_band(&rows, sy1, |b| {
        b.center > sy0 + 0.5 * sh && !std::ptr::eq(b, top)
    })?;
    let left = nearest_band(&cols, sx0, |b| b.center < sx0 + 0.35 * sw);
    let right = nearest_band(&cols, sx1, |b| {
        b.center > sx0 + 0.5 * sw && left.map_or(true, |l| !std::ptr::eq(b, l))
    });

    let (t, b) = (top.line(), bottom.line());
    let l = left.map_or(Line::vertical(sx0), |band| band.line());
    let r = right.map_or(Line::vertical(sx1), |band| band.line());
    let intersections = (|| {
        Some([t.intersect(&l)?, t.intersect(&r)?, b.intersect(&r)?, b.intersect(&l)?])
    })();
    let quad = match intersections {
        Some(corners) => CornerQuad::new(corners),
        None => CornerQuad::from_bounds(
            left.map_or(sx0, |band| band.center),
            top.center,
            right.map_or(sx1, |band| band.center),
            bottom.center,
        ),
    };
    if !validator.validate(&quad, w, h) {
        return None;
    }

    let span = bottom.center - top.center;
    let net_y = rows
        .iter()
        .find(|band| {
            !std::ptr::eq(*band, top)
                && !std::ptr::eq(*band, bottom)
                && band.center > top.center + 0.2 * span
                && band.center < bottom.center - 0.2 * span
        })
        .map(|band| band.center);

    Some(Candidate { quad, net_y })
}

// ── Border colour bands ───────────────────────────────────────────────────────

/// Painted border bands: density peaks in border-colour masks, then zone
/// profiles, then straight lines in the central zone.
pub fn border_lines(
    ctx: &FrameContext,
    validator: &GeometryValidator,
    scoring: &PairScoring,
) -> Option<Candidate> {
    let (w, h) = (ctx.width(), ctx.height());
    let edges = canny(&ctx.gray, 50.0, 150.0);
    let refiner = EdgeRefiner::new(&edges);
    let settle = |pair: BandPair| -> Option<CornerQuad> {
        let refined = refiner
            .refine(pair.left, pair.top, pair.right, pair.bottom)
            .filter(|q| validator.validate(q, w, h));
        let quad = refined.unwrap_or_else(|| pair.quad());
        validator.validate(&quad, w, h).then_some(quad)
    };

    if let Some(quad) = peak_scan(&pink_mask(&ctx.hsv), 80.0, scoring).and_then(&settle) {
        debug!("border found in pink mask");
        return Some(Candidate::quad(quad));
    }
    let colors = color_mask(&ctx.hsv);
    if let Some(quad) = peak_scan(&colors, 60.0, scoring).and_then(&settle) {
        debug!("border found in colour mask");
        return Some(Candidate::quad(quad));
    }

    for (fy, fx, row_fraction, col_fraction) in PROFILE_PASSES {
        let zone = Region::fractional(fx, fy, w, h);
        let Some((left, top, right, bottom)) = profile_scan(&colors, zone, row_fraction, col_fraction)
        else {
            continue;
        };
        let (tw, th) = (right - left, bottom - top);
        let plausible = tw >= 40.0
            && th >= 20.0
            && (1.4..=5.0).contains(&(tw / th))
            && tw <= 0.5 * w as f32
            && th <= 0.4 * h as f32;
        let quad = CornerQuad::from_bounds(left, top, right, bottom);
        if plausible && validator.validate(&quad, w, h) {
            debug!(row_fraction, "border found by zone profile");
            return Some(Candidate::quad(quad));
        }
    }

    let zone = Region::fractional((0.15, 0.85), (0.20, 0.75), w, h);
    let detector = SegmentDetector::new(&edges, zone)?;
    let side = w.min(h) as f32;
    let passes = [
        (30, (side / 12.0).max(30.0), (side / 15.0).max(40.0)),
        (20, (side / 18.0).max(20.0), (side / 10.0).max(60.0)),
        (12, (side / 30.0).max(10.0), (side / 6.0).max(80.0)),
    ];
    passes.into_iter().find_map(|(votes, min_length, max_gap)| {
        let segments = detector.segments(votes, min_length, max_gap);
        median_split_corners(&segments)
            .filter(|q| validator.validate(q, w, h))
            .map(Candidate::quad)
    })
}

// ── Rectangle search ──────────────────────────────────────────────────────────

/// Near-rectangular convex quadrilaterals over per-channel binarisations;
/// the largest valid one wins.
pub fn rectangles(ctx: &FrameContext, validator: &GeometryValidator) -> Option<Candidate> {
    let (w, h) = (ctx.width(), ctx.height());
    let small = imageops::resize(&ctx.rgb, (w / 2).max(1), (h / 2).max(1), FilterType::Triangle);
    let blurred = imageops::resize(&small, w, h, FilterType::Triangle);
    let channels: Vec<GrayImage> = (0..3)
        .map(|c| GrayImage::from_fn(w, h, |x, y| Luma([blurred.get_pixel(x, y).0[c]])))
        .collect();

    let max_area = 0.5 * w as f32 * h as f32;
    let jobs: Vec<(usize, u32)> = (0..3)
        .flat_map(|c| (0..RECT_LEVELS).map(move |level| (c, level)))
        .collect();
    let found: Vec<(f32, CornerQuad)> = jobs
        .par_iter()
        .filter_map(|&(c, level)| {
            let binary = if level == 0 {
                morphology::dilate(&canny(&channels[c], 0.0, 50.0), Norm::LInf, 1)
            } else {
                threshold(&channels[c], rect_threshold(level))
            };
            largest_rectangle(&binary, validator, max_area)
        })
        .collect();

    found
        .into_iter()
        .fold(None, |best: Option<(f32, CornerQuad)>, cur| match best {
            Some(b) if b.0 >= cur.0 => Some(b),
            _ => Some(cur),
        })
        .map(|(_, quad)| Candidate::quad(quad))
}

/// Intensity cut for binarisation `level` (1-based; level 0 is the edge map).
fn rect_threshold(level: u32) -> u8 {
    (level * 255 / RECT_LEVELS) as u8
}

fn largest_rectangle(
    binary: &GrayImage,
    validator: &GeometryValidator,
    max_area: f32,
) -> Option<(f32, CornerQuad)> {
    let (w, h) = binary.dimensions();
    let mut best: Option<(f32, CornerQuad)> = None;
    for contour in find_contours::<i32>(binary) {
        if contour.points.len() < 4 {
            continue;
        }
        let Some(corners) = fit_quad(&contour.points, 0.02) else {
            continue;
        };
        let area = polygon_area(&corners);
        if !(RECT_MIN_AREA..=max_area).contains(&area)
            || !is_convex(&corners)
            || max_corner_cosine(&corners) >= RECT_MAX_COSINE
        {
            continue;
        }
        let quad = CornerQuad::from_unordered(corners);
        if validator.validate(&quad, w, h) && best.map_or(true, |b| area > b.0) {
            best = Some((area, quad));
        }
    }
    best
}

// ── Clustered lines ───────────────────────────────────────────────────────────

/// Brightest colour cluster, thinned to its line-like parts, then segment
/// intersections.
pub fn clustered_lines(ctx: &FrameContext, validator: &GeometryValidator) -> Option<Candidate> {
    let (w, h) = (ctx.width(), ctx.height());
    let blurred = gaussian_blur_f32(&ctx.rgb, 2.6);
    let bright = brightest_cluster_mask(&blurred, KMEANS_CLUSTERS, KMEANS_ITERATIONS)?;

    let blobs = morphology::open(&bright, Norm::L2, 7);
    let lines_only = subtract(&bright, &blobs);
    let radius = (w as f32 / 24.0).clamp(10.0, 50.0) as u8;
    let closed = morphology::close(&lines_only, Norm::L2, radius);
    let edges = union(&canny(&closed, 50.0, 150.0), &canny(&ctx.gray, 50.0, 200.0));

    intersect_extremes(&edges)
        .filter(|q| validator.validate(q, w, h))
        .or_else(|| intersect_extremes(&bright).filter(|q| validator.validate(q, w, h)))
        .map(Candidate::quad)
}

/// k-means over RGB with a deterministic brightness-quantile start; the
/// mask marks pixels whose nearest centre is the brightest one.
fn brightest_cluster_mask(image: &RgbImage, k: usize, iterations: usize) -> Option<GrayImage> {
    let pixels: Vec<[f32; 3]> = image
        .pixels()
        .map(|p| [p.0[0] as f32, p.0[1] as f32, p.0[2] as f32])
        .collect();
    let stride = (pixels.len() / KMEANS_SAMPLES).max(1);
    let mut sample: Vec<[f32; 3]> = pixels.iter().step_by(stride).copied().collect();
    if sample.len() < k {
        return None;
    }
    sample.sort_by(|a, b| brightness(a).total_cmp(&brightness(b)));
    let mut centers: Vec<[f32; 3]> = (0..k)
        .map(|i| sample[((i as f32 + 0.5) / k as f32 * sample.len() as f32) as usize])
        .collect();

    for _ in 0..iterations {
        let mut sums = vec![[0.0f32; 3]; k];
        let mut counts = vec![0usize; k];
        for p in &sample {
            let c = nearest_center(&centers, p);
            for (s, v) in sums[c].iter_mut().zip(p) {
                *s += v;
            }
            counts[c] += 1;
        }
        for ((center, sum), n) in centers.iter_mut().zip(&sums).zip(&counts) {
            if *n > 0 {
                *center = (*sum).map(|v| v / *n as f32);
            }
        }
    }

    let brightest = centers
        .iter()
        .enumerate()
        .max_by(|a, b| brightness(a.1).total_cmp(&brightness(b.1)))
        .map(|(i, _)| i)?;
    let data: Vec<u8> = pixels
        .par_iter()
        .map(|p| if nearest_center(&centers, p) == brightest { 255 } else { 0 })
        .collect();
    GrayImage::from_raw(image.width(), image.height(), data)
}

fn brightness(p: &[f32; 3]) -> f32 {
    p[0] + p[1] + p[2]
}

fn nearest_center(centers: &[[f32; 3]], p: &[f32; 3]) -> usize {
    let dist = |c: &[f32; 3]| {
        c.iter()
            .zip(p)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
    };
    centers
        .iter()
        .enumerate()
        .min_by(|a, b| dist(a.1).total_cmp(&dist(b.1)))
        .map_or(0, |(i, _)| i)
}

// ── Raw edges ─────────────────────────────────────────────────────────────────

pub fn raw_edges(ctx: &FrameContext, validator: &GeometryValidator) -> Option<Candidate> {
    let (w, h) = (ctx.width(), ctx.height());
    let edges = canny(&ctx.gray, 50.0, 200.0);
    intersect_extremes(&edges)
        .filter(|q| validator.validate(q, w, h))
        .map(Candidate::quad)
}

/// Full-frame segments at loosening thresholds, then outermost corner
/// intersections.
fn intersect_extremes(mask: &GrayImage) -> Option<CornerQuad> {
    let (w, h) = mask.dimensions();
    let detector = SegmentDetector::new(mask, Region::full(w, h))?;
    let wf = w as f32;
    let params = [
        (50, (wf / 6.0).max(80.0), 100.0),
        (30, (wf / 10.0).max(40.0), 150.0),
        (20, 30.0, 200.0),
    ];
    let segments = first_sufficient(&detector, &params, 4);
    if segments.len() < 4 {
        return None;
    }
    extreme_corners(&segments, w, h)
}

// ── Surface contour ───────────────────────────────────────────────────────────

/// Quadrilateral (or minimum-area box) around the largest saturated
/// surface blobs.
pub fn surface_contour(ctx: &FrameContext, validator: &GeometryValidator) -> Option<Candidate> {
    let (w, h) = (ctx.width(), ctx.height());
    let locator = SurfaceColorLocator {
        ranges: vec![CONTOUR_BLUE, CONTOUR_GREEN],
        zone_x: (0.20, 0.80),
        zone_y: (0.20, 0.70),
        close_radius: 9,
        open_radius: 6,
        min_area_fraction: 0.03,
        centroid_x: (0.0, 1.0),
        centroid_y: (0.0, 1.0),
    };
    locator.blobs(&ctx.hsv).into_iter().take(3).find_map(|blob| {
        let corners = fit_quad(&blob.contour.points, 0.02).or_else(|| min_rect(&blob.contour.points))?;
        let quad = CornerQuad::from_unordered(corners);
        validator.validate(&quad, w, h).then_some(Candidate::quad(quad))
    })
}

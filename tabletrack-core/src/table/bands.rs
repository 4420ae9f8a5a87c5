//! Line bands: clusters of co-linear segments or dense mask rows, and the
//! heuristics that pair them into table edges.

use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::frame::Region;
use crate::geometry::{CornerQuad, Line, Point, Segment};
use crate::homography::TABLE_ASPECT;

use super::masks::{column_counts, row_counts};

/// Largest column gap bridged when measuring a band's horizontal extent.
const EXTENT_MAX_GAP: usize = 30;

// ── Bands from segments ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Horizontal,
    Vertical,
}

impl Orientation {
    /// Coordinate across the band (y for horizontal bands).
    fn across(self, p: Point) -> f32 {
        match self {
            Orientation::Horizontal => p.y,
            Orientation::Vertical => p.x,
        }
    }

    /// Coordinate along the band.
    fn along(self, p: Point) -> f32 {
        match self {
            Orientation::Horizontal => p.x,
            Orientation::Vertical => p.y,
        }
    }
}

/// A cluster of co-linear edge evidence.
#[derive(Debug, Clone, PartialEq)]
pub struct LineBand {
    pub orientation: Orientation,
    /// Position across the band (row for horizontal bands).
    pub center: f32,
    /// Peak density, or summed segment length for segment bands.
    pub strength: f32,
    /// Extent along the band.
    pub start: f32,
    pub end: f32,
    pub thickness: f32,
    pub segments: Vec<Segment>,
}

impl LineBand {
    pub fn span(&self) -> f32 {
        self.end - self.start
    }

    pub fn longest(&self) -> Option<&Segment> {
        self.segments
            .iter()
            .max_by(|a, b| a.length().total_cmp(&b.length()))
    }

    /// Line through the longest segment, or the axis line at `center`.
    pub fn line(&self) -> Line {
        self.longest()
            .and_then(Segment::line)
            .unwrap_or(match self.orientation {
                Orientation::Horizontal => Line::horizontal(self.center),
                Orientation::Vertical => Line::vertical(self.center),
            })
    }
}

/// Split segments into near-horizontal (`< horizontal_max` degrees) and
/// near-vertical (`> vertical_min`) sets; everything in between is dropped.
pub fn classify(
    segments: &[Segment],
    horizontal_max: f32,
    vertical_min: f32,
) -> (Vec<Segment>, Vec<Segment>) {
    let mut horizontal = Vec::new();
    let mut vertical = Vec::new();
    for s in segments {
        let angle = s.angle_deg();
        if angle < horizontal_max {
            horizontal.push(*s);
        } else if angle > vertical_min {
            vertical.push(*s);
        }
    }
    (horizontal, vertical)
}

/// Greedy position clustering: segments are visited in order of their
/// midpoint and join the current band while within `merge_distance` of its
/// running mean.
pub fn group_segments(
    segments: &[Segment],
    orientation: Orientation,
    merge_distance: f32,
) -> Vec<LineBand> {
    let mut sorted = segments.to_vec();
    sorted.sort_by(|a, b| {
        orientation
            .across(a.midpoint())
            .total_cmp(&orientation.across(b.midpoint()))
    });

    let mut groups: Vec<Vec<Segment>> = Vec::new();
    let mut mean = 0.0f32;
    for s in sorted {
        let pos = orientation.across(s.midpoint());
        match groups.last_mut() {
            Some(group) if (pos - mean).abs() < merge_distance => {
                group.push(s);
                mean += (pos - mean) / group.len() as f32;
            }
            _ => {
                groups.push(vec![s]);
                mean = pos;
            }
        }
    }

    groups
        .into_iter()
        .map(|segments| band_from_segments(orientation, segments))
        .collect()
}

fn band_from_segments(orientation: Orientation, segments: Vec<Segment>) -> LineBand {
    let n = segments.len() as f32;
    let center = segments
        .iter()
        .map(|s| orientation.across(s.midpoint()))
        .sum::<f32>()
        / n;
    let (mut start, mut end) = (f32::MAX, f32::MIN);
    let (mut lo, mut hi) = (f32::MAX, f32::MIN);
    for s in &segments {
        for p in [s.a, s.b] {
            start = start.min(orientation.along(p));
            end = end.max(orientation.along(p));
            lo = lo.min(orientation.across(p));
            hi = hi.max(orientation.across(p));
        }
    }
    LineBand {
        orientation,
        center,
        strength: segments.iter().map(Segment::length).sum(),
        start,
        end,
        thickness: hi - lo,
        segments,
    }
}

/// The band nearest `target` whose center satisfies `accept`.
pub fn nearest_band<'a>(
    bands: &'a [LineBand],
    target: f32,
    accept: impl Fn(&LineBand) -> bool,
) -> Option<&'a LineBand> {
    bands
        .iter()
        .filter(|b| accept(b))
        .min_by(|a, b| {
            (a.center - target)
                .abs()
                .total_cmp(&(b.center - target).abs())
        })
}

// ── Bands from density profiles ───────────────────────────────────────────────

/// 5-tap box filter, zero-padded, same length as the input.
pub fn smooth5(values: &[u32]) -> Vec<f32> {
    let n = values.len() as isize;
    (0..n)
        .map(|i| {
            let sum: u32 = (i - 2..=i + 2)
                .filter(|j| (0..n).contains(j))
                .map(|j| values[j as usize])
                .sum();
            sum as f32 / 5.0
        })
        .collect()
}

/// Longest run of columns holding at least `min_px` foreground pixels,
/// bridging gaps of up to `max_gap` columns.
pub fn dense_extent(counts: &[u32], min_px: u32, max_gap: usize) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    let mut current: Option<(usize, usize)> = None;
    for (x, &c) in counts.iter().enumerate() {
        if c < min_px {
            continue;
        }
        current = match current {
            Some((s, e)) if x - e <= max_gap + 1 => Some((s, x)),
            Some(run) => {
                best = longer(best, run);
                Some((x, x))
            }
            None => Some((x, x)),
        };
    }
    match current {
        Some(run) => longer(best, run),
        None => best,
    }
}

fn longer(best: Option<(usize, usize)>, run: (usize, usize)) -> Option<(usize, usize)> {
    match best {
        Some((s, e)) if e - s >= run.1 - run.0 => Some((s, e)),
        _ => Some(run),
    }
}

/// Horizontal bands: runs of rows whose smoothed density reaches
/// `threshold`, each measured for its dense column extent.
pub fn find_bands(mask: &GrayImage, smoothed: &[f32], threshold: f32) -> Vec<LineBand> {
    let mut bands = Vec::new();
    let mut y = 0;
    while y < smoothed.len() {
        if smoothed[y] < threshold {
            y += 1;
            continue;
        }
        let start = y;
        while y < smoothed.len() && smoothed[y] >= threshold {
            y += 1;
        }
        let end = y;

        let (peak_row, peak) = (start..end)
            .map(|r| (r, smoothed[r]))
            .fold((start, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        let thickness = (end - start) as u32;
        let counts = column_counts(mask, start as u32, end as u32);
        let min_px = (thickness / 3).max(2);
        if let Some((xl, xr)) = dense_extent(&counts, min_px, EXTENT_MAX_GAP) {
            bands.push(LineBand {
                orientation: Orientation::Horizontal,
                center: peak_row as f32,
                strength: peak,
                start: xl as f32,
                end: xr as f32,
                thickness: thickness as f32,
                segments: Vec::new(),
            });
        }
    }
    bands
}

// ── Band pairing ──────────────────────────────────────────────────────────────

/// Weights for scoring a top/bottom band pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairScoring {
    pub span_similarity: f32,
    pub overlap: f32,
    pub position: f32,
    pub strength: f32,
    /// Closeness of the implied aspect to the real table; off by default.
    pub aspect: f32,
}

impl Default for PairScoring {
    fn default() -> Self {
        Self {
            span_similarity: 0.35,
            overlap: 0.25,
            position: 0.20,
            strength: 0.20,
            aspect: 0.0,
        }
    }
}

/// Top/bottom edge rows and the left/right columns they imply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandPair {
    pub top: f32,
    pub bottom: f32,
    pub left: f32,
    pub right: f32,
    pub score: f32,
}

impl BandPair {
    pub fn quad(&self) -> CornerQuad {
        CornerQuad::from_bounds(self.left, self.top, self.right, self.bottom)
    }
}

/// Best-scoring pair of horizontal bands that could be the near and far
/// table edges. Pairs spanning most of the frame (arena decoration) fail
/// the size caps; mismatched spans lose on similarity and overlap.
pub fn best_band_pair(
    bands: &[LineBand],
    frame_width: u32,
    frame_height: u32,
    row_max: f32,
    scoring: &PairScoring,
) -> Option<BandPair> {
    let (fw, fh) = (frame_width as f32, frame_height as f32);
    let mut best: Option<BandPair> = None;
    for (i, a) in bands.iter().enumerate() {
        for b in &bands[i + 1..] {
            let (top, bot) = if a.center <= b.center { (a, b) } else { (b, a) };
            let th = bot.center - top.center;
            if th < 20.0 {
                continue;
            }
            let left = top.start.min(bot.start);
            let right = top.end.max(bot.end);
            let tw = right - left;
            let aspect = tw / th;
            if tw < 30.0
                || th < 15.0
                || !(1.4..=5.0).contains(&aspect)
                || tw > 0.5 * fw
                || th > 0.4 * fh
            {
                continue;
            }

            let (span_t, span_b) = (top.span(), bot.span());
            let span_sim = span_t.min(span_b) / (span_t.max(span_b) + 1.0);
            let overlap = (top.end.min(bot.end) - top.start.max(bot.start)).max(0.0);
            let overlap_ratio = overlap / (span_t.max(span_b) + 1.0);
            let cy = (top.center + bot.center) / 2.0;
            let position = (1.0 - (cy - 0.45 * fh).abs() / (0.5 * fh)).max(0.0);
            let strength = (top.strength + bot.strength) / (2.0 * row_max + 1.0);
            let aspect_fit = 1.0 - ((aspect - TABLE_ASPECT).abs() / TABLE_ASPECT).min(1.0);

            let score = scoring.span_similarity * span_sim
                + scoring.overlap * overlap_ratio
                + scoring.position * position
                + scoring.strength * strength
                + scoring.aspect * aspect_fit;
            if best.map_or(true, |p| score > p.score) {
                best = Some(BandPair {
                    top: top.center,
                    bottom: bot.center,
                    left,
                    right,
                    score,
                });
            }
        }
    }
    best
}

/// Scan row-density peaks of `mask` at descending thresholds and return
/// the first plausible band pair.
///
/// Lower thresholds widen the bands; higher ones split bands that were
/// merged through connecting border pixels.
pub fn peak_scan(mask: &GrayImage, min_height: f32, scoring: &PairScoring) -> Option<BandPair> {
    let smoothed = smooth5(&row_counts(mask));
    let row_max = smoothed.iter().copied().fold(0.0f32, f32::max);
    if row_max < min_height {
        return None;
    }

    let mut thresholds: Vec<f32> = [0.7, 0.5, 0.3, 0.2]
        .iter()
        .map(|f| f * row_max)
        .filter(|t| *t >= min_height)
        .collect();
    thresholds.push(min_height);
    thresholds.sort_by(|a, b| b.total_cmp(a));
    thresholds.dedup();

    thresholds.into_iter().find_map(|t| {
        let bands = find_bands(mask, &smoothed, t);
        best_band_pair(&bands, mask.width(), mask.height(), row_max, scoring)
    })
}

/// Bounds of the dense mask area inside `zone`: first and last rows with at
/// least `row_fraction` of the zone width set, then first and last columns
/// between them with at least `col_fraction` of the zone height set.
pub fn profile_scan(
    mask: &GrayImage,
    zone: Region,
    row_fraction: f32,
    col_fraction: f32,
) -> Option<(f32, f32, f32, f32)> {
    if zone.is_empty() {
        return None;
    }
    let min_row = (zone.width() as f32 * row_fraction).max(5.0);
    let rows: Vec<u32> = (zone.y0..zone.y1)
        .filter(|&y| {
            let n = (zone.x0..zone.x1)
                .filter(|&x| mask.get_pixel(x, y).0[0] > 0)
                .count();
            n as f32 >= min_row
        })
        .collect();
    let (&top, &bot) = (rows.first()?, rows.last()?);

    let min_col = (zone.height() as f32 * col_fraction).max(3.0);
    let counts = column_counts(mask, top, bot + 1);
    let cols: Vec<u32> = (zone.x0..zone.x1)
        .filter(|&x| counts[x as usize] as f32 >= min_col)
        .collect();
    let (&left, &right) = (cols.first()?, cols.last()?);

    Some((left as f32, top as f32, right as f32, bot as f32))
}

// ── Corners from generic segments ─────────────────────────────────────────────

/// Split near-horizontal segments at their median y and near-vertical ones
/// at their median x, then intersect the longest segment of each group.
pub fn median_split_corners(segments: &[Segment]) -> Option<CornerQuad> {
    let (horizontal, vertical) = classify(segments, 25.0, 65.0);
    let (top, bottom) = median_split(&horizontal, |s| s.midpoint().y)?;
    let (left, right) = median_split(&vertical, |s| s.midpoint().x)?;
    intersect_edges(top, right, bottom, left)
}

fn median_split(segments: &[Segment], key: impl Fn(&Segment) -> f32) -> Option<(Segment, Segment)> {
    if segments.len() < 2 {
        return None;
    }
    let mut keys: Vec<f32> = segments.iter().map(&key).collect();
    keys.sort_by(f32::total_cmp);
    let median = keys[keys.len() / 2];
    let longest = |pick: &dyn Fn(f32) -> bool| {
        segments
            .iter()
            .filter(|s| pick(key(*s)))
            .max_by(|a, b| a.length().total_cmp(&b.length()))
            .copied()
    };
    Some((longest(&|k| k < median)?, longest(&|k| k >= median)?))
}

fn intersect_edges(top: Segment, right: Segment, bottom: Segment, left: Segment) -> Option<CornerQuad> {
    let (t, r, b, l) = (top.line()?, right.line()?, bottom.line()?, left.line()?);
    Some(CornerQuad::new([
        t.intersect(&l)?,
        t.intersect(&r)?,
        b.intersect(&r)?,
        b.intersect(&l)?,
    ]))
}

/// Group segments by which side of the frame center they lie on, then take
/// for each corner the in-frame intersection farthest from the center.
///
/// A strict pass (tight angles, both endpoints on one side) runs first; a
/// looser midpoint pass is used when any side comes up empty.
pub fn extreme_corners(segments: &[Segment], width: u32, height: u32) -> Option<CornerQuad> {
    let center = Point::new(width as f32 / 2.0, height as f32 / 2.0);
    let sides = side_groups(segments, center, 15.0, 75.0, true)
        .or_else(|| side_groups(segments, center, 25.0, 65.0, false))?;
    let [top, right, bottom, left] = &sides;

    let corner = |h: &[Segment], v: &[Segment]| -> Option<Point> {
        let mut best: Option<Point> = None;
        for hs in h {
            for vs in v {
                let Some(p) = hs.line().zip(vs.line()).and_then(|(a, b)| a.intersect(&b)) else {
                    continue;
                };
                let inside = (0.0..width as f32).contains(&p.x) && (0.0..height as f32).contains(&p.y);
                if inside && best.map_or(true, |q| p.distance(center) > q.distance(center)) {
                    best = Some(p);
                }
            }
        }
        best
    };

    Some(CornerQuad::new([
        corner(top, left)?,
        corner(top, right)?,
        corner(bottom, right)?,
        corner(bottom, left)?,
    ]))
}

/// `[top, right, bottom, left]` segment groups, or `None` if any is empty.
fn side_groups(
    segments: &[Segment],
    center: Point,
    horizontal_max: f32,
    vertical_min: f32,
    strict: bool,
) -> Option<[Vec<Segment>; 4]> {
    let (horizontal, vertical) = classify(segments, horizontal_max, vertical_min);
    let mut groups: [Vec<Segment>; 4] = Default::default();
    for s in horizontal {
        let (lo, hi) = if strict {
            (s.a.y.max(s.b.y), s.a.y.min(s.b.y))
        } else {
            (s.midpoint().y, s.midpoint().y)
        };
        if lo < center.y {
            groups[0].push(s);
        } else if hi > center.y {
            groups[2].push(s);
        }
    }
    for s in vertical {
        let (lo, hi) = if strict {
            (s.a.x.max(s.b.x), s.a.x.min(s.b.x))
        } else {
            (s.midpoint().x, s.midpoint().x)
        };
        if lo < center.x {
            groups[3].push(s);
        } else if hi > center.x {
            groups[1].push(s);
        }
    }
    groups.iter().all(|g| !g.is_empty()).then_some(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn seg(ax: f32, ay: f32, bx: f32, by: f32) -> Segment {
        Segment::new(Point::new(ax, ay), Point::new(bx, by))
    }

    #[test]
    fn classify_drops_diagonals() {
        let segs = [
            seg(0.0, 0.0, 100.0, 10.0),
            seg(0.0, 0.0, 100.0, 100.0),
            seg(0.0, 0.0, 5.0, 100.0),
        ];
        let (h, v) = classify(&segs, 25.0, 55.0);
        assert_eq!(h.len(), 1);
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn grouping_merges_close_rows() {
        let segs = [
            seg(10.0, 100.0, 200.0, 100.0),
            seg(50.0, 104.0, 300.0, 104.0),
            seg(10.0, 180.0, 200.0, 181.0),
        ];
        let bands = group_segments(&segs, Orientation::Horizontal, 10.0);
        assert_eq!(bands.len(), 2);
        assert!((bands[0].center - 102.0).abs() < 1e-3);
        assert_eq!(bands[0].start, 10.0);
        assert_eq!(bands[0].end, 300.0);
        assert_eq!(bands[0].longest().unwrap().length(), 250.0);
    }

    #[test]
    fn smoothing_is_zero_padded() {
        assert_eq!(smooth5(&[5, 5, 5]), vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn extent_bridges_small_gaps_only() {
        let mut counts = vec![0u32; 200];
        counts[10..40].iter_mut().for_each(|c| *c = 3);
        counts[50..60].iter_mut().for_each(|c| *c = 3);
        counts[120..130].iter_mut().for_each(|c| *c = 3);
        assert_eq!(dense_extent(&counts, 2, 30), Some((10, 59)));
        assert_eq!(dense_extent(&counts, 4, 30), None);
    }

    #[test]
    fn peak_scan_prefers_matched_table_borders() {
        let mut mask = GrayImage::new(640, 360);
        let white = Luma([255u8]);
        // Full-width arena stripe.
        draw_filled_rect_mut(&mut mask, Rect::at(0, 40).of_size(640, 6), white);
        // Table borders.
        draw_filled_rect_mut(&mut mask, Rect::at(200, 150).of_size(240, 4), white);
        draw_filled_rect_mut(&mut mask, Rect::at(200, 250).of_size(240, 4), white);

        let pair = peak_scan(&mask, 60.0, &PairScoring::default()).expect("pair");
        assert!((pair.top - 151.5).abs() <= 2.0, "top {}", pair.top);
        assert!((pair.bottom - 251.5).abs() <= 2.0, "bottom {}", pair.bottom);
        assert!((pair.left - 200.0).abs() <= 1.0);
        assert!((pair.right - 439.0).abs() <= 1.0);
    }

    #[test]
    fn profile_scan_bounds_dense_block() {
        let mut mask = GrayImage::new(400, 300);
        draw_filled_rect_mut(&mut mask, Rect::at(120, 100).of_size(160, 80), Luma([255u8]));
        let zone = Region::full(400, 300);
        let (l, t, r, b) = profile_scan(&mask, zone, 0.10, 0.04).unwrap();
        assert_eq!((l, t, r, b), (120.0, 100.0, 279.0, 179.0));
    }

    #[test]
    fn median_split_intersects_longest_edges() {
        let segs = [
            seg(100.0, 100.0, 300.0, 100.0),
            seg(100.0, 200.0, 300.0, 200.0),
            seg(100.0, 90.0, 100.0, 210.0),
            seg(300.0, 90.0, 300.0, 210.0),
        ];
        let quad = median_split_corners(&segs).unwrap();
        assert_eq!(quad.top_left(), Point::new(100.0, 100.0));
        assert_eq!(quad.bottom_right(), Point::new(300.0, 200.0));
    }

    #[test]
    fn extreme_corners_pick_outermost_intersections() {
        let segs = [
            seg(100.0, 100.0, 300.0, 100.0),
            seg(120.0, 120.0, 280.0, 120.0),
            seg(100.0, 200.0, 300.0, 200.0),
            seg(100.0, 90.0, 100.0, 210.0),
            seg(300.0, 90.0, 300.0, 210.0),
        ];
        let quad = extreme_corners(&segs, 400, 300).unwrap();
        assert_eq!(quad.top_left(), Point::new(100.0, 100.0));
        assert_eq!(quad.top_right(), Point::new(300.0, 100.0));
    }
}

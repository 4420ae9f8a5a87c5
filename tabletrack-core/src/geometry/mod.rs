//! geometry — points, segments, lines and the table corner quadrilateral
//!
//! All coordinates are image pixels with the origin at the top-left and `y`
//! growing downward.  "Above the net" therefore means a *smaller* `y`.

use serde::{Deserialize, Serialize};

/// Determinant magnitude below which two lines are treated as parallel.
const PARALLEL_EPS: f32 = 1e-6;

// ── Point ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn lerp(&self, other: Point, t: f32) -> Point {
        Point::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
        )
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f32, f32)> for Point {
    fn from((x, y): (f32, f32)) -> Self {
        Point::new(x, y)
    }
}

// ── Segment ───────────────────────────────────────────────────────────────────

/// A finite line segment, typically measured from a Hough line over a mask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub a: Point,
    pub b: Point,
}

impl Segment {
    pub const fn new(a: Point, b: Point) -> Self {
        Self { a, b }
    }

    pub fn length(&self) -> f32 {
        self.a.distance(self.b)
    }

    /// Unsigned angle to the horizontal axis, in degrees (0 = horizontal,
    /// 90 = vertical).
    pub fn angle_deg(&self) -> f32 {
        let dx = (self.b.x - self.a.x).abs();
        let dy = (self.b.y - self.a.y).abs();
        dy.atan2(dx).to_degrees()
    }

    pub fn midpoint(&self) -> Point {
        self.a.lerp(self.b, 0.5)
    }

    pub fn line(&self) -> Option<Line> {
        Line::through(self.a, self.b)
    }

    pub fn translated(&self, dx: f32, dy: f32) -> Segment {
        Segment::new(
            Point::new(self.a.x + dx, self.a.y + dy),
            Point::new(self.b.x + dx, self.b.y + dy),
        )
    }
}

// ── Line ──────────────────────────────────────────────────────────────────────

/// Infinite line in implicit form `a·x + b·y = c`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Line {
    pub a: f32,
    pub b: f32,
    pub c: f32,
}

impl Line {
    /// Line through two distinct points.
    pub fn through(p: Point, q: Point) -> Option<Line> {
        let a = q.y - p.y;
        let b = p.x - q.x;
        if a.abs() < PARALLEL_EPS && b.abs() < PARALLEL_EPS {
            return None;
        }
        Some(Line {
            a,
            b,
            c: a * p.x + b * p.y,
        })
    }

    pub fn horizontal(y: f32) -> Line {
        Line { a: 0.0, b: 1.0, c: y }
    }

    pub fn vertical(x: f32) -> Line {
        Line { a: 1.0, b: 0.0, c: x }
    }

    /// Intersection point, or `None` for (near-)parallel lines.
    pub fn intersect(&self, other: &Line) -> Option<Point> {
        let det = self.a * other.b - other.a * self.b;
        let scale = (self.a.hypot(self.b) * other.a.hypot(other.b)).max(f32::MIN_POSITIVE);
        if (det / scale).abs() < 1e-3 {
            return None;
        }
        let x = (self.c * other.b - other.c * self.b) / det;
        let y = (self.a * other.c - other.a * self.c) / det;
        let p = Point::new(x, y);
        p.is_finite().then_some(p)
    }
}

// ── Corner ordering ───────────────────────────────────────────────────────────

/// Order four points as top-left, top-right, bottom-right, bottom-left.
///
/// Top-left has the smallest `x + y`, bottom-right the largest; top-right has
/// the smallest `y - x`, bottom-left the largest.
pub fn order_corners(points: [Point; 4]) -> [Point; 4] {
    let by = |key: fn(&Point) -> f32, max: bool| {
        let mut best = points[0];
        for p in &points[1..] {
            let better = if max { key(p) > key(&best) } else { key(p) < key(&best) };
            if better {
                best = *p;
            }
        }
        best
    };
    let tl = by(|p| p.x + p.y, false);
    let br = by(|p| p.x + p.y, true);
    let tr = by(|p| p.y - p.x, false);
    let bl = by(|p| p.y - p.x, true);
    [tl, tr, br, bl]
}

/// Shoelace area of a simple polygon (absolute value).
pub fn polygon_area(points: &[Point]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0f32;
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        twice += p.x * q.y - q.x * p.y;
    }
    twice.abs() / 2.0
}

/// Even-odd ray casting test.
pub fn point_in_polygon(polygon: &[Point], p: Point) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (pi, pj) = (polygon[i], polygon[j]);
        if (pi.y > p.y) != (pj.y > p.y) {
            let x_cross = pj.x + (p.y - pj.y) * (pi.x - pj.x) / (pi.y - pj.y);
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

// ── CornerQuad ────────────────────────────────────────────────────────────────

/// The four playing-surface corners, ordered TL, TR, BR, BL.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerQuad {
    corners: [Point; 4],
}

impl CornerQuad {
    /// Build from corners already ordered TL, TR, BR, BL.
    pub fn new(corners: [Point; 4]) -> Self {
        Self { corners }
    }

    pub fn from_unordered(points: [Point; 4]) -> Self {
        Self::new(order_corners(points))
    }

    /// Axis-aligned quad from a bounding box.
    pub fn from_bounds(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new([
            Point::new(x1, y1),
            Point::new(x2, y1),
            Point::new(x2, y2),
            Point::new(x1, y2),
        ])
    }

    pub fn corners(&self) -> &[Point; 4] {
        &self.corners
    }

    pub fn top_left(&self) -> Point {
        self.corners[0]
    }
    pub fn top_right(&self) -> Point {
        self.corners[1]
    }
    pub fn bottom_right(&self) -> Point {
        self.corners[2]
    }
    pub fn bottom_left(&self) -> Point {
        self.corners[3]
    }

    /// `(x_min, y_min, x_max, y_max)` of the corners.
    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        let mut b = (f32::MAX, f32::MAX, f32::MIN, f32::MIN);
        for p in &self.corners {
            b.0 = b.0.min(p.x);
            b.1 = b.1.min(p.y);
            b.2 = b.2.max(p.x);
            b.3 = b.3.max(p.y);
        }
        b
    }

    /// Mean length of the top and bottom edges.
    pub fn width(&self) -> f32 {
        let [tl, tr, br, bl] = self.corners;
        (tl.distance(tr) + bl.distance(br)) / 2.0
    }

    /// Mean length of the left and right edges.
    pub fn height(&self) -> f32 {
        let [tl, tr, br, bl] = self.corners;
        (tl.distance(bl) + tr.distance(br)) / 2.0
    }

    /// Width over height; infinite for a flat quad.
    pub fn aspect(&self) -> f32 {
        let h = self.height();
        if h <= 0.0 {
            return f32::INFINITY;
        }
        self.width() / h
    }

    pub fn area(&self) -> f32 {
        polygon_area(&self.corners)
    }

    pub fn centroid(&self) -> Point {
        let sx: f32 = self.corners.iter().map(|p| p.x).sum();
        let sy: f32 = self.corners.iter().map(|p| p.y).sum();
        Point::new(sx / 4.0, sy / 4.0)
    }

    pub fn contains(&self, p: Point) -> bool {
        point_in_polygon(&self.corners, p)
    }

    pub fn is_finite(&self) -> bool {
        self.corners.iter().all(Point::is_finite)
    }

    /// Rescale every coordinate, e.g. to map corners from a downscaled frame
    /// back to source pixels.
    pub fn scaled(&self, sx: f32, sy: f32) -> CornerQuad {
        CornerQuad::new(self.corners.map(|p| Point::new(p.x * sx, p.y * sy)))
    }

    pub fn translated(&self, dx: f32, dy: f32) -> CornerQuad {
        CornerQuad::new(self.corners.map(|p| Point::new(p.x + dx, p.y + dy)))
    }

    /// Move every corner `fraction` of the way toward the centroid.
    pub fn shrink_towards_centroid(&self, fraction: f32) -> CornerQuad {
        let c = self.centroid();
        CornerQuad::new(self.corners.map(|p| p.lerp(c, fraction)))
    }

    /// Scale about the centroid independently along x and y.
    pub fn stretched(&self, fx: f32, fy: f32) -> CornerQuad {
        let c = self.centroid();
        CornerQuad::new(
            self.corners
                .map(|p| Point::new(c.x + (p.x - c.x) * fx, c.y + (p.y - c.y) * fy)),
        )
    }

    /// Points `t` of the way down the left and right edges.
    pub fn lerp_edges(&self, t: f32) -> (Point, Point) {
        (
            self.top_left().lerp(self.bottom_left(), t),
            self.top_right().lerp(self.bottom_right(), t),
        )
    }

    /// Top and bottom edge y at the given x, interpolated along each edge.
    pub fn vertical_span_at(&self, x: f32) -> (f32, f32) {
        let along = |p: Point, q: Point| {
            if (q.x - p.x).abs() < PARALLEL_EPS {
                return (p.y + q.y) / 2.0;
            }
            let t = ((x - p.x) / (q.x - p.x)).clamp(0.0, 1.0);
            p.y + (q.y - p.y) * t
        };
        (
            along(self.top_left(), self.top_right()),
            along(self.bottom_left(), self.bottom_right()),
        )
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Plausibility check for a table quadrilateral inside a frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryValidator {
    /// Minimum polygon area in pixels².
    pub min_area: f32,
    /// Minimum mean top/bottom edge length in pixels.
    pub min_width: f32,
    /// Minimum mean left/right edge length in pixels.
    pub min_height: f32,
    pub min_aspect: f32,
    pub max_aspect: f32,
    /// Width cap as a fraction of frame width.
    pub max_width_fraction: f32,
    /// Height cap as a fraction of frame height.
    pub max_height_fraction: f32,
}

impl Default for GeometryValidator {
    fn default() -> Self {
        Self {
            min_area: 2000.0,
            min_width: 40.0,
            min_height: 20.0,
            min_aspect: 1.3,
            max_aspect: 5.5,
            max_width_fraction: 0.5,
            max_height_fraction: 0.4,
        }
    }
}

impl GeometryValidator {
    pub fn validate(&self, quad: &CornerQuad, frame_width: u32, frame_height: u32) -> bool {
        if !quad.is_finite() {
            return false;
        }
        let (w, h) = (quad.width(), quad.height());
        let aspect = quad.aspect();
        quad.area() >= self.min_area
            && w >= self.min_width
            && h >= self.min_height
            && (self.min_aspect..=self.max_aspect).contains(&aspect)
            && w <= self.max_width_fraction * frame_width as f32
            && h <= self.max_height_fraction * frame_height as f32
    }

    /// Same bounds with a different aspect window.
    pub fn with_aspect(mut self, min_aspect: f32, max_aspect: f32) -> Self {
        self.min_aspect = min_aspect;
        self.max_aspect = max_aspect;
        self
    }
}

// ── Aspect policy ─────────────────────────────────────────────────────────────

/// What to do with a quad whose aspect strays from the expected table aspect.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AspectPolicy {
    /// Accept any aspect the validator accepts.
    #[default]
    Keep,
    /// Drop quads whose aspect deviates by more than `tolerance` (relative).
    Reject { expected: f32, tolerance: f32 },
    /// Refit the short axis about the centroid, then shrink by `shrink`.
    Refit {
        expected: f32,
        tolerance: f32,
        shrink: f32,
    },
}

impl AspectPolicy {
    pub fn apply(&self, quad: CornerQuad) -> Option<CornerQuad> {
        match *self {
            AspectPolicy::Keep => Some(quad),
            AspectPolicy::Reject {
                expected,
                tolerance,
            } => (relative_deviation(quad.aspect(), expected) <= tolerance).then_some(quad),
            AspectPolicy::Refit {
                expected,
                tolerance,
                shrink,
            } => {
                let aspect = quad.aspect();
                if !aspect.is_finite() || aspect <= 0.0 {
                    return None;
                }
                if relative_deviation(aspect, expected) <= tolerance {
                    return Some(quad);
                }
                let refit = if aspect > expected {
                    quad.stretched(1.0, aspect / expected)
                } else {
                    quad.stretched(expected / aspect, 1.0)
                };
                Some(refit.shrink_towards_centroid(shrink))
            }
        }
    }
}

fn relative_deviation(aspect: f32, expected: f32) -> f32 {
    (aspect / expected - 1.0).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn table_quad() -> CornerQuad {
        // A 300×120 trapezoid, roughly what a broadcast camera sees.
        CornerQuad::new([
            Point::new(190.0, 150.0),
            Point::new(450.0, 150.0),
            Point::new(470.0, 270.0),
            Point::new(170.0, 270.0),
        ])
    }

    #[test]
    fn orders_shuffled_corners() {
        let q = table_quad();
        let c = q.corners();
        let shuffled = [c[2], c[0], c[3], c[1]];
        assert_eq!(order_corners(shuffled), *c);
    }

    #[test]
    fn intersects_perpendicular_lines() {
        let h = Line::through(Point::new(0.0, 10.0), Point::new(100.0, 10.0)).unwrap();
        let v = Line::through(Point::new(40.0, 0.0), Point::new(40.0, 50.0)).unwrap();
        let p = h.intersect(&v).unwrap();
        assert_abs_diff_eq!(p.x, 40.0, epsilon = 1e-4);
        assert_abs_diff_eq!(p.y, 10.0, epsilon = 1e-4);
    }

    #[test]
    fn parallel_lines_do_not_intersect() {
        let a = Line::horizontal(10.0);
        let b = Line::horizontal(30.0);
        assert!(a.intersect(&b).is_none());
        assert!(Line::through(Point::new(1.0, 1.0), Point::new(1.0, 1.0)).is_none());
    }

    #[test]
    fn segment_angles() {
        let flat = Segment::new(Point::new(0.0, 0.0), Point::new(10.0, 0.0));
        let steep = Segment::new(Point::new(0.0, 10.0), Point::new(1.0, 0.0));
        assert_abs_diff_eq!(flat.angle_deg(), 0.0);
        assert!(steep.angle_deg() > 80.0);
    }

    #[test]
    fn quad_measurements() {
        let q = CornerQuad::from_bounds(10.0, 20.0, 110.0, 70.0);
        assert_abs_diff_eq!(q.area(), 5000.0);
        assert_abs_diff_eq!(q.aspect(), 2.0);
        assert!(q.contains(Point::new(50.0, 50.0)));
        assert!(!q.contains(Point::new(5.0, 50.0)));
        assert_eq!(q.centroid(), Point::new(60.0, 45.0));
    }

    #[test]
    fn validator_accepts_sane_table() {
        let v = GeometryValidator::default();
        assert!(v.validate(&table_quad(), 1280, 720));
    }

    #[test]
    fn validator_rejects_out_of_range_aspect() {
        let v = GeometryValidator::default();
        // Aspect 1.2 and 6.0, both with plenty of area.
        let narrow = CornerQuad::from_bounds(100.0, 100.0, 220.0, 200.0);
        let wide = CornerQuad::from_bounds(100.0, 100.0, 460.0, 160.0);
        assert!(!v.validate(&narrow, 1280, 720));
        assert!(!v.validate(&wide, 1280, 720));
    }

    #[test]
    fn validator_rejects_tiny_and_oversized() {
        let v = GeometryValidator::default();
        let tiny = CornerQuad::from_bounds(0.0, 0.0, 60.0, 25.0);
        assert!(!v.validate(&tiny, 1280, 720));
        // Wider than half the frame.
        let too_wide = CornerQuad::from_bounds(0.0, 0.0, 700.0, 200.0);
        assert!(!v.validate(&too_wide, 1280, 720));
        // Taller than 40% of the frame.
        let too_tall = CornerQuad::from_bounds(0.0, 0.0, 600.0, 300.0);
        assert!(!v.validate(&too_tall, 1280, 720));
    }

    #[test]
    fn validator_sweep_over_aspects() {
        let v = GeometryValidator::default();
        for tenths in 5..80 {
            let aspect = tenths as f32 / 10.0;
            let h = 100.0;
            let q = CornerQuad::from_bounds(0.0, 0.0, aspect * h, h);
            let expected = (1.3..=5.5).contains(&aspect);
            assert_eq!(v.validate(&q, 4000, 1000), expected, "aspect {aspect}");
        }
    }

    #[test]
    fn validator_rejects_non_finite() {
        let v = GeometryValidator::default();
        let mut c = *table_quad().corners();
        c[1].x = f32::NAN;
        assert!(!v.validate(&CornerQuad::new(c), 1280, 720));
    }

    #[test]
    fn refit_restores_expected_aspect() {
        let policy = AspectPolicy::Refit {
            expected: 2.0,
            tolerance: 0.1,
            shrink: 0.0,
        };
        let flat = CornerQuad::from_bounds(0.0, 0.0, 400.0, 100.0);
        let refit = policy.apply(flat).unwrap();
        assert_abs_diff_eq!(refit.aspect(), 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(refit.width(), 400.0, epsilon = 1e-3);
        assert_eq!(refit.centroid(), flat.centroid());
    }

    #[test]
    fn refit_shrinks_toward_centroid() {
        let policy = AspectPolicy::Refit {
            expected: 2.0,
            tolerance: 0.1,
            shrink: 0.05,
        };
        let tall = CornerQuad::from_bounds(0.0, 0.0, 150.0, 100.0);
        let refit = policy.apply(tall).unwrap();
        assert_abs_diff_eq!(refit.aspect(), 2.0, epsilon = 1e-4);
        assert_abs_diff_eq!(refit.height(), 95.0, epsilon = 1e-3);
    }

    #[test]
    fn reject_policy_drops_deviating_quads() {
        let policy = AspectPolicy::Reject {
            expected: 2.0,
            tolerance: 0.2,
        };
        assert!(policy
            .apply(CornerQuad::from_bounds(0.0, 0.0, 210.0, 100.0))
            .is_some());
        assert!(policy
            .apply(CornerQuad::from_bounds(0.0, 0.0, 400.0, 100.0))
            .is_none());
        assert!(AspectPolicy::Keep.apply(table_quad()).is_some());
    }
}

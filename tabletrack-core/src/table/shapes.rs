//! Polygon fitting on traced contours.

use imageproc::geometry::{approximate_polygon_dp, arc_length, min_area_rect};
use imageproc::point::Point as IpPoint;

use crate::geometry::Point;

pub fn to_point(p: IpPoint<i32>) -> Point {
    Point::new(p.x as f32, p.y as f32)
}

/// Douglas–Peucker over a closed contour.
///
/// The curve is cut at two mutually distant points so both halves are
/// simplified as open curves, then vertices that sit within `epsilon` of
/// the chord between their neighbours are dropped.
pub fn approximate_closed(points: &[IpPoint<i32>], epsilon: f64) -> Vec<IpPoint<i32>> {
    if points.len() < 4 || epsilon <= 0.0 {
        return points.to_vec();
    }
    let n = points.len();
    let a = farthest_from(points, points[0]);
    let b = farthest_from(points, points[a]);
    if a == b {
        return vec![points[a]];
    }

    let rotated: Vec<IpPoint<i32>> = points[a..].iter().chain(&points[..a]).copied().collect();
    let split = (b + n - a) % n;
    let mut out = approximate_polygon_dp(&rotated[..=split], epsilon, false);
    let mut tail = rotated[split..].to_vec();
    tail.push(rotated[0]);
    out.pop();
    out.extend(approximate_polygon_dp(&tail, epsilon, false));
    out.pop();
    drop_collinear(out, epsilon)
}

fn farthest_from(points: &[IpPoint<i32>], origin: IpPoint<i32>) -> usize {
    points
        .iter()
        .enumerate()
        .max_by_key(|(_, p)| {
            let (dx, dy) = ((p.x - origin.x) as i64, (p.y - origin.y) as i64);
            dx * dx + dy * dy
        })
        .map_or(0, |(i, _)| i)
}

fn drop_collinear(mut poly: Vec<IpPoint<i32>>, epsilon: f64) -> Vec<IpPoint<i32>> {
    loop {
        let n = poly.len();
        if n <= 3 {
            return poly;
        }
        let flat = (0..n).find(|&i| {
            let prev = to_point(poly[(i + n - 1) % n]);
            let next = to_point(poly[(i + 1) % n]);
            let p = to_point(poly[i]);
            let chord = prev.distance(next);
            if chord <= f32::EPSILON {
                return true;
            }
            let cross = (next.x - prev.x) * (p.y - prev.y) - (next.y - prev.y) * (p.x - prev.x);
            ((cross.abs() / chord) as f64) < epsilon
        });
        match flat {
            Some(i) => {
                poly.remove(i);
            }
            None => return poly,
        }
    }
}

/// Four-vertex approximation at `fraction` of the perimeter, if the contour
/// simplifies to exactly four corners.
pub fn fit_quad(points: &[IpPoint<i32>], fraction: f64) -> Option<[Point; 4]> {
    let epsilon = fraction * arc_length(points, true);
    let approx = approximate_closed(points, epsilon);
    match approx.as_slice() {
        &[a, b, c, d] => Some([to_point(a), to_point(b), to_point(c), to_point(d)]),
        _ => None,
    }
}

pub fn min_rect(points: &[IpPoint<i32>]) -> Option<[Point; 4]> {
    if points.is_empty() {
        return None;
    }
    Some(min_area_rect(points).map(to_point))
}

/// All turns in the same direction.
pub fn is_convex(poly: &[Point; 4]) -> bool {
    let mut sign = 0.0f32;
    for i in 0..4 {
        let (a, b, c) = (poly[i], poly[(i + 1) % 4], poly[(i + 2) % 4]);
        let cross = (b.x - a.x) * (c.y - b.y) - (b.y - a.y) * (c.x - b.x);
        if cross == 0.0 || (sign != 0.0 && cross.signum() != sign) {
            return false;
        }
        sign = cross.signum();
    }
    true
}

/// Largest |cos| over the four interior angles; 0 for a rectangle.
pub fn max_corner_cosine(poly: &[Point; 4]) -> f32 {
    (0..4)
        .map(|i| {
            let (prev, p, next) = (poly[(i + 3) % 4], poly[i], poly[(i + 1) % 4]);
            let (ux, uy) = (prev.x - p.x, prev.y - p.y);
            let (vx, vy) = (next.x - p.x, next.y - p.y);
            let norm = (ux.hypot(uy) * vx.hypot(vy)).max(f32::EPSILON);
            ((ux * vx + uy * vy) / norm).abs()
        })
        .fold(0.0, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect_contour(x0: i32, y0: i32, x1: i32, y1: i32) -> Vec<IpPoint<i32>> {
        let mut pts = Vec::new();
        pts.extend((x0..x1).map(|x| IpPoint::new(x, y0)));
        pts.extend((y0..y1).map(|y| IpPoint::new(x1, y)));
        pts.extend((x0 + 1..=x1).rev().map(|x| IpPoint::new(x, y1)));
        pts.extend((y0 + 1..=y1).rev().map(|y| IpPoint::new(x0, y)));
        pts
    }

    #[test]
    fn rectangle_contour_fits_four_corners() {
        let quad = fit_quad(&rect_contour(10, 20, 110, 70), 0.02).unwrap();
        let mut xs: Vec<f32> = quad.iter().map(|p| p.x).collect();
        xs.sort_by(f32::total_cmp);
        assert_eq!(xs, vec![10.0, 10.0, 110.0, 110.0]);
        assert!(is_convex(&quad));
        assert!(max_corner_cosine(&quad) < 0.05);
    }

    #[test]
    fn skewed_quad_has_large_cosine() {
        let quad = [
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(160.0, 50.0),
            Point::new(60.0, 50.0),
        ];
        assert!(is_convex(&quad));
        assert!(max_corner_cosine(&quad) > 0.6);
    }

    #[test]
    fn bow_tie_is_not_convex() {
        let quad = [
            Point::new(0.0, 0.0),
            Point::new(100.0, 50.0),
            Point::new(100.0, 0.0),
            Point::new(0.0, 50.0),
        ];
        assert!(!is_convex(&quad));
    }
}

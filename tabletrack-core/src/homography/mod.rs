//! homography — image pixels → canonical table coordinates
//!
//! The canonical frame is the regulation playing surface in centimetres:
//! `(0, 0)` at the far-left corner, `(TABLE_LENGTH_CM, TABLE_WIDTH_CM)` at the
//! near-right one.  The transform is solved by DLT with Hartley normalisation
//! over the four corner correspondences.

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};

use crate::geometry::{CornerQuad, Point};

/// Regulation table length (the long side, seen left-to-right from a
/// side-on broadcast camera).
pub const TABLE_LENGTH_CM: f32 = 274.0;
/// Regulation table width.
pub const TABLE_WIDTH_CM: f32 = 152.5;
/// Real-world aspect ratio of the playing surface.
pub const TABLE_ASPECT: f32 = TABLE_LENGTH_CM / TABLE_WIDTH_CM;

/// Below this `|w|` a projected point is at infinity.
const W_EPS: f64 = 1e-12;

/// A planar projective transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    h: Matrix3<f64>,
}

impl Homography {
    pub fn from_matrix(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.h
    }

    /// Map the quad TL/TR/BR/BL onto the canonical table rectangle.
    pub fn from_quad(quad: &CornerQuad) -> Option<Homography> {
        let canonical = [
            Point::new(0.0, 0.0),
            Point::new(TABLE_LENGTH_CM, 0.0),
            Point::new(TABLE_LENGTH_CM, TABLE_WIDTH_CM),
            Point::new(0.0, TABLE_WIDTH_CM),
        ];
        Self::from_correspondences(quad.corners(), &canonical)
    }

    /// Least-squares DLT over ≥4 correspondences (`dst ≈ H·src`).
    ///
    /// Returns `None` for degenerate input (collinear points, mismatched
    /// lengths, non-finite coordinates).
    pub fn from_correspondences(src: &[Point], dst: &[Point]) -> Option<Homography> {
        let n = src.len();
        if n < 4 || dst.len() != n {
            return None;
        }
        if src.iter().chain(dst).any(|p| !p.is_finite()) {
            return None;
        }
        if n == 4 && (has_collinear_triple(src) || has_collinear_triple(dst)) {
            return None;
        }

        let (t_src, src_n) = normalize(src)?;
        let (t_dst, dst_n) = normalize(dst)?;

        let mut a = DMatrix::<f64>::zeros(2 * n, 9);
        for i in 0..n {
            let (sx, sy) = src_n[i];
            let (dx, dy) = dst_n[i];

            a[(2 * i, 3)] = -sx;
            a[(2 * i, 4)] = -sy;
            a[(2 * i, 5)] = -1.0;
            a[(2 * i, 6)] = dy * sx;
            a[(2 * i, 7)] = dy * sy;
            a[(2 * i, 8)] = dy;

            a[(2 * i + 1, 0)] = sx;
            a[(2 * i + 1, 1)] = sy;
            a[(2 * i + 1, 2)] = 1.0;
            a[(2 * i + 1, 6)] = -dx * sx;
            a[(2 * i + 1, 7)] = -dx * sy;
            a[(2 * i + 1, 8)] = -dx;
        }

        // Null vector of A = eigenvector of AᵀA with the smallest eigenvalue.
        let eig = SymmetricEigen::new(a.transpose() * &a);
        let (min_idx, _) = eig
            .eigenvalues
            .iter()
            .enumerate()
            .min_by(|(_, x), (_, y)| x.abs().total_cmp(&y.abs()))?;
        let v = eig.eigenvectors.column(min_idx);
        let h_norm = Matrix3::new(v[0], v[1], v[2], v[3], v[4], v[5], v[6], v[7], v[8]);

        let h = t_dst.try_inverse()? * h_norm * t_src;
        let scale = h[(2, 2)];
        if scale.abs() < W_EPS {
            return None;
        }
        let h = h / scale;

        // A rank-deficient solve (collinear corners) cannot be inverted.
        if h.determinant().abs() < 1e-12 || !h.iter().all(|x| x.is_finite()) {
            return None;
        }
        Some(Homography { h })
    }

    /// Project a point; `None` when it maps to infinity.
    pub fn project(&self, p: Point) -> Option<Point> {
        let q = self.h * Vector3::new(p.x as f64, p.y as f64, 1.0);
        if q[2].abs() < W_EPS {
            return None;
        }
        let out = Point::new((q[0] / q[2]) as f32, (q[1] / q[2]) as f32);
        out.is_finite().then_some(out)
    }

    pub fn inverse(&self) -> Option<Homography> {
        self.h.try_inverse().map(|h| Homography { h })
    }
}

/// Four points admit a unique homography only when no three are collinear.
fn has_collinear_triple(points: &[Point]) -> bool {
    let scale = points
        .iter()
        .flat_map(|p| [p.x.abs(), p.y.abs()])
        .fold(1.0f32, f32::max);
    let eps = 1e-6 * scale * scale;
    for i in 0..points.len() {
        for j in i + 1..points.len() {
            for k in j + 1..points.len() {
                let (a, b, c) = (points[i], points[j], points[k]);
                let cross = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
                if cross.abs() <= eps {
                    return true;
                }
            }
        }
    }
    false
}

/// Translate the centroid to the origin and scale the mean radius to √2.
fn normalize(points: &[Point]) -> Option<(Matrix3<f64>, Vec<(f64, f64)>)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x as f64).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y as f64).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| (p.x as f64 - cx).hypot(p.y as f64 - cy))
        .sum::<f64>()
        / n;
    if mean_dist < 1e-9 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| (s * (p.x as f64 - cx), s * (p.y as f64 - cy)))
        .collect();
    Some((t, normalized))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn broadcast_quad() -> CornerQuad {
        CornerQuad::new([
            Point::new(420.0, 300.0),
            Point::new(860.0, 300.0),
            Point::new(960.0, 470.0),
            Point::new(320.0, 470.0),
        ])
    }

    #[test]
    fn corners_map_to_canonical_rectangle() {
        let q = broadcast_quad();
        let h = Homography::from_quad(&q).unwrap();
        let expected = [
            (0.0, 0.0),
            (TABLE_LENGTH_CM, 0.0),
            (TABLE_LENGTH_CM, TABLE_WIDTH_CM),
            (0.0, TABLE_WIDTH_CM),
        ];
        for (corner, (ex, ey)) in q.corners().iter().zip(expected) {
            let p = h.project(*corner).unwrap();
            assert_abs_diff_eq!(p.x, ex, epsilon = 1e-2);
            assert_abs_diff_eq!(p.y, ey, epsilon = 1e-2);
        }
    }

    #[test]
    fn inverse_round_trips_table_centre() {
        let h = Homography::from_quad(&broadcast_quad()).unwrap();
        let inv = h.inverse().unwrap();
        let centre = Point::new(TABLE_LENGTH_CM / 2.0, TABLE_WIDTH_CM / 2.0);
        let img = inv.project(centre).unwrap();
        let back = h.project(img).unwrap();
        assert_abs_diff_eq!(back.x, centre.x, epsilon = 1e-2);
        assert_abs_diff_eq!(back.y, centre.y, epsilon = 1e-2);
        // Perspective pulls the centre toward the (shorter) far edge.
        assert!(img.y < 385.0);
    }

    #[test]
    fn axis_aligned_quad_is_affine() {
        let q = CornerQuad::from_bounds(100.0, 100.0, 374.0, 252.5);
        let h = Homography::from_quad(&q).unwrap();
        let p = h.project(Point::new(237.0, 176.25)).unwrap();
        assert_abs_diff_eq!(p.x, 137.0, epsilon = 1e-2);
        assert_abs_diff_eq!(p.y, 76.25, epsilon = 1e-2);
    }

    #[test]
    fn degenerate_quad_yields_none() {
        let collinear = CornerQuad::new([
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(20.0, 0.0),
            Point::new(30.0, 0.0),
        ]);
        assert!(Homography::from_quad(&collinear).is_none());
        let point = CornerQuad::from_bounds(5.0, 5.0, 5.0, 5.0);
        assert!(Homography::from_quad(&point).is_none());
    }
}

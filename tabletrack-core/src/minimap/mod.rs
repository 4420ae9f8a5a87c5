//! minimap — project tracked image positions onto the canonical table

use crate::geometry::Point;
use crate::homography::{Homography, TABLE_LENGTH_CM, TABLE_WIDTH_CM};

#[derive(Debug, Clone, Copy)]
pub struct MiniMapProjector {
    homography: Homography,
}

impl MiniMapProjector {
    pub fn new(homography: Homography) -> Self {
        Self { homography }
    }

    /// Canonical table coordinates (cm), clamped to the playing surface.
    /// `None` if the transform sends the point to infinity.
    pub fn project(&self, image_point: Point) -> Option<Point> {
        let p = self.homography.project(image_point)?;
        Some(Point::new(
            p.x.clamp(0.0, TABLE_LENGTH_CM),
            p.y.clamp(0.0, TABLE_WIDTH_CM),
        ))
    }

    /// Like [`project`](Self::project) but scaled to `[0, 1]²`.
    pub fn project_normalized(&self, image_point: Point) -> Option<Point> {
        self.project(image_point)
            .map(|p| Point::new(p.x / TABLE_LENGTH_CM, p.y / TABLE_WIDTH_CM))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::CornerQuad;
    use approx::assert_abs_diff_eq;
    use nalgebra::Matrix3;

    fn projector() -> MiniMapProjector {
        let quad = CornerQuad::from_bounds(100.0, 100.0, 374.0, 252.5);
        MiniMapProjector::new(Homography::from_quad(&quad).unwrap())
    }

    #[test]
    fn inside_point_is_not_clamped() {
        let p = projector().project(Point::new(150.0, 200.0)).unwrap();
        assert_abs_diff_eq!(p.x, 50.0, epsilon = 1e-2);
        assert_abs_diff_eq!(p.y, 100.0, epsilon = 1e-2);
    }

    #[test]
    fn outside_point_is_clamped_to_surface() {
        let mm = projector();
        let p = mm.project(Point::new(10.0, 900.0)).unwrap();
        assert_eq!(p, Point::new(0.0, TABLE_WIDTH_CM));
        let n = mm.project_normalized(Point::new(1000.0, 0.0)).unwrap();
        assert_eq!(n, Point::new(1.0, 0.0));
    }

    #[test]
    fn point_at_infinity_yields_none() {
        // Third row zeroes w for every point on the line x = 10.
        let h = Homography::from_matrix(Matrix3::new(
            1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, -10.0,
        ));
        let mm = MiniMapProjector::new(h);
        assert!(mm.project(Point::new(10.0, 5.0)).is_none());
        assert!(mm.project(Point::new(11.0, 5.0)).is_some());
    }
}

//! rendering — annotate a frame with the table, the ball and a mini-map
//!
//! Layers, bottom to top: table outline and net, fading ball trail, current
//! ball, and a mini-map inset in the top-right corner with every bounce so
//! far as a permanent dot.

use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_circle_mut, draw_hollow_rect_mut,
    draw_line_segment_mut,
};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::frame::Frame;
use crate::geometry::Point;
use crate::homography::TABLE_ASPECT;
use crate::pipeline::Analyzer;
use crate::tracking::TrackUpdate;

const TABLE_COLOUR: Rgb<u8> = Rgb([0, 255, 255]);
const NET_COLOUR: Rgb<u8> = Rgb([255, 255, 255]);
const BALL_COLOUR: Rgb<u8> = Rgb([0, 255, 0]);
const PREDICTED_COLOUR: Rgb<u8> = Rgb([255, 165, 0]);
const TRAIL_COLOUR: Rgb<u8> = Rgb([255, 255, 0]);
const MAP_SURFACE: Rgb<u8> = Rgb([20, 60, 140]);
const MAP_LINES: Rgb<u8> = Rgb([255, 255, 255]);
const BOUNCE_COLOUR: Rgb<u8> = Rgb([255, 40, 40]);

/// Inset distance from the frame edges.
const MAP_MARGIN: i32 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Trail points drawn, newest last.
    pub trail_len: usize,
    pub ball_radius: i32,
    /// Mini-map width in pixels; its height follows the table aspect.
    pub minimap_width: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            trail_len: 20,
            ball_radius: 6,
            minimap_width: 200,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OverlayRenderer {
    config: OverlayConfig,
}

impl OverlayRenderer {
    pub fn new(config: OverlayConfig) -> Self {
        Self { config }
    }

    /// Annotated copy of `frame` for the state `analyzer` reached after
    /// producing `update` on it.
    pub fn draw(&self, frame: &Frame, analyzer: &Analyzer, update: &TrackUpdate) -> RgbImage {
        let mut img = frame.to_image();

        if let Some(table) = analyzer.table() {
            let c = table.quad.corners();
            for i in 0..4 {
                let (a, b) = (c[i], c[(i + 1) % 4]);
                draw_line_segment_mut(&mut img, (a.x, a.y), (b.x, b.y), TABLE_COLOUR);
            }
            if let Some(y) = table.net_y {
                let (x1, _, x2, _) = table.quad.bounds();
                draw_line_segment_mut(&mut img, (x1, y), (x2, y), NET_COLOUR);
            }
        }

        let trail: Vec<Point> = analyzer.trail().map(|p| p.position).collect();
        let trail = &trail[trail.len().saturating_sub(self.config.trail_len)..];
        let n = trail.len();
        for (i, pair) in trail.windows(2).enumerate() {
            let colour = fade(TRAIL_COLOUR, (i + 2) as f32 / n as f32);
            draw_line_segment_mut(&mut img, (pair[0].x, pair[0].y), (pair[1].x, pair[1].y), colour);
        }

        if let Some(p) = update.position {
            let centre = (p.x.round() as i32, p.y.round() as i32);
            if update.is_predicted {
                draw_hollow_circle_mut(&mut img, centre, self.config.ball_radius, PREDICTED_COLOUR);
            } else {
                draw_filled_circle_mut(&mut img, centre, self.config.ball_radius, BALL_COLOUR);
            }
        }

        if let Some(projector) = analyzer.projector() {
            let ball = update.position.and_then(|p| projector.project_normalized(p));
            let bounces: Vec<Point> = analyzer
                .bounces()
                .iter()
                .filter_map(|b| projector.project_normalized(b.position))
                .collect();
            self.draw_minimap(&mut img, &bounces, ball);
        }

        img
    }

    /// `bounces` and `ball` in normalised table coordinates.
    fn draw_minimap(&self, img: &mut RgbImage, bounces: &[Point], ball: Option<Point>) {
        let w = self.config.minimap_width.min(img.width().saturating_sub(2 * MAP_MARGIN as u32));
        let h = (w as f32 / TABLE_ASPECT).round() as u32;
        if w < 10 || h < 6 || h + 2 * MAP_MARGIN as u32 > img.height() {
            return;
        }
        let x0 = img.width() as i32 - MAP_MARGIN - w as i32;
        let y0 = MAP_MARGIN;
        let to_px = |p: Point| {
            (
                x0 + (p.x * (w - 1) as f32).round() as i32,
                y0 + (p.y * (h - 1) as f32).round() as i32,
            )
        };

        draw_filled_rect_mut(img, Rect::at(x0, y0).of_size(w, h), MAP_SURFACE);
        draw_hollow_rect_mut(img, Rect::at(x0, y0).of_size(w, h), MAP_LINES);
        let net_x = (x0 + w as i32 / 2) as f32;
        draw_line_segment_mut(img, (net_x, y0 as f32), (net_x, (y0 + h as i32 - 1) as f32), MAP_LINES);

        for &b in bounces {
            draw_filled_circle_mut(img, to_px(b), 3, BOUNCE_COLOUR);
        }
        if let Some(p) = ball {
            draw_filled_circle_mut(img, to_px(p), 3, BALL_COLOUR);
        }
    }
}

fn fade(colour: Rgb<u8>, strength: f32) -> Rgb<u8> {
    let s = strength.clamp(0.0, 1.0);
    Rgb(colour.0.map(|c| (c as f32 * s).round() as u8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::geometry::CornerQuad;
    use crate::table::{DetectionSource, StrategyKind, TableDetection};
    use crate::tracking::Mode;

    fn update_at(p: Option<Point>, predicted: bool) -> TrackUpdate {
        TrackUpdate {
            position: p,
            velocity: None,
            acceleration: None,
            is_bounce: false,
            is_predicted: predicted,
            mode: Mode::Tracking,
            confirmed: p.is_some(),
        }
    }

    fn blank() -> Frame {
        Frame::from_image(RgbImage::from_pixel(640, 360, Rgb([0, 0, 0])), 0)
    }

    #[test]
    fn without_table_only_the_ball_is_drawn() {
        let analyzer = Analyzer::new(&AnalysisConfig::default());
        let renderer = OverlayRenderer::default();
        let img = renderer.draw(&blank(), &analyzer, &update_at(Some(Point::new(100.0, 100.0)), false));
        assert_eq!(*img.get_pixel(100, 100), BALL_COLOUR);
        // No inset without a homography.
        assert_eq!(*img.get_pixel(600, 20), Rgb([0, 0, 0]));
    }

    #[test]
    fn table_net_and_minimap_are_drawn() {
        let mut analyzer = Analyzer::new(&AnalysisConfig::default());
        analyzer.set_table(
            TableDetection {
                quad: CornerQuad::from_bounds(200.0, 150.0, 474.0, 302.5),
                net_y: Some(220.0),
                source: DetectionSource::Local(StrategyKind::SurfaceLines),
            },
            640,
            360,
        );
        let renderer = OverlayRenderer::default();
        let img = renderer.draw(&blank(), &analyzer, &update_at(Some(Point::new(300.0, 200.0)), true));

        assert_eq!(*img.get_pixel(300, 150), TABLE_COLOUR);
        assert_eq!(*img.get_pixel(300, 220), NET_COLOUR);
        // Predicted balls are hollow.
        assert_eq!(*img.get_pixel(300, 200), Rgb([0, 0, 0]));
        assert_eq!(*img.get_pixel(306, 200), PREDICTED_COLOUR);
        // Inset interior sits below the frame's top-right corner.
        assert_eq!(*img.get_pixel(640 - 10 - 150, 10 + 20), MAP_SURFACE);
    }

    #[test]
    fn fade_scales_towards_black() {
        assert_eq!(fade(Rgb([200, 100, 0]), 0.5), Rgb([100, 50, 0]));
        assert_eq!(fade(Rgb([200, 100, 0]), 2.0), Rgb([200, 100, 0]));
    }
}

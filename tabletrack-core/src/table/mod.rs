//! table — locate the four playing-surface corners (and the net) in a frame
//!
//! A fixed camera means this runs once per session, optionally retried on a
//! few sampled frames. Strategies are tried in priority order and the first
//! quad the [`GeometryValidator`] accepts wins:
//!
//!   1. surface_lines   — colour-located surface, snapped to its edge lines
//!   2. border_lines    — density peaks of painted border bands, paired by score
//!   3. rectangles      — convex near-rectangular contours across binarisations
//!   4. clustered_lines — brightest colour cluster, outermost line intersections
//!   5. raw_edges       — plain edge map, outermost line intersections
//!   6. surface_contour — quad fit to the largest saturated surface blob

pub mod bands;
pub mod masks;
pub mod refine;
pub mod segments;
pub mod shapes;
pub mod strategies;
pub mod surface;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::frame::{downscale, Frame};
use crate::geometry::{AspectPolicy, CornerQuad, GeometryValidator};
use crate::homography::Homography;
use crate::remote::{self, RemoteConfig, RemoteCornerDetector};

use self::bands::PairScoring;
use self::strategies::{Candidate, FrameContext};

// ── Strategy list ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SurfaceLines,
    BorderLines,
    Rectangles,
    ClusteredLines,
    RawEdges,
    SurfaceContour,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::SurfaceLines,
        StrategyKind::BorderLines,
        StrategyKind::Rectangles,
        StrategyKind::ClusteredLines,
        StrategyKind::RawEdges,
        StrategyKind::SurfaceContour,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::SurfaceLines => "surface_lines",
            StrategyKind::BorderLines => "border_lines",
            StrategyKind::Rectangles => "rectangles",
            StrategyKind::ClusteredLines => "clustered_lines",
            StrategyKind::RawEdges => "raw_edges",
            StrategyKind::SurfaceContour => "surface_contour",
        }
    }

    fn run(self, ctx: &FrameContext, config: &TableDetectorConfig) -> Option<Candidate> {
        let v = &config.validator;
        match self {
            StrategyKind::SurfaceLines => strategies::surface_lines(ctx, v),
            StrategyKind::BorderLines => strategies::border_lines(ctx, v, &config.pair_scoring),
            StrategyKind::Rectangles => strategies::rectangles(ctx, v),
            StrategyKind::ClusteredLines => strategies::clustered_lines(ctx, v),
            StrategyKind::RawEdges => strategies::raw_edges(ctx, v),
            StrategyKind::SurfaceContour => strategies::surface_contour(ctx, v),
        }
    }
}

/// Where an accepted quad came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Local(StrategyKind),
    Remote,
}

/// An accepted table: corners in source-frame pixels, plus the net row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TableDetection {
    pub quad: CornerQuad,
    pub net_y: Option<f32>,
    pub source: DetectionSource,
}

impl TableDetection {
    /// Image → canonical table coordinates; `None` for a degenerate quad.
    pub fn homography(&self) -> Option<Homography> {
        Homography::from_quad(&self.quad)
    }
}

// ── Detector ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableDetectorConfig {
    pub validator: GeometryValidator,
    pub aspect_policy: AspectPolicy,
    pub pair_scoring: PairScoring,
    /// Frames whose longest side exceeds this are downscaled before search.
    pub max_dim: u32,
    /// Strategies in the order they are tried.
    pub strategies: Vec<StrategyKind>,
}

impl Default for TableDetectorConfig {
    fn default() -> Self {
        Self {
            validator: GeometryValidator::default(),
            aspect_policy: AspectPolicy::default(),
            pair_scoring: PairScoring::default(),
            max_dim: 1280,
            strategies: StrategyKind::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TableDetector {
    config: TableDetectorConfig,
}

impl TableDetector {
    pub fn new(config: TableDetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TableDetectorConfig {
        &self.config
    }

    /// Run the cascade on one frame. Never fails; `None` means no strategy
    /// produced a quad that survived the aspect policy and the validator.
    pub fn detect(&self, frame: &Frame) -> Option<TableDetection> {
        let scaled = downscale(frame, self.config.max_dim);
        let (work, sx, sy) = match &scaled {
            Some((small, sx, sy)) => (small, *sx, *sy),
            None => (frame, 1.0, 1.0),
        };
        let ctx = FrameContext::new(work);
        let (w, h) = (ctx.width(), ctx.height());

        for &kind in &self.config.strategies {
            let Some(candidate) = kind.run(&ctx, &self.config) else {
                debug!(strategy = kind.as_str(), "no candidate");
                continue;
            };
            let Some(quad) = self.config.aspect_policy.apply(candidate.quad) else {
                debug!(strategy = kind.as_str(), aspect = candidate.quad.aspect(), "aspect rejected");
                continue;
            };
            if !self.config.validator.validate(&quad, w, h) {
                debug!(strategy = kind.as_str(), "refit quad failed validation");
                continue;
            }

            let quad = quad.scaled(sx, sy);
            let net_y = candidate.net_y.map(|y| y * sy);
            info!(
                strategy = kind.as_str(),
                frame = frame.index,
                width = quad.width(),
                height = quad.height(),
                net_y = ?net_y,
                "table detected"
            );
            return Some(TableDetection {
                quad,
                net_y,
                source: DetectionSource::Local(kind),
            });
        }

        warn!(frame = frame.index, "table detection failed: no strategy produced a valid quad");
        None
    }

    /// Ask `remote` first and fall back to [`detect`](Self::detect) when it
    /// errors, times out, or gives an answer the remote validator refuses.
    pub fn detect_with(
        &self,
        frame: &Frame,
        remote: Option<&Arc<dyn RemoteCornerDetector>>,
        config: &RemoteConfig,
    ) -> Option<TableDetection> {
        if let Some(detector) = remote {
            let request = remote::describe(frame);
            let surface = request.surface;
            let checked = remote::guarded_detect(Arc::clone(detector), request, config.timeout())
                .and_then(|reply| {
                    let quad = config
                        .validator
                        .check(&reply, surface, frame.width, frame.height)?;
                    Ok((quad, reply.net_y))
                });
            match checked {
                Ok((quad, net_y)) => {
                    info!(detector = detector.name(), frame = frame.index, "table from remote detector");
                    return Some(TableDetection {
                        quad,
                        net_y,
                        source: DetectionSource::Remote,
                    });
                }
                Err(e) => warn!("remote table detection unusable, using local strategies: {e:#}"),
            }
        }
        self.detect(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    /// Blue surface with a white painted rim and a light net line across it.
    fn table_frame() -> Frame {
        let mut img = RgbImage::from_pixel(640, 360, Rgb([40, 40, 40]));
        draw_filled_rect_mut(&mut img, Rect::at(180, 150).of_size(280, 110), Rgb([240, 240, 240]));
        draw_filled_rect_mut(&mut img, Rect::at(184, 154).of_size(272, 102), Rgb([30, 60, 150]));
        draw_filled_rect_mut(&mut img, Rect::at(170, 199).of_size(300, 3), Rgb([220, 220, 220]));
        Frame::from_image(img, 0)
    }

    #[test]
    fn detects_synthetic_table_with_net() {
        let found = TableDetector::default().detect(&table_frame()).expect("table");
        assert_eq!(found.source, DetectionSource::Local(StrategyKind::SurfaceLines));
        let expect = [
            Point::new(180.0, 150.0),
            Point::new(460.0, 150.0),
            Point::new(460.0, 260.0),
            Point::new(180.0, 260.0),
        ];
        for (got, want) in found.quad.corners().iter().zip(expect) {
            assert!(got.distance(want) < 10.0, "{got:?} vs {want:?}");
        }
        let net = found.net_y.expect("net");
        assert!((net - 200.0).abs() < 6.0, "net {net}");
        assert!(found.homography().is_some());
    }

    #[test]
    fn detection_is_repeatable() {
        let detector = TableDetector::default();
        let frame = table_frame();
        assert_eq!(detector.detect(&frame), detector.detect(&frame));
    }

    #[test]
    fn empty_strategy_list_finds_nothing() {
        let detector = TableDetector::new(TableDetectorConfig {
            strategies: Vec::new(),
            ..TableDetectorConfig::default()
        });
        assert!(detector.detect(&table_frame()).is_none());
    }

    #[test]
    fn large_frames_are_searched_downscaled() {
        let frame = table_frame();
        let big = image::imageops::resize(
            &frame.to_image(),
            1280,
            720,
            image::imageops::FilterType::Nearest,
        );
        let detector = TableDetector::new(TableDetectorConfig {
            max_dim: 640,
            ..TableDetectorConfig::default()
        });
        let found = detector.detect(&Frame::from_image(big, 0)).expect("table");
        let tl = found.quad.top_left();
        assert!(tl.distance(Point::new(360.0, 300.0)) < 20.0, "{tl:?}");
    }

    struct Canned(&'static str);

    impl RemoteCornerDetector for Canned {
        fn name(&self) -> &str {
            "canned"
        }
        fn query(&self, _request: &remote::RemoteRequest) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn remote_answer_is_used_when_consistent() {
        let remote: Arc<dyn RemoteCornerDetector> = Arc::new(Canned(
            r#"{"corners": [[181,151],[459,151],[459,259],[181,259]], "net_y": 200}"#,
        ));
        let found = TableDetector::default()
            .detect_with(&table_frame(), Some(&remote), &RemoteConfig::default())
            .unwrap();
        assert_eq!(found.source, DetectionSource::Remote);
        assert_eq!(found.net_y, Some(200.0));
    }

    #[test]
    fn implausible_remote_answer_falls_back() {
        let remote: Arc<dyn RemoteCornerDetector> = Arc::new(Canned(
            r#"{"corners": [[0,0],[600,0],[600,340],[0,340]]}"#,
        ));
        let found = TableDetector::default()
            .detect_with(&table_frame(), Some(&remote), &RemoteConfig::default())
            .unwrap();
        assert_eq!(found.source, DetectionSource::Local(StrategyKind::SurfaceLines));
    }

    #[test]
    fn strategy_names_round_trip_through_serde() {
        let json = serde_json::to_string(&StrategyKind::ClusteredLines).unwrap();
        assert_eq!(json, "\"clustered_lines\"");
        assert_eq!(StrategyKind::ClusteredLines.as_str(), "clustered_lines");
    }
}

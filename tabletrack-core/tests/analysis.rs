//! Whole-session analysis on rendered frames: calibrate, track, bounce.

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
use imageproc::rect::Rect;

use tabletrack_core::config::AnalysisConfig;
use tabletrack_core::frame::Frame;
use tabletrack_core::geometry::Point;
use tabletrack_core::pipeline::{Analyzer, MemorySink};
use tabletrack_core::table::{DetectionSource, StrategyKind};

/// Ball travels right and down onto the near half, then back up.
fn ball_at(frame: u64) -> Point {
    let f = frame as f32;
    let y = if frame <= 25 { 160.0 + 3.0 * f } else { 235.0 - 3.0 * (f - 25.0) };
    Point::new(200.0 + 4.0 * f, y)
}

fn render(index: u64, ball: Option<Point>) -> Frame {
    let mut img = RgbImage::from_pixel(640, 360, Rgb([40, 40, 40]));
    draw_filled_rect_mut(&mut img, Rect::at(180, 150).of_size(280, 110), Rgb([240, 240, 240]));
    draw_filled_rect_mut(&mut img, Rect::at(184, 154).of_size(272, 102), Rgb([30, 60, 150]));
    draw_filled_rect_mut(&mut img, Rect::at(170, 199).of_size(300, 3), Rgb([220, 220, 220]));
    if let Some(p) = ball {
        draw_filled_circle_mut(&mut img, (p.x.round() as i32, p.y.round() as i32), 4, Rgb([250, 250, 250]));
    }
    Frame::from_image(img, index)
}

#[test]
fn session_finds_table_tracks_ball_and_reports_bounce() {
    let config = AnalysisConfig::default();
    let mut analyzer = Analyzer::new(&config);
    let table = analyzer.calibrate(|i| Ok(render(i, None))).copied().expect("table");
    assert_eq!(table.source, DetectionSource::Local(StrategyKind::SurfaceLines));

    let mut sink = MemorySink::default();
    let mut reported = 0;
    for i in 0..45 {
        let outcome = analyzer.process(&render(i, Some(ball_at(i))), &mut sink);
        if let Some(p) = outcome.update.position {
            assert!(p.distance(ball_at(i)) < 10.0, "frame {i}: {p:?}");
            reported += 1;
        }
    }
    assert!(reported >= 30, "only {reported} frames reported");

    assert_eq!(sink.bounces.len(), 1, "{:?}", sink.bounces);
    let bounce = sink.bounces[0];
    assert!((24..=28).contains(&bounce.frame), "bounce at {}", bounce.frame);
    let on_map = bounce.table_position.expect("projected bounce");
    assert!(on_map.x > 0.0 && on_map.y > 0.0);

    let samples: Vec<u64> = sink.samples.iter().map(|s| s.frame).collect();
    assert_eq!(samples, vec![0, 10, 20, 30, 40]);
    let twenty = sink.samples[2].ball;
    assert!(twenty.zone.is_some());
    assert!(twenty.height_above_table.is_some_and(|h| h < 0.0));

    let summary = analyzer.finish(&mut sink);
    assert_eq!(summary.frames, 45);
    assert_eq!(summary.bounces.len(), 1);
    assert_eq!(summary.table, Some(table));
}

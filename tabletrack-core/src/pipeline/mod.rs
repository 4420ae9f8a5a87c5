//! pipeline — one analysis session: table calibration, then per-frame tracking
//!
//! The analyzer owns every piece of mutable session state (extractor buffers,
//! background model, tracker) and is driven one frame at a time.  Nothing in
//! here returns an error for "nothing found"; downstream sink failures are
//! logged and swallowed so the frame loop never stops on them.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AnalysisConfig;
use crate::detection::{BallCandidate, BallCandidateExtractor, Roi};
use crate::frame::Frame;
use crate::geometry::Point;
use crate::minimap::MiniMapProjector;
use crate::remote::{RemoteConfig, RemoteCornerDetector};
use crate::table::{TableDetection, TableDetector};
use crate::tracking::{BallTracker, Mode, TableBounds, TrackPoint, TrackUpdate};

const PROFILE_EVERY: u64 = 300;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Source frame rate, used for sample timestamps and speeds.
    pub fps: f64,
    /// A [`FrameSample`] is emitted for every frame index divisible by this.
    pub sample_every: u64,
    /// Frame indices tried, in order, until table detection succeeds.
    pub calibration_frames: Vec<u64>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fps: 30.0,
            sample_every: 10,
            calibration_frames: vec![0, 30, 60, 90, 150],
        }
    }
}

// ── Samples ───────────────────────────────────────────────────────────────────

/// Table sixth a position falls in: near/far of the net × thirds across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    NearLeft,
    NearCenter,
    NearRight,
    FarLeft,
    FarCenter,
    FarRight,
}

impl Zone {
    /// `None` outside the table bounds. Without a detected net the split
    /// falls halfway down the table.
    pub fn classify(p: Point, table: &TableBounds, net_y: Option<f32>) -> Option<Zone> {
        if !table.contains_with_margin(p, 0.0, 0.0) {
            return None;
        }
        let third = (table.x2 - table.x1) / 3.0;
        let net = net_y.unwrap_or((table.y1 + table.y2) / 2.0);
        let near = p.y > net;
        let zone = if p.x < table.x1 + third {
            if near { Zone::NearLeft } else { Zone::FarLeft }
        } else if p.x > table.x2 - third {
            if near { Zone::NearRight } else { Zone::FarRight }
        } else if near {
            Zone::NearCenter
        } else {
            Zone::FarCenter
        };
        Some(zone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BallSample {
    pub x: Option<f32>,
    pub y: Option<f32>,
    /// Hundreds of pixels per second; zero while no position is reported.
    pub speed: f32,
    /// Change in `speed` since the previous sample.
    pub acceleration: f32,
    /// Screen-space heading, counter-clockwise from +x with y pointing up.
    pub direction_deg: Option<f32>,
    /// Pixels above the table's top edge; negative below it.
    pub height_above_table: Option<f32>,
    pub zone: Option<Zone>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameSample {
    /// Seconds since the first frame.
    pub t: f64,
    pub frame: u64,
    pub ball: BallSample,
}

/// A bounce, with its mini-map position when a homography exists.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BounceRecord {
    pub t: f64,
    pub frame: u64,
    pub position: Point,
    pub table_position: Option<Point>,
}

/// End-of-session summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub frames: u64,
    pub table: Option<TableDetection>,
    pub bounces: Vec<BounceRecord>,
}

// ── Sinks ─────────────────────────────────────────────────────────────────────

/// Receiver for the sample stream. Errors are reported to the analyzer,
/// which logs them and carries on.
pub trait SampleSink {
    fn sample(&mut self, sample: &FrameSample) -> Result<()>;
    fn bounce(&mut self, bounce: &BounceRecord) -> Result<()>;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record<'a> {
    Sample(&'a FrameSample),
    Bounce(&'a BounceRecord),
}

/// One JSON object per line, tagged with `"kind"`.
pub struct JsonLinesSink<W: Write> {
    out: BufWriter<W>,
}

impl JsonLinesSink<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("cannot create sample file {}", path.display()))?;
        Ok(Self::new(file))
    }
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: BufWriter::new(writer),
        }
    }

    fn write(&mut self, record: Record<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.out, &record)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.out
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flushing samples failed: {}", e.error()))
    }
}

impl<W: Write> SampleSink for JsonLinesSink<W> {
    fn sample(&mut self, sample: &FrameSample) -> Result<()> {
        self.write(Record::Sample(sample))
    }

    fn bounce(&mut self, bounce: &BounceRecord) -> Result<()> {
        self.write(Record::Bounce(bounce))
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().context("flushing samples failed")
    }
}

#[derive(Debug, Default)]
pub struct MemorySink {
    pub samples: Vec<FrameSample>,
    pub bounces: Vec<BounceRecord>,
}

impl SampleSink for MemorySink {
    fn sample(&mut self, sample: &FrameSample) -> Result<()> {
        self.samples.push(*sample);
        Ok(())
    }

    fn bounce(&mut self, bounce: &BounceRecord) -> Result<()> {
        self.bounces.push(*bounce);
        Ok(())
    }
}

// ── Analyzer ──────────────────────────────────────────────────────────────────

/// What happened on one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameOutcome {
    pub candidate: Option<BallCandidate>,
    pub update: TrackUpdate,
}

pub struct Analyzer {
    config: AnalyzerConfig,
    detector: TableDetector,
    remote: Option<Arc<dyn RemoteCornerDetector>>,
    remote_config: RemoteConfig,
    extractor: BallCandidateExtractor,
    tracker: BallTracker,
    table: Option<TableDetection>,
    roi: Option<Roi>,
    projector: Option<MiniMapProjector>,
    bounces: Vec<BounceRecord>,
    last_speed: f32,
    prof_frames: u64,
    prof_extract: Duration,
    prof_track: Duration,
}

impl Analyzer {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self {
            config: config.analyzer.clone(),
            detector: TableDetector::new(config.table.clone()),
            remote: None,
            remote_config: config.remote.clone(),
            extractor: BallCandidateExtractor::new(config.extractor.clone()),
            tracker: BallTracker::new(config.tracker.clone()),
            table: None,
            roi: None,
            projector: None,
            bounces: Vec::new(),
            last_speed: 0.0,
            prof_frames: 0,
            prof_extract: Duration::ZERO,
            prof_track: Duration::ZERO,
        }
    }

    /// Consult `remote` before the local strategies during calibration.
    pub fn with_remote(mut self, remote: Arc<dyn RemoteCornerDetector>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn table(&self) -> Option<&TableDetection> {
        self.table.as_ref()
    }

    pub fn roi(&self) -> Option<&Roi> {
        self.roi.as_ref()
    }

    pub fn projector(&self) -> Option<&MiniMapProjector> {
        self.projector.as_ref()
    }

    pub fn tracker(&self) -> &BallTracker {
        &self.tracker
    }

    pub fn trail(&self) -> impl Iterator<Item = &TrackPoint> {
        self.tracker.history()
    }

    pub fn bounces(&self) -> &[BounceRecord] {
        &self.bounces
    }

    /// Try table detection on each configured calibration frame until one
    /// succeeds. Frames `fetch` cannot produce are skipped. On total failure
    /// tracking continues without ROI, bounce gating or mini-map.
    pub fn calibrate<F>(&mut self, mut fetch: F) -> Option<&TableDetection>
    where
        F: FnMut(u64) -> Result<Frame>,
    {
        let indices = self.config.calibration_frames.clone();
        for index in indices {
            let frame = match fetch(index) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("calibration frame {index} unavailable: {e:#}");
                    continue;
                }
            };
            if let Some(found) = self
                .detector
                .detect_with(&frame, self.remote.as_ref(), &self.remote_config)
            {
                self.set_table(found, frame.width, frame.height);
                return self.table.as_ref();
            }
        }
        warn!(
            tried = self.config.calibration_frames.len(),
            "no table found; tracking without table bounds"
        );
        None
    }

    /// Install a table found elsewhere (or re-detected).
    pub fn set_table(&mut self, found: TableDetection, width: u32, height: u32) {
        self.tracker.set_table(Some(&found.quad));
        self.roi = Some(Roi::from_quad(&found.quad, width, height, self.extractor.config()));
        self.projector = found.homography().map(MiniMapProjector::new);
        if self.projector.is_none() {
            warn!("table quad is degenerate; mini-map disabled");
        }
        self.table = Some(found);
    }

    /// Extract, track, and report one frame.
    pub fn process(&mut self, frame: &Frame, sink: &mut dyn SampleSink) -> FrameOutcome {
        let prev = self.tracker.estimate();
        let radius = self.tracker.search_radius();
        let desperate = self.tracker.mode() == Mode::Desperate;

        let extract_start = Instant::now();
        let candidate = self
            .extractor
            .extract(frame, prev, self.roi.as_ref(), radius, desperate);
        self.prof_extract += extract_start.elapsed();

        let track_start = Instant::now();
        let update = self
            .tracker
            .update(candidate.map(|c| c.position), frame.index);
        self.prof_track += track_start.elapsed();

        if update.is_bounce {
            if let Some(event) = self.tracker.bounces().last().copied() {
                let record = BounceRecord {
                    t: self.seconds(event.frame_index),
                    frame: event.frame_index,
                    position: event.position,
                    table_position: self.projector.and_then(|p| p.project(event.position)),
                };
                info!(frame = record.frame, x = record.position.x, y = record.position.y, "bounce");
                if let Err(e) = sink.bounce(&record) {
                    warn!("sample sink rejected bounce: {e:#}");
                }
                self.bounces.push(record);
            }
        }

        if frame.index % self.config.sample_every.max(1) == 0 {
            let sample = self.sample(frame.index, &update);
            if let Err(e) = sink.sample(&sample) {
                warn!("sample sink rejected sample: {e:#}");
            }
        }

        self.prof_frames += 1;
        if self.prof_frames > 0 && self.prof_frames % PROFILE_EVERY == 0 {
            info!(
                frames = self.prof_frames,
                extract_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_extract.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                track_ms_per_frame = format!(
                    "{:.2}",
                    self.prof_track.as_secs_f64() * 1000.0 / self.prof_frames as f64
                ),
                "pipeline analyze timings"
            );
        }

        FrameOutcome { candidate, update }
    }

    /// Flush `sink` and summarise the session.
    pub fn finish(self, sink: &mut dyn SampleSink) -> AnalysisSummary {
        if let Err(e) = sink.flush() {
            warn!("sample sink flush failed: {e:#}");
        }
        info!(
            frames = self.prof_frames,
            bounces = self.bounces.len(),
            table = self.table.is_some(),
            "analysis finished"
        );
        AnalysisSummary {
            frames: self.prof_frames,
            table: self.table,
            bounces: self.bounces,
        }
    }

    fn seconds(&self, frame_index: u64) -> f64 {
        if self.config.fps > 0.0 {
            frame_index as f64 / self.config.fps
        } else {
            0.0
        }
    }

    fn sample(&mut self, frame_index: u64, update: &TrackUpdate) -> FrameSample {
        let pos = update.position;
        let (vx, vy) = update.velocity.unwrap_or((0.0, 0.0));
        let speed = match pos {
            Some(_) => round1(vx.hypot(vy) * self.config.fps as f32 / 100.0),
            None => 0.0,
        };
        let acceleration = round1(speed - self.last_speed);
        self.last_speed = speed;

        let bounds = self.table.map(|t| TableBounds::from_quad(&t.quad));
        let net_y = self.table.and_then(|t| t.net_y);
        let confidence = match (pos, update.is_predicted) {
            (Some(_), false) => 0.85,
            (Some(_), true) => 0.5,
            (None, _) => 0.0,
        };

        FrameSample {
            t: self.seconds(frame_index),
            frame: frame_index,
            ball: BallSample {
                x: pos.map(|p| p.x),
                y: pos.map(|p| p.y),
                speed,
                acceleration,
                direction_deg: pos
                    .filter(|_| vx != 0.0)
                    .map(|_| round1((-vy).atan2(vx).to_degrees())),
                height_above_table: pos.zip(bounds).map(|(p, b)| round1(b.y1 - p.y)),
                zone: pos
                    .zip(bounds)
                    .and_then(|(p, b)| Zone::classify(p, &b, net_y)),
                confidence,
            },
        }
    }
}

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::CornerQuad;
    use image::{Rgb, RgbImage};
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect;

    fn table_frame(index: u64) -> Frame {
        let mut img = RgbImage::from_pixel(640, 360, Rgb([40, 40, 40]));
        draw_filled_rect_mut(&mut img, Rect::at(180, 150).of_size(280, 110), Rgb([240, 240, 240]));
        draw_filled_rect_mut(&mut img, Rect::at(184, 154).of_size(272, 102), Rgb([30, 60, 150]));
        draw_filled_rect_mut(&mut img, Rect::at(170, 199).of_size(300, 3), Rgb([220, 220, 220]));
        Frame::from_image(img, index)
    }

    fn ball_frame(index: u64) -> Frame {
        let mut img = RgbImage::from_pixel(320, 240, Rgb([30, 50, 110]));
        draw_filled_circle_mut(&mut img, (50 + 12 * index as i32, 100), 4, Rgb([250, 250, 250]));
        Frame::from_image(img, index)
    }

    struct FailingSink;

    impl SampleSink for FailingSink {
        fn sample(&mut self, _sample: &FrameSample) -> Result<()> {
            anyhow::bail!("disk full")
        }
        fn bounce(&mut self, _bounce: &BounceRecord) -> Result<()> {
            anyhow::bail!("disk full")
        }
    }

    #[test]
    fn zones_split_at_the_net_and_in_thirds() {
        let b = TableBounds::from_quad(&CornerQuad::from_bounds(0.0, 0.0, 300.0, 100.0));
        assert_eq!(Zone::classify(Point::new(10.0, 80.0), &b, None), Some(Zone::NearLeft));
        assert_eq!(Zone::classify(Point::new(150.0, 20.0), &b, None), Some(Zone::FarCenter));
        assert_eq!(Zone::classify(Point::new(290.0, 40.0), &b, Some(30.0)), Some(Zone::NearRight));
        assert_eq!(Zone::classify(Point::new(150.0, 120.0), &b, None), None);
    }

    #[test]
    fn calibration_skips_unreadable_frames() {
        let mut analyzer = Analyzer::new(&AnalysisConfig::default());
        let mut asked = Vec::new();
        let found = analyzer
            .calibrate(|i| {
                asked.push(i);
                if i == 0 {
                    anyhow::bail!("decode failed")
                }
                Ok(table_frame(i))
            })
            .copied();
        assert!(found.is_some());
        assert_eq!(asked, vec![0, 30]);
        assert!(analyzer.roi().is_some());
        assert!(analyzer.projector().is_some());
    }

    #[test]
    fn calibration_failure_leaves_tracking_unconstrained() {
        let mut analyzer = Analyzer::new(&AnalysisConfig::default());
        let found = analyzer
            .calibrate(|i| Ok(Frame::from_image(RgbImage::from_pixel(320, 240, Rgb([0, 0, 0])), i)));
        assert!(found.is_none());
        assert!(analyzer.table().is_none());
        assert!(analyzer.roi().is_none());
    }

    #[test]
    fn moving_ball_is_sampled_every_tenth_frame() {
        let mut analyzer = Analyzer::new(&AnalysisConfig::default());
        let mut sink = MemorySink::default();
        for i in 0..21 {
            analyzer.process(&ball_frame(i), &mut sink);
        }
        let frames: Vec<u64> = sink.samples.iter().map(|s| s.frame).collect();
        assert_eq!(frames, vec![0, 10, 20]);

        let first = sink.samples[0].ball;
        assert_eq!(first.x, None);
        assert_eq!(first.confidence, 0.0);

        let tenth = sink.samples[1];
        assert!((tenth.t - 10.0 / 30.0).abs() < 1e-9);
        let x = tenth.ball.x.expect("confirmed ball");
        assert!((x - 170.0).abs() < 15.0, "x {x}");
        assert_eq!(tenth.ball.confidence, 0.85);
        assert!(tenth.ball.speed > 0.0);
        assert!(tenth.ball.zone.is_none());

        let summary = analyzer.finish(&mut sink);
        assert_eq!(summary.frames, 21);
        assert!(summary.bounces.is_empty());
    }

    #[test]
    fn sink_failures_do_not_stop_the_loop() {
        let mut analyzer = Analyzer::new(&AnalysisConfig::default());
        for i in 0..12 {
            analyzer.process(&ball_frame(i), &mut FailingSink);
        }
        assert!(analyzer.tracker().is_initialized());
    }

    #[test]
    fn json_lines_are_tagged() {
        let mut sink = JsonLinesSink::new(Vec::new());
        let sample = FrameSample {
            t: 0.5,
            frame: 15,
            ball: BallSample {
                x: Some(10.0),
                y: Some(20.0),
                speed: 1.5,
                acceleration: 0.0,
                direction_deg: None,
                height_above_table: None,
                zone: Some(Zone::FarLeft),
                confidence: 0.85,
            },
        };
        sink.sample(&sample).unwrap();
        sink.bounce(&BounceRecord {
            t: 1.0,
            frame: 30,
            position: Point::new(5.0, 6.0),
            table_position: None,
        })
        .unwrap();
        let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "sample");
        assert_eq!(lines[0]["ball"]["zone"], "far_left");
        assert_eq!(lines[1]["kind"], "bounce");
        assert_eq!(lines[1]["frame"], 30);
    }
}

//! tracking — ball state estimation, re-acquisition modes and bounce events
//!
//! Model: 2D constant-acceleration Kalman filter over the ball centre.
//!
//! State vector: [x, y, vx, vy, ax, ay]ᵀ  (pixels, pixels/frame, pixels/frame²
//!               with the default `dt = 1`)
//! Measurement:  [x, y]ᵀ
//!
//! The filter predicts every frame.  A measurement is folded in only when it
//! lies within the current mode's outlier distance of the prediction;
//! otherwise the frame counts as a miss.  Consecutive misses walk the mode
//! ladder Tracking → Searching → Desperate, which widens both the search
//! radius handed to the candidate extractor and the outlier gate.  Past
//! `max_missing` the filter is dropped entirely and must be re-seeded.
//!
//! Positions are reported only while the track is confirmed: `confirm_hits`
//! successes in the last `confirm_window` updates lock it, and a full window
//! with at most `release_hits` successes unlocks it.  A track that has filled
//! a whole window with successes keeps its lock through gaps that are still
//! coasted on screen.

use std::collections::VecDeque;

use nalgebra::{Matrix2, Matrix2x6, Matrix6, Matrix6x2, Vector2, Vector6};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::geometry::{CornerQuad, Point};

// ── Tuning ────────────────────────────────────────────────────────────────────

/// Every threshold the tracker uses.  The defaults are empirically tuned for
/// 30 fps broadcast footage of a rally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Consecutive misses before switching to `Searching`.
    pub searching_after: u32,
    /// Consecutive misses before switching to `Desperate`.
    pub desperate_after: u32,
    /// Misses beyond this drop the estimate entirely.
    pub max_missing: u32,

    pub tracking_radius: f32,
    pub searching_radius: f32,
    /// `None` searches the whole region of interest.
    pub desperate_radius: Option<f32>,

    /// Outlier gate in `Tracking`: `base + per_miss · missing_frames`.
    pub tracking_outlier_base: f32,
    pub tracking_outlier_per_miss: f32,
    pub searching_outlier: f32,
    /// `None` accepts any measurement.
    pub desperate_outlier: Option<f32>,

    /// Length of the detection-success window.
    pub confirm_window: usize,
    /// Successes in the window needed to start reporting positions.
    pub confirm_hits: usize,
    /// A full window with at most this many successes stops reporting,
    /// unless an established track is coasting through a short gap.
    pub release_hits: usize,
    /// Predicted positions are reported for at most this many misses.
    pub predicted_display_frames: u32,

    /// Vertical velocity that counts as clearly falling (pixels/frame).
    pub bounce_min_down_velocity: f32,
    /// Frames that must separate two bounces.
    pub bounce_min_gap: u64,
    /// Outward table-bounds margin for bounces, as a fraction of table width.
    pub bounce_margin_x: f32,
    /// Outward table-bounds margin for bounces, as a fraction of table height.
    pub bounce_margin_y: f32,

    /// Trajectory points kept for trails.
    pub history_len: usize,

    /// Time step of the motion model; 1.0 keeps velocities in pixels/frame.
    pub dt: f32,
    pub initial_covariance: f32,
    pub process_noise: f32,
    pub accel_noise_x: f32,
    pub accel_noise_y: f32,
    pub measurement_noise: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            searching_after: 5,
            desperate_after: 12,
            max_missing: 45,
            tracking_radius: 100.0,
            searching_radius: 200.0,
            desperate_radius: None,
            tracking_outlier_base: 80.0,
            tracking_outlier_per_miss: 8.0,
            searching_outlier: 250.0,
            desperate_outlier: None,
            confirm_window: 5,
            confirm_hits: 3,
            release_hits: 1,
            predicted_display_frames: 8,
            bounce_min_down_velocity: 0.3,
            bounce_min_gap: 8,
            bounce_margin_x: 0.10,
            bounce_margin_y: 0.15,
            history_len: 300,
            dt: 1.0,
            initial_covariance: 200.0,
            process_noise: 0.2,
            accel_noise_x: 0.5,
            accel_noise_y: 0.8,
            measurement_noise: 3.0,
        }
    }
}

// ── Mode ladder ───────────────────────────────────────────────────────────────

/// Re-acquisition aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Tracking,
    Searching,
    Desperate,
}

/// Mode for a run of `missing_frames` consecutive misses.
pub fn next_mode(missing_frames: u32, config: &TrackerConfig) -> Mode {
    if missing_frames >= config.desperate_after {
        Mode::Desperate
    } else if missing_frames >= config.searching_after {
        Mode::Searching
    } else {
        Mode::Tracking
    }
}

impl Mode {
    /// Search radius around the prediction; `None` is unbounded.
    pub fn search_radius(&self, config: &TrackerConfig) -> Option<f32> {
        match self {
            Mode::Tracking => Some(config.tracking_radius),
            Mode::Searching => Some(config.searching_radius),
            Mode::Desperate => config.desperate_radius,
        }
    }

    /// Distance from the prediction beyond which a measurement is discarded;
    /// `None` accepts anything.
    pub fn outlier_threshold(&self, missing_frames: u32, config: &TrackerConfig) -> Option<f32> {
        match self {
            Mode::Tracking => Some(
                config.tracking_outlier_base
                    + config.tracking_outlier_per_miss * missing_frames as f32,
            ),
            Mode::Searching => Some(config.searching_outlier),
            Mode::Desperate => config.desperate_outlier,
        }
    }
}

// ── Kalman filter ─────────────────────────────────────────────────────────────

/// A 2D constant-acceleration Kalman filter.
#[derive(Debug, Clone)]
struct Kalman6D {
    /// State: [x, y, vx, vy, ax, ay]
    x: Vector6<f32>,
    /// State covariance
    p: Matrix6<f32>,
    /// State transition matrix (F)
    f: Matrix6<f32>,
    /// Measurement matrix (H): extracts [x, y] from state
    h: Matrix2x6<f32>,
    /// Process noise covariance (Q)
    q: Matrix6<f32>,
    /// Measurement noise covariance (R)
    r: Matrix2<f32>,
}

impl Kalman6D {
    fn new(x0: f32, y0: f32, cfg: &TrackerConfig) -> Self {
        let x = Vector6::new(x0, y0, 0.0, 0.0, 0.0, 0.0);
        let p = Matrix6::identity() * cfg.initial_covariance;

        let dt = cfg.dt;
        let half_dt2 = 0.5 * dt * dt;
        #[rustfmt::skip]
        let f = Matrix6::from_row_slice(&[
            1.0, 0.0, dt,  0.0, half_dt2, 0.0,
            0.0, 1.0, 0.0, dt,  0.0,      half_dt2,
            0.0, 0.0, 1.0, 0.0, dt,       0.0,
            0.0, 0.0, 0.0, 1.0, 0.0,      dt,
            0.0, 0.0, 0.0, 0.0, 1.0,      0.0,
            0.0, 0.0, 0.0, 0.0, 0.0,      1.0,
        ]);

        let h = Matrix2x6::new(
            1.0, 0.0, 0.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, 0.0, 0.0,
        );

        let mut q = Matrix6::identity() * cfg.process_noise;
        q[(4, 4)] = cfg.accel_noise_x;
        q[(5, 5)] = cfg.accel_noise_y;
        let r = Matrix2::identity() * cfg.measurement_noise;

        Self { x, p, f, h, q, r }
    }

    /// Predict step — advance state one frame.
    fn predict(&mut self) {
        self.x = self.f * self.x;
        self.p = self.f * self.p * self.f.transpose() + self.q;
    }

    /// Update step — incorporate a measurement [x, y].  Returns `false`
    /// and leaves the state untouched when the innovation covariance is
    /// singular.
    fn correct(&mut self, mx: f32, my: f32) -> bool {
        let z = Vector2::new(mx, my);
        let y = z - self.h * self.x; // innovation
        let s = self.h * self.p * self.h.transpose() + self.r;
        let Some(s_inv) = s.try_inverse() else {
            return false;
        };
        let k: Matrix6x2<f32> = self.p * self.h.transpose() * s_inv;
        self.x += k * y;
        self.p = (Matrix6::identity() - k * self.h) * self.p;
        true
    }

    fn position(&self) -> Point {
        Point::new(self.x[0], self.x[1])
    }
    fn velocity(&self) -> (f32, f32) {
        (self.x[2], self.x[3])
    }
    fn acceleration(&self) -> (f32, f32) {
        (self.x[4], self.x[5])
    }
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Axis-aligned table extent used to gate bounces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableBounds {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl TableBounds {
    pub fn from_quad(quad: &CornerQuad) -> Self {
        let (x1, y1, x2, y2) = quad.bounds();
        Self { x1, y1, x2, y2 }
    }

    /// Inclusive containment with margins given as fractions of the extent.
    pub fn contains_with_margin(&self, p: Point, margin_x: f32, margin_y: f32) -> bool {
        let mx = (self.x2 - self.x1) * margin_x;
        let my = (self.y2 - self.y1) * margin_y;
        (self.x1 - mx..=self.x2 + mx).contains(&p.x) && (self.y1 - my..=self.y2 + my).contains(&p.y)
    }
}

/// A detected bounce; appended, never retracted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BounceEvent {
    pub frame_index: u64,
    pub position: Point,
}

/// One trajectory sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackPoint {
    pub frame_index: u64,
    pub position: Point,
    pub predicted: bool,
}

/// Result of one [`BallTracker::update`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackUpdate {
    /// Reported position; `None` while unconfirmed, lost, or coasting too long.
    pub position: Option<Point>,
    /// Estimated velocity (pixels/frame), `None` while uninitialised.
    pub velocity: Option<(f32, f32)>,
    pub acceleration: Option<(f32, f32)>,
    pub is_bounce: bool,
    /// No measurement was folded in this frame.
    pub is_predicted: bool,
    pub mode: Mode,
    pub confirmed: bool,
}

// ── BallTracker ───────────────────────────────────────────────────────────────

pub struct BallTracker {
    config: TrackerConfig,
    kalman: Option<Kalman6D>,
    table: Option<TableBounds>,
    /// Consecutive frames with no accepted measurement.
    missing_frames: u32,
    mode: Mode,
    /// Success flags of the most recent `update` calls.
    window: VecDeque<bool>,
    confirmed: bool,
    /// Consecutive accepted measurements.
    streak: usize,
    /// Set once a confirmed track fills a whole window with successes.
    /// While set, thin windows do not release confirmation; it clears when
    /// a gap outlasts `predicted_display_frames`.
    sustained: bool,
    prev_vy: f32,
    last_bounce_frame: Option<u64>,
    bounces: Vec<BounceEvent>,
    history: VecDeque<TrackPoint>,
}

impl BallTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let window = VecDeque::with_capacity(config.confirm_window);
        Self {
            config,
            kalman: None,
            table: None,
            missing_frames: 0,
            mode: Mode::Tracking,
            window,
            confirmed: false,
            streak: 0,
            sustained: false,
            prev_vy: 0.0,
            last_bounce_frame: None,
            bounces: Vec::new(),
            history: VecDeque::new(),
        }
    }

    /// Tracker with bounce gating enabled for `quad`.
    pub fn with_table(config: TrackerConfig, quad: &CornerQuad) -> Self {
        let mut tracker = Self::new(config);
        tracker.set_table(Some(quad));
        tracker
    }

    /// Table bounds for bounce gating; without them bounces are never
    /// declared.
    pub fn set_table(&mut self, quad: Option<&CornerQuad>) {
        self.table = quad.map(TableBounds::from_quad);
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn missing_frames(&self) -> u32 {
        self.missing_frames
    }

    pub fn is_initialized(&self) -> bool {
        self.kalman.is_some()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Internal position estimate, regardless of confirmation.
    pub fn estimate(&self) -> Option<Point> {
        self.kalman.as_ref().map(Kalman6D::position)
    }

    /// Radius the candidate extractor should search this frame.
    pub fn search_radius(&self) -> Option<f32> {
        self.mode.search_radius(&self.config)
    }

    pub fn bounces(&self) -> &[BounceEvent] {
        &self.bounces
    }

    pub fn history(&self) -> impl Iterator<Item = &TrackPoint> {
        self.history.iter()
    }

    /// Feed the frame's detection (or `None`).
    pub fn update(&mut self, detection: Option<Point>, frame_index: u64) -> TrackUpdate {
        let cfg = &self.config;
        let mut accepted = false;

        match self.kalman.as_mut() {
            None => {
                if let Some(p) = detection {
                    self.kalman = Some(Kalman6D::new(p.x, p.y, cfg));
                    accepted = true;
                    debug!(x = p.x, y = p.y, frame_index, "tracker initialised");
                }
            }
            Some(k) => {
                k.predict();
                if let Some(p) = detection {
                    let dist = k.position().distance(p);
                    match self.mode.outlier_threshold(self.missing_frames, cfg) {
                        Some(limit) if dist > limit => {
                            debug!(dist, limit, frame_index, "measurement rejected as outlier");
                        }
                        _ => {
                            accepted = k.correct(p.x, p.y);
                            if !accepted {
                                debug!(frame_index, "singular innovation, measurement skipped");
                            }
                        }
                    }
                }
            }
        }

        if accepted {
            self.missing_frames = 0;
            self.streak += 1;
        } else {
            if self.kalman.is_some() {
                self.missing_frames += 1;
            }
            self.streak = 0;
            if self.missing_frames > self.config.predicted_display_frames {
                self.sustained = false;
            }
        }
        self.mode = next_mode(self.missing_frames, &self.config);

        if self.kalman.is_some() && self.missing_frames > self.config.max_missing {
            info!(
                missing = self.missing_frames,
                frame_index, "ball lost, tracker reset"
            );
            self.kalman = None;
            self.confirmed = false;
            self.sustained = false;
            self.window.clear();
            self.prev_vy = 0.0;
        }

        self.push_window(accepted);

        let Some(k) = self.kalman.as_ref() else {
            return TrackUpdate {
                position: None,
                velocity: None,
                acceleration: None,
                is_bounce: false,
                is_predicted: false,
                mode: self.mode,
                confirmed: false,
            };
        };

        let pos = k.position();
        let vel = k.velocity();
        let acc = k.acceleration();

        let mut is_bounce = false;
        if accepted {
            is_bounce = self.check_bounce(pos, vel.1, frame_index);
            self.prev_vy = vel.1;
        }

        self.history.push_back(TrackPoint {
            frame_index,
            position: pos,
            predicted: !accepted,
        });
        while self.history.len() > self.config.history_len {
            self.history.pop_front();
        }

        let show = self.confirmed
            && (accepted || self.missing_frames <= self.config.predicted_display_frames);

        TrackUpdate {
            position: show.then_some(pos),
            velocity: Some(vel),
            acceleration: Some(acc),
            is_bounce,
            is_predicted: !accepted,
            mode: self.mode,
            confirmed: self.confirmed,
        }
    }

    /// Forget everything except configuration and table bounds.
    pub fn reset(&mut self) {
        let table = self.table;
        *self = Self::new(self.config.clone());
        self.table = table;
    }

    fn push_window(&mut self, success: bool) {
        let size = self.config.confirm_window.max(1);
        self.window.push_back(success);
        while self.window.len() > size {
            self.window.pop_front();
        }
        let hits = self.window.iter().filter(|&&s| s).count();
        if hits >= self.config.confirm_hits {
            self.confirmed = true;
        } else if self.window.len() == size && hits <= self.config.release_hits && !self.sustained
        {
            self.confirmed = false;
        }
        if self.confirmed && self.streak >= size {
            self.sustained = true;
        }
    }

    fn check_bounce(&mut self, pos: Point, vy: f32, frame_index: u64) -> bool {
        let Some(table) = self.table else {
            return false;
        };
        let cfg = &self.config;
        let gap_ok = self
            .last_bounce_frame
            .map_or(true, |last| frame_index.saturating_sub(last) > cfg.bounce_min_gap);
        let reversed = self.prev_vy > cfg.bounce_min_down_velocity && vy < 0.0;
        let on_table = table.contains_with_margin(pos, cfg.bounce_margin_x, cfg.bounce_margin_y);

        if !(reversed && on_table && gap_ok) {
            return false;
        }
        self.last_bounce_frame = Some(frame_index);
        self.bounces.push(BounceEvent {
            frame_index,
            position: pos,
        });
        info!(frame_index, x = pos.x, y = pos.y, "bounce");
        true
    }
}

impl Default for BallTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

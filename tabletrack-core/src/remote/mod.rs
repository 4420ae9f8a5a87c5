//! remote — optional external corner detector behind a timeout
//!
//! The remote side gets the frame plus a text summary of the locally found
//! surface box and nearby line segments, and answers with free text that
//! should contain `{"corners": [[x,y] ×4], "net_y": y}`. Its answer is
//! parsed leniently, checked against the local surface and the geometry
//! validator, and dropped on any doubt.

use std::fmt::Write as _;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::{Frame, Region};
use crate::geometry::{CornerQuad, GeometryValidator, Point, Segment};
use crate::table::bands::classify;
use crate::table::masks::line_mask;
use crate::table::segments::{accumulate_segments, SegmentDetector};
use crate::table::surface::SurfaceColorLocator;

/// Segments listed per orientation in the scene description.
const MAX_LISTED_LINES: usize = 10;
const MAX_LISTED_DIAGONALS: usize = 6;

// ── Contract ─────────────────────────────────────────────────────────────────

/// What the remote detector is shown.
#[derive(Debug, Clone)]
pub struct RemoteRequest {
    pub frame: Arc<Frame>,
    /// Locally located surface box, if any.
    pub surface: Option<Region>,
    pub description: String,
}

/// An external service that proposes table corners. Implementations may
/// block; callers go through [`guarded_detect`].
pub trait RemoteCornerDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Raw reply text.
    fn query(&self, request: &RemoteRequest) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteReply {
    /// As given, expected TL, TR, BR, BL.
    pub corners: [Point; 4],
    pub net_y: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub timeout_secs: f64,
    pub validator: RemoteValidator,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 90.0,
            validator: RemoteValidator::default(),
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }
}

// ── Request ──────────────────────────────────────────────────────────────────

/// Summarise the frame for a text-only detector: surface box and the
/// longest horizontal, vertical and diagonal segments around it.
pub fn describe(frame: &Frame) -> RemoteRequest {
    let (w, h) = (frame.width, frame.height);
    let hsv = frame.hsv();
    let surface = SurfaceColorLocator::default().locate(&hsv);

    let mut text = String::new();
    let _ = writeln!(text, "Frame: {w}x{h} pixels.");
    let Some(s) = surface else {
        let _ = writeln!(text, "No table surface colour found.");
        return RemoteRequest {
            frame: Arc::new(frame.clone()),
            surface,
            description: text,
        };
    };

    let (sw, sh) = (s.width() as f32, s.height() as f32);
    let _ = writeln!(
        text,
        "Table surface colour at x=[{},{}] y=[{},{}] ({}x{}).",
        s.x0,
        s.x1,
        s.y0,
        s.y1,
        s.width(),
        s.height()
    );
    let zone = Region::clamped(
        s.x0 as f32 - 0.20 * sw,
        s.y0 as f32 - 0.30 * sh,
        s.x1 as f32 + 0.20 * sw,
        s.y1 as f32 + 0.30 * sh,
        w,
        h,
    );
    let _ = writeln!(
        text,
        "Corners must lie within x=[{},{}] y=[{},{}].",
        zone.x0, zone.x1, zone.y0, zone.y1
    );

    let mask = line_mask(&hsv);
    let side = sw.min(sh);
    let segments = SegmentDetector::new(&mask, zone)
        .map(|d| accumulate_segments(&d, &[40, 25, 15], (side / 5.0).max(20.0), (side / 8.0).max(12.0), 25))
        .unwrap_or_default();
    let (mut horizontal, mut vertical) = classify(&segments, 25.0, 55.0);
    let mut diagonal: Vec<Segment> = segments
        .iter()
        .filter(|s| (25.0..=55.0).contains(&s.angle_deg()))
        .copied()
        .collect();
    for (label, list, cap) in [
        ("Horizontal", &mut horizontal, MAX_LISTED_LINES),
        ("Vertical", &mut vertical, MAX_LISTED_LINES),
        ("Diagonal", &mut diagonal, MAX_LISTED_DIAGONALS),
    ] {
        if list.is_empty() {
            continue;
        }
        list.sort_by(|a, b| b.length().total_cmp(&a.length()));
        let _ = writeln!(text, "{label} lines:");
        for (i, seg) in list.iter().take(cap).enumerate() {
            let _ = writeln!(
                text,
                "  L{i}: ({:.0},{:.0})->({:.0},{:.0}) len={:.0} angle={:.1}",
                seg.a.x,
                seg.a.y,
                seg.b.x,
                seg.b.y,
                seg.length(),
                seg.angle_deg()
            );
        }
    }
    let _ = writeln!(
        text,
        r#"Reply with JSON only: {{"corners": [[x,y],[x,y],[x,y],[x,y]], "net_y": y}} (top-left, top-right, bottom-right, bottom-left)."#
    );

    RemoteRequest {
        frame: Arc::new(frame.clone()),
        surface,
        description: text,
    }
}

// ── Reply parsing ────────────────────────────────────────────────────────────

/// Corners and net row from free-form reply text.
///
/// Reasoning blocks (`<think>…</think>`) are stripped, then the first
/// balanced `{…}` object is read as JSON. Failing that, the first eight
/// numbers in the text are taken as four `x, y` pairs.
pub fn parse_reply(text: &str) -> Option<RemoteReply> {
    let text = strip_think(text);
    if let Some(reply) = first_json_object(&text)
        .and_then(|obj| serde_json::from_str::<Value>(obj).ok())
        .and_then(|v| reply_from_json(&v))
    {
        return Some(reply);
    }

    let numbers = scrape_numbers(&text);
    if numbers.len() < 8 {
        return None;
    }
    let corners = [0, 1, 2, 3].map(|i| Point::new(numbers[2 * i], numbers[2 * i + 1]));
    Some(RemoteReply {
        corners,
        net_y: None,
    })
}

fn reply_from_json(v: &Value) -> Option<RemoteReply> {
    let list = v.get("corners")?.as_array()?;
    if list.len() < 4 {
        return None;
    }
    let mut corners = [Point::default(); 4];
    for (slot, item) in corners.iter_mut().zip(list) {
        let pair = item.as_array()?;
        let x = number(pair.first()?)?;
        let y = number(pair.get(1)?)?;
        *slot = Point::new(x, y);
    }
    let net_y = v
        .get("net_y")
        .or_else(|| v.get("net_y_pixel"))
        .and_then(number);
    Some(RemoteReply { corners, net_y })
}

/// JSON number, or a string holding one.
fn number(v: &Value) -> Option<f32> {
    match v {
        Value::Number(n) => n.as_f64().map(|f| f as f32),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn strip_think(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<think>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</think>") {
            Some(end) => rest = &rest[start + end + "</think>".len()..],
            None => {
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (i, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Unsigned decimal numbers in order of appearance.
fn scrape_numbers(text: &str) -> Vec<f32> {
    let mut out = Vec::new();
    let mut current = String::new();
    for c in text.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_digit() || (c == '.' && !current.is_empty() && !current.contains('.')) {
            current.push(c);
        } else if !current.is_empty() {
            if let Ok(v) = current.trim_end_matches('.').parse() {
                out.push(v);
            }
            current.clear();
        }
    }
    out
}

// ── Validation ───────────────────────────────────────────────────────────────

/// Consistency checks between a remote answer and the local surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteValidator {
    /// Max distance from the surface centre, as a fraction of its longer side.
    pub center_tolerance: f32,
    pub max_width_fraction: f32,
    pub max_height_fraction: f32,
    pub min_width_ratio: f32,
    pub max_width_ratio: f32,
    pub min_height: f32,
    pub geometry: GeometryValidator,
}

impl Default for RemoteValidator {
    fn default() -> Self {
        Self {
            center_tolerance: 0.6,
            max_width_fraction: 0.70,
            max_height_fraction: 0.55,
            min_width_ratio: 0.25,
            max_width_ratio: 2.5,
            min_height: 10.0,
            geometry: GeometryValidator::default(),
        }
    }
}

impl RemoteValidator {
    /// `Ok` with the ordered quad, or the reason it was refused.
    pub fn check(&self, reply: &RemoteReply, surface: Option<Region>, width: u32, height: u32) -> Result<CornerQuad> {
        let [c0, c1, _, c3] = reply.corners;
        ensure!(reply.corners.iter().all(Point::is_finite), "non-finite corner");
        let tw = c0.distance(c1);
        let th = c0.distance(c3);
        ensure!(
            tw <= self.max_width_fraction * width as f32 && th <= self.max_height_fraction * height as f32,
            "size {tw:.0}x{th:.0} too large for frame"
        );
        ensure!(th >= self.min_height, "height {th:.0} too small");

        if let Some(s) = surface {
            let (sw, sh) = (s.width() as f32, s.height() as f32);
            let centre = Point::new((s.x0 + s.x1) as f32 / 2.0, (s.y0 + s.y1) as f32 / 2.0);
            let quad_centre = Point::new(
                reply.corners.iter().map(|p| p.x).sum::<f32>() / 4.0,
                reply.corners.iter().map(|p| p.y).sum::<f32>() / 4.0,
            );
            let dist = quad_centre.distance(centre);
            ensure!(
                dist <= self.center_tolerance * sw.max(sh),
                "centre {dist:.0}px from surface centre"
            );
            let ratio = tw / (sw + 1.0);
            ensure!(
                (self.min_width_ratio..=self.max_width_ratio).contains(&ratio),
                "width {tw:.0} vs surface {sw:.0} mismatch"
            );
        }

        let quad = CornerQuad::from_unordered(reply.corners);
        ensure!(
            self.geometry.validate(&quad, width, height),
            "failed geometry validation"
        );
        Ok(quad)
    }
}

// ── Guarded call ─────────────────────────────────────────────────────────────

/// Query `detector` on a worker thread, give up after `timeout`, and parse
/// the reply. Every failure mode comes back as an `Err`.
pub fn guarded_detect(
    detector: Arc<dyn RemoteCornerDetector>,
    request: RemoteRequest,
    timeout: Duration,
) -> Result<RemoteReply> {
    let name = detector.name().to_string();
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("remote-{name}"))
        .spawn(move || {
            let _ = tx.send(detector.query(&request));
        })
        .context("failed to spawn remote detector thread")?;

    let text = rx
        .recv_timeout(timeout)
        .map_err(|e| anyhow!("remote detector {name} gave no answer: {e}"))?
        .with_context(|| format!("remote detector {name} failed"))?;
    parse_reply(&text).with_context(|| format!("unparseable reply from {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::{Rgb, RgbImage};

    struct Canned(&'static str);

    impl RemoteCornerDetector for Canned {
        fn name(&self) -> &str {
            "canned"
        }
        fn query(&self, _request: &RemoteRequest) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Sleepy;

    impl RemoteCornerDetector for Sleepy {
        fn name(&self) -> &str {
            "sleepy"
        }
        fn query(&self, _request: &RemoteRequest) -> Result<String> {
            thread::sleep(Duration::from_millis(500));
            Ok(String::new())
        }
    }

    fn request() -> RemoteRequest {
        let frame = Frame::from_image(RgbImage::from_pixel(64, 36, Rgb([0, 0, 0])), 0);
        describe(&frame)
    }

    #[test]
    fn parses_json_after_reasoning() {
        let text = r#"<think>the {table} is blue</think>
            Sure: {"corners": [[100, 50], [300, 52], [320, 150], [90, 148]], "net_y": "101"}"#;
        let reply = parse_reply(text).unwrap();
        assert_eq!(reply.corners[1], Point::new(300.0, 52.0));
        assert_abs_diff_eq!(reply.net_y.unwrap(), 101.0);
    }

    #[test]
    fn falls_back_to_number_pairs() {
        let reply = parse_reply("TL (10, 20) TR (110,20) BR [110 70] BL 10,70.5").unwrap();
        assert_eq!(reply.corners[3], Point::new(10.0, 70.5));
        assert_eq!(reply.net_y, None);
        assert!(parse_reply("no idea").is_none());
    }

    #[test]
    fn validator_checks_surface_consistency() {
        let v = RemoteValidator::default();
        let surface = Some(Region { x0: 200, y0: 150, x1: 440, y1: 250 });
        let good = RemoteReply {
            corners: [
                Point::new(190.0, 145.0),
                Point::new(450.0, 145.0),
                Point::new(450.0, 255.0),
                Point::new(190.0, 255.0),
            ],
            net_y: Some(200.0),
        };
        assert!(v.check(&good, surface, 640, 360).is_ok());

        let shifted = RemoteReply {
            corners: good.corners.map(|p| Point::new(p.x - 180.0, p.y)),
            ..good
        };
        let err = v.check(&shifted, surface, 640, 360).unwrap_err();
        assert!(err.to_string().contains("surface centre"), "{err}");

        let flat = RemoteReply {
            corners: [
                Point::new(190.0, 195.0),
                Point::new(450.0, 195.0),
                Point::new(450.0, 200.0),
                Point::new(190.0, 200.0),
            ],
            net_y: None,
        };
        assert!(v.check(&flat, surface, 640, 360).is_err());
    }

    #[test]
    fn guarded_call_returns_parsed_reply() {
        let detector: Arc<dyn RemoteCornerDetector> =
            Arc::new(Canned(r#"{"corners": [[1,2],[3,4],[5,6],[7,8]]}"#));
        let reply = guarded_detect(detector, request(), Duration::from_secs(5)).unwrap();
        assert_eq!(reply.corners[3], Point::new(7.0, 8.0));
    }

    #[test]
    fn guarded_call_times_out() {
        let detector: Arc<dyn RemoteCornerDetector> = Arc::new(Sleepy);
        let err = guarded_detect(detector, request(), Duration::from_millis(20)).unwrap_err();
        assert!(err.to_string().contains("no answer"), "{err}");
    }

    #[test]
    fn description_mentions_frame_size() {
        assert!(request().description.starts_with("Frame: 64x36"));
    }
}

//! Fixed-rate capture → analysis → classify → publish loop (C5).
//!
//! This is the one component allowed to own unsynchronized mutable
//! state (`prev_gray`, the EMA, the grace-window deque) because it is
//! the only thread that ever touches it, per the design notes'
//! "EMA and grace deque live only in the monitor thread."

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use thiserror::Error;

use crate::capture::audio::AudioMeter;
use crate::capture::recorder::Recorder;
use crate::capture::{Capturer, Frame, Region};
use crate::config::MotionConfig;
use crate::error::{CaptureError, ProcessError};
use crate::store::StatusStore;

/// Per-tick failure, recovered by publishing an error payload (§7).
#[derive(Debug, Error)]
enum TickError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Process(#[from] ProcessError),
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// BT.601 integer approximation, 16-bit intermediates, `>> 8` at the end.
fn grayscale(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity((frame.width * frame.height) as usize);
    for px in frame.data.chunks_exact(4) {
        let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
        let y = (77 * r + 150 * g + 29 * b) >> 8;
        out.push(y as u8);
    }
    out
}

/// Crops `inset` pixels from each side; returns the full image unchanged
/// if the inset would eliminate it.
fn inset_crop(gray: &[u8], w: u32, h: u32, inset: u32) -> (Vec<u8>, u32, u32) {
    if inset * 2 >= w || inset * 2 >= h {
        return (gray.to_vec(), w, h);
    }
    let nw = w - inset * 2;
    let nh = h - inset * 2;
    let mut out = Vec::with_capacity((nw * nh) as usize);
    for y in inset..(inset + nh) {
        let row_start = (y * w + inset) as usize;
        out.extend_from_slice(&gray[row_start..row_start + nw as usize]);
    }
    (out, nw, nh)
}

fn diff_image(prev: &[u8], cur: &[u8]) -> Vec<u8> {
    prev.iter()
        .zip(cur.iter())
        .map(|(&p, &c)| (p as i16 - c as i16).unsigned_abs() as u8)
        .collect()
}

/// Leading horizontal bands of height `tile_h` whose mean is exactly 0,
/// counted up to `min(5, rows - 1)`.
fn dead_row_count(diff: &[u8], w: u32, h: u32, rows: u32) -> u32 {
    let tile_h = (h / rows.max(1)).max(1);
    let cap = 5.min(rows.saturating_sub(1));
    let mut dead = 0;
    while dead < cap {
        let y0 = dead * tile_h;
        let y1 = (y0 + tile_h).min(h);
        if y0 >= y1 {
            break;
        }
        let band = &diff[(y0 * w) as usize..(y1 * w) as usize];
        if band.iter().any(|&v| v != 0) {
            break;
        }
        dead += 1;
    }
    dead
}

/// `edges[i] = round(i * size / parts)`, endpoints forced, monotonic fixup.
fn rounded_proportional_edges(size: u32, parts: u32) -> Vec<u32> {
    let parts = parts.max(1);
    let mut edges: Vec<u32> = (0..=parts)
        .map(|i| ((i as f64) * (size as f64) / (parts as f64)).round() as u32)
        .collect();
    edges[0] = 0;
    *edges.last_mut().unwrap() = size;
    for i in 1..edges.len() {
        if edges[i] < edges[i - 1] {
            edges[i] = edges[i - 1];
        }
    }
    edges
}

/// Rect actually analyzed after `analysis_inset_px` cropping, or the full
/// frame rect when the inset was too large to apply.
fn inset_rect_json(frame_w: u32, frame_h: u32, gw: u32, gh: u32, inset: u32) -> Value {
    if gw == frame_w && gh == frame_h {
        json!({"x": 0, "y": 0, "width": gw, "height": gh})
    } else {
        json!({"x": inset, "y": inset, "width": gw, "height": gh})
    }
}

/// Mean of the first three `tile_h`-tall horizontal bands of the diff
/// image, in raw 0-255 scale -- the same bands the dead-row heuristic
/// inspects, kept for `video.debug` diagnostics.
fn band_means_u8(diff: &[u8], w: u32, h: u32, rows: u32) -> [f64; 3] {
    let tile_h = (h / rows.max(1)).max(1);
    let band_mean = |i: u32| -> f64 {
        let y0 = i * tile_h;
        let y1 = (y0 + tile_h).min(h);
        if y0 >= h || y1 <= y0 {
            return 0.0;
        }
        let band = &diff[(y0 * w) as usize..(y1 * w) as usize];
        band.iter().map(|&v| v as f64).sum::<f64>() / band.len() as f64
    };
    [band_mean(0), band_mean(1), band_mean(2)]
}

/// Row-major tile means of `mean(tile) / 255`, zero for an empty tile.
fn tile_means(diff: &[u8], w: u32, row_edges: &[u32], col_edges: &[u32]) -> Vec<f64> {
    let rows = row_edges.len() - 1;
    let cols = col_edges.len() - 1;
    let mut out = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let (y0, y1) = (row_edges[r], row_edges[r + 1]);
        for c in 0..cols {
            let (x0, x1) = (col_edges[c], col_edges[c + 1]);
            if y1 <= y0 || x1 <= x0 {
                out.push(0.0);
                continue;
            }
            let mut sum: u64 = 0;
            let mut count: u64 = 0;
            for y in y0..y1 {
                let row_start = (y * w + x0) as usize;
                let row_end = (y * w + x1) as usize;
                for &v in &diff[row_start..row_end] {
                    sum += v as u64;
                    count += 1;
                }
            }
            out.push(if count == 0 { 0.0 } else { (sum as f64 / count as f64) / 255.0 });
        }
    }
    out
}

fn topk_mean(values: &[f64], k: usize) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
    let k = k.min(sorted.len());
    sorted[..k].iter().sum::<f64>() / k as f64
}

/// Monotonic in distance from the threshold bands; 0 under invalid
/// ordering (`low_thr <= no_thr` or `no_thr <= 0`) — kept exactly as the
/// source behaves rather than promoted to a config error.
fn confidence_from_thresholds(ema: f64, no_thr: f64, low_thr: f64) -> f64 {
    if low_thr <= no_thr || no_thr <= 0.0 {
        return 0.0;
    }
    if ema < no_thr {
        return clamp01((no_thr - ema) / no_thr);
    }
    if ema < low_thr {
        let mid = (no_thr + low_thr) / 2.0;
        let half = (low_thr - no_thr) / 2.0;
        return clamp01(1.0 - (ema - mid).abs() / half);
    }
    clamp01((ema - low_thr) / (1.0 - low_thr).max(f64::EPSILON))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BaseState {
    NoMotion,
    LowActivity,
    Motion,
    AllTilesDisabled,
    Error,
}

impl BaseState {
    fn as_str(&self) -> &'static str {
        match self {
            BaseState::NoMotion => "NO_MOTION",
            BaseState::LowActivity => "LOW_ACTIVITY",
            BaseState::Motion => "MOTION",
            BaseState::AllTilesDisabled => "ALL_TILES_DISABLED",
            BaseState::Error => "ERROR",
        }
    }
}

/// Suffixes the base label with the audio annotation; leaves
/// `ALL_TILES_DISABLED`/`ERROR` unsuffixed since they short-circuit
/// before the audio-annotation step in the design's tick sequence.
fn labeled_state(base: BaseState, audio_available: bool, audio_detected: bool, left: f64, right: f64) -> String {
    match base {
        BaseState::AllTilesDisabled | BaseState::Error => base.as_str().to_string(),
        _ => {
            let suffix = if !audio_available {
                "_NOSOUNDHARDWARE"
            } else if audio_detected || left.max(right) > 1.0 {
                "_WITH_AUDIO"
            } else {
                "_NO_AUDIO"
            };
            format!("{}{}", base.as_str(), suffix)
        }
    }
}

struct RunState {
    prev_gray: Option<(u32, u32, Vec<u8>)>,
    ema: f64,
    grace: VecDeque<(Instant, bool)>,
}

impl RunState {
    fn new() -> Self {
        RunState {
            prev_gray: None,
            ema: 0.0,
            grace: VecDeque::new(),
        }
    }

    fn reset(&mut self) {
        self.ema = 0.0;
        self.grace.clear();
    }
}

pub struct MonitorLoop {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorLoop {
    pub fn new() -> Self {
        MonitorLoop {
            stop: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        capturer: Arc<dyn Capturer>,
        audio: Arc<AudioMeter>,
        store: Arc<StatusStore>,
        recorder: Arc<Recorder>,
        region: Arc<Mutex<Region>>,
        motion: MotionConfig,
        fps: f64,
    ) {
        self.stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::Builder::new()
            .name("monitor-loop".to_string())
            .spawn(move || run(capturer, audio, store, recorder, region, motion, fps, stop))
            .expect("failed to spawn monitor loop thread");
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let deadline = Instant::now() + Duration::from_secs(1);
            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }
}

impl Default for MonitorLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    capturer: Arc<dyn Capturer>,
    audio: Arc<AudioMeter>,
    store: Arc<StatusStore>,
    recorder: Arc<Recorder>,
    region: Arc<Mutex<Region>>,
    motion: MotionConfig,
    fps: f64,
    stop: Arc<AtomicBool>,
) {
    let period = Duration::from_secs_f64(1.0 / fps.max(1.0));
    let mut state = RunState::new();

    while !stop.load(Ordering::SeqCst) {
        let t0 = Instant::now();
        let region_snapshot = *region.lock().unwrap();

        match tick(&capturer, &audio, &store, &motion, region_snapshot, &mut state) {
            Ok((payload, labeled, frame, feed_recorder)) => {
                store.set_latest(payload);
                if feed_recorder {
                    recorder.on_tick(&frame, &labeled, t0);
                }
            }
            Err(err) => {
                let message = err.to_string();
                store.set_latest(json!({
                    "timestamp": std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs_f64(),
                    "capture": {"state": "ERROR", "reason": message, "backend": "GDI"},
                    "video": {"state": "ERROR", "stale": true, "grid": {"rows": 1, "cols": 1}, "tiles": [0.0]},
                    "audio": {"available": false, "left": 0.0, "right": 0.0, "detected": false, "reason": "error"},
                    "overall": {"state": "NOT_OK", "reasons": ["capture_error"]},
                    "errors": [message],
                    "region": {"x": region_snapshot.x, "y": region_snapshot.y, "width": region_snapshot.width, "height": region_snapshot.height},
                }));
            }
        }

        let elapsed = t0.elapsed();
        if elapsed < period {
            let mut remaining = period - elapsed;
            while remaining > Duration::ZERO && !stop.load(Ordering::SeqCst) {
                let chunk = remaining.min(Duration::from_millis(20));
                std::thread::sleep(chunk);
                remaining = remaining.saturating_sub(chunk);
            }
        }
    }

    capturer.release_thread_resources();
}

type TickOk = (Value, String, Frame, bool);

fn tick(
    capturer: &Arc<dyn Capturer>,
    audio: &Arc<AudioMeter>,
    store: &Arc<StatusStore>,
    motion: &MotionConfig,
    region: Region,
    state: &mut RunState,
) -> Result<TickOk, TickError> {
    let desktop = Region::new(0, 0, u32::MAX / 4, u32::MAX / 4);
    let clamped = crate::capture::clamp_to_desktop(region, desktop)?;
    let frame = capturer.grab(clamped)?;

    let gray = grayscale(&frame);
    let (gray, gw, gh) = inset_crop(&gray, frame.width, frame.height, motion.analysis_inset_px);

    let region_json = json!({"x": region.x, "y": region.y, "width": region.width, "height": region.height});
    let audio_sample = audio.latest();
    let inset_rect = inset_rect_json(frame.width, frame.height, gw, gh, motion.analysis_inset_px);

    if state.prev_gray.as_ref().is_none_or(|(w, h, _)| *w != gw || *h != gh) {
        state.prev_gray = Some((gw, gh, gray));
        state.reset();
        let (rows, cols) = store.grid();
        let len = (rows * cols) as usize;
        let mut payload = json!({
            "timestamp": std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs_f64(),
            "capture": {"state": "OK", "reason": "", "backend": "GDI"},
            "video": {
                "state": "ERROR",
                "confidence": 0.0,
                "motion_mean": 0.0,
                "motion_instant_mean": 0.0,
                "motion_instant_top1": 0.0,
                "motion_instant_activity": 0.0,
                "grid": {"rows": rows, "cols": cols},
                "tiles": vec![0.0; len],
                "stale": false,
                "stale_age_sec": 0.0,
            },
            "audio": audio_json(&audio_sample),
            "overall": {"state": "NOT_OK", "reasons": ["warming_up"]},
            "errors": [],
            "region": region_json,
        });
        if motion.debug {
            payload["video"]["debug"] = json!({"analysis_inset_rect": inset_rect});
        }
        return Ok((payload, "ERROR".to_string(), frame, true));
    }

    let (_, _, prev) = state.prev_gray.as_ref().unwrap();
    let diff_full = diff_image(prev, &gray);
    state.prev_gray = Some((gw, gh, gray));

    let (rows, cols) = store.grid();
    let dead = dead_row_count(&diff_full, gw, gh, rows);
    let bands_u8 = motion.debug.then(|| band_means_u8(&diff_full, gw, gh, rows));
    let tile_h = (gh / rows.max(1)).max(1);
    let crop_rows = dead * tile_h;
    let (diff_roi, roi_h) = if crop_rows > 0 && crop_rows < gh {
        (diff_full[(crop_rows * gw) as usize..].to_vec(), gh - crop_rows)
    } else {
        (diff_full, gh)
    };

    let row_edges = rounded_proportional_edges(roi_h, rows);
    let col_edges = rounded_proportional_edges(gw, cols);
    let tile_raw = tile_means(&diff_roi, gw, &row_edges, &col_edges);

    if motion.mean_full_scale <= 0.0 {
        return Err(ProcessError::NonPositiveScale("mean_full_scale").into());
    }
    if motion.tile_full_scale <= 0.0 {
        return Err(ProcessError::NonPositiveScale("tile_full_scale").into());
    }

    let mean_raw_full = if diff_roi.is_empty() {
        0.0
    } else {
        diff_roi.iter().map(|&v| v as f64).sum::<f64>() / diff_roi.len() as f64 / 255.0
    };
    let mean_raw = (mean_raw_full * motion.diff_gain).min(1.0);
    let mean_norm = clamp01(mean_raw / motion.mean_full_scale);
    let tile_norm: Vec<f64> = tile_raw.iter().map(|&t| clamp01(t / motion.tile_full_scale)).collect();

    let disabled = store.get_disabled_tiles();
    let enabled_values: Vec<f64> = tile_norm
        .iter()
        .enumerate()
        .filter(|(i, _)| !disabled.contains(&(*i as u32)))
        .map(|(_, &v)| v)
        .collect();

    let tiles_json: Vec<Value> = tile_norm
        .iter()
        .enumerate()
        .map(|(i, &v)| if disabled.contains(&(i as u32)) { Value::Null } else { json!(v) })
        .collect();

    if enabled_values.is_empty() {
        state.reset();
        let mut payload = json!({
            "timestamp": std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs_f64(),
            "capture": {"state": "OK", "reason": "", "backend": "GDI"},
            "video": {
                "state": "ALL_TILES_DISABLED",
                "confidence": 0.0,
                "motion_mean": 0.0,
                "motion_instant_mean": mean_norm,
                "motion_instant_top1": 0.0,
                "motion_instant_activity": 0.0,
                "grid": {"rows": rows, "cols": cols},
                "tiles": tiles_json,
                "stale": false,
                "stale_age_sec": 0.0,
            },
            "audio": audio_json(&audio_sample),
            "overall": {"state": "OK", "reasons": ["all_tiles_disabled"]},
            "errors": [],
            "region": region_json,
        });
        if let Some(bands_u8) = bands_u8 {
            payload["video"]["debug"] = json!({
                "analysis_inset_px": motion.analysis_inset_px,
                "analysis_inset_rect": inset_rect,
                "bands_u8": bands_u8,
                "dead_top_tile_rows": dead,
                "diff_roi_rect": {"x": 0, "y": crop_rows, "width": gw, "height": roi_h},
            });
        }
        return Ok((payload, "ALL_TILES_DISABLED".to_string(), frame, false));
    }

    let instant_mean = enabled_values.iter().sum::<f64>() / enabled_values.len() as f64;
    let instant_top1 = enabled_values.iter().cloned().fold(f64::MIN, f64::max);
    let instant_activity = topk_mean(&enabled_values, 3);
    state.ema = motion.ema_alpha * instant_activity + (1.0 - motion.ema_alpha) * state.ema;

    let no_candidate = instant_top1 < motion.no_motion_threshold;
    let now = Instant::now();
    let is_no_motion = if motion.no_motion_grace_period_seconds <= 0.0 {
        no_candidate
    } else {
        state.grace.push_back((now, no_candidate));
        let cutoff = now - Duration::from_secs_f64(motion.no_motion_grace_period_seconds);
        while state.grace.front().is_some_and(|(t, _)| *t < cutoff) {
            state.grace.pop_front();
        }
        let n = state.grace.len() as f64;
        let k = state.grace.iter().filter(|(_, v)| *v).count() as f64;
        n > 0.0 && (k / n) >= motion.no_motion_grace_required_ratio
    };

    let base = if is_no_motion {
        BaseState::NoMotion
    } else if state.ema < motion.low_activity_threshold {
        BaseState::LowActivity
    } else {
        BaseState::Motion
    };

    let confidence = confidence_from_thresholds(state.ema, motion.no_motion_threshold, motion.low_activity_threshold);
    let labeled = labeled_state(
        base,
        audio_sample.available,
        audio_sample.detected,
        audio_sample.left,
        audio_sample.right,
    );

    let overall = if base == BaseState::Motion {
        json!({"state": "OK", "reasons": []})
    } else {
        json!({"state": "NOT_OK", "reasons": ["no_motion_enabled_tiles"]})
    };

    let mut payload = json!({
        "timestamp": std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs_f64(),
        "capture": {"state": "OK", "reason": "", "backend": "GDI"},
        "video": {
            "state": labeled,
            "confidence": confidence,
            "motion_mean": state.ema,
            "motion_instant_mean": instant_mean,
            "motion_instant_top1": instant_top1,
            "motion_instant_activity": instant_activity,
            "grid": {"rows": rows, "cols": cols},
            "tiles": tiles_json,
            "stale": false,
            "stale_age_sec": 0.0,
        },
        "audio": audio_json(&audio_sample),
        "overall": overall,
        "errors": [],
        "region": region_json,
    });
    if let Some(bands_u8) = bands_u8 {
        payload["video"]["debug"] = json!({
            "analysis_inset_px": motion.analysis_inset_px,
            "analysis_inset_rect": inset_rect,
            "bands_u8": bands_u8,
            "dead_top_tile_rows": dead,
            "diff_roi_rect": {"x": 0, "y": crop_rows, "width": gw, "height": roi_h},
        });
    }

    Ok((payload, labeled.clone(), frame, true))
}

fn audio_json(sample: &crate::capture::audio::AudioSample) -> Value {
    json!({
        "available": sample.available,
        "left": sample.left,
        "right": sample.right,
        "detected": sample.detected,
        "reason": sample.reason,
    })
}

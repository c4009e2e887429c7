//! MP4 clip recording on trigger match (C3).
//!
//! Frames flow through a pre-roll ring, a trigger/cooldown state machine,
//! and a bounded command FIFO into a dedicated encoder worker thread —
//! the same "coroutine-like control becomes a worker thread + bounded
//! channel" shape the teacher uses around its `windows_capture` encoder
//! in `capture/recorder.rs`, generalized here with an explicit pre-roll
//! buffer and a yellow issue-border marker.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use image::{ImageBuffer, Rgba};

use crate::capture::Frame;
use crate::config::RecordingConfig;
use crate::error::RecorderError;

const ISSUE_BORDER_PX: u32 = 4;
// BGRA byte order, stored as `image::Rgba` purely as a 4-channel-u8
// container -- this frame format never goes through `image`'s color
// conversions, so the channel label doesn't matter, only the bytes.
const YELLOW_BGRA: [u8; 4] = [0, 255, 255, 255];

/// An owned, border-stamped copy of a captured frame plus whether it
/// was captured while the trigger condition was active.
#[derive(Clone)]
struct OwnedFrame {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

fn stamp_border(frame: &Frame, issue_active: bool) -> OwnedFrame {
    if !issue_active {
        return OwnedFrame {
            width: frame.width,
            height: frame.height,
            data: frame.data.clone(),
        };
    }

    let w = frame.width;
    let h = frame.height;
    let mut img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_vec(w, h, frame.data.clone())
        .expect("frame buffer length matches width * height * 4");
    let thickness = ISSUE_BORDER_PX.min(w / 2).min(h / 2);
    let yellow = Rgba(YELLOW_BGRA);

    for y in 0..h {
        for t in 0..thickness {
            img.put_pixel(t, y, yellow);
            img.put_pixel(w - 1 - t, y, yellow);
        }
    }
    for x in 0..w {
        for t in 0..thickness {
            img.put_pixel(x, t, yellow);
            img.put_pixel(x, h - 1 - t, yellow);
        }
    }

    OwnedFrame {
        width: w,
        height: h,
        data: img.into_raw(),
    }
}

enum EncoderCommand {
    Start { path: PathBuf, fps: f64, pre_roll: Vec<OwnedFrame> },
    Frame(OwnedFrame),
    Stop,
    Shutdown,
}

/// Parses the comma-separated `recording.trigger_state` list into
/// uppercased prefixes and matches a classifier state against them.
/// A state matches a prefix if it equals the prefix or starts with
/// `"{prefix}_"` (so `"NO_MOTION"` matches both `"NO_MOTION"` and
/// `"NO_MOTION_WITH_AUDIO"`).
fn trigger_prefixes(trigger_state: &str) -> Vec<String> {
    trigger_state
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn state_matches(state: &str, prefixes: &[String]) -> bool {
    prefixes
        .iter()
        .any(|p| state == p || state.starts_with(&format!("{p}_")))
}

enum SessionState {
    Idle,
    Active { post_roll_deadline: Option<Instant> },
}

pub struct Recorder {
    config: RecordingConfig,
    fps: f64,
    pre_roll_cap: usize,
    pre_roll: Mutex<VecDeque<OwnedFrame>>,
    session: Mutex<SessionState>,
    /// Start time of the most recently started session; cooldown is
    /// measured from here, not from the previous session's stop, so a
    /// long session never extends the gap before the next allowed start.
    last_start_ts: Mutex<Option<Instant>>,
    tx: Mutex<Option<SyncSender<EncoderCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl Recorder {
    pub fn new(config: RecordingConfig, fps: f64) -> Self {
        let pre_roll_frames = (fps * config.pre_roll_seconds).ceil() as usize;
        Recorder {
            config,
            fps,
            pre_roll_cap: pre_roll_frames,
            pre_roll: Mutex::new(VecDeque::with_capacity(pre_roll_frames.max(1))),
            session: Mutex::new(SessionState::Idle),
            last_start_ts: Mutex::new(None),
            tx: Mutex::new(None),
            worker: Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    fn channel_bound(&self) -> usize {
        (4 * self.pre_roll_cap).max(120)
    }

    fn ensure_worker(&self) -> SyncSender<EncoderCommand> {
        let mut tx_guard = self.tx.lock().unwrap();
        if let Some(tx) = tx_guard.as_ref() {
            return tx.clone();
        }
        let (tx, rx) = mpsc::sync_channel::<EncoderCommand>(self.channel_bound());
        let last_error = Arc::clone(&self.last_error);
        let handle = std::thread::Builder::new()
            .name("clip-encoder".to_string())
            .spawn(move || platform::run_encoder_worker(rx, last_error))
            .expect("failed to spawn clip encoder worker thread");
        *tx_guard = Some(tx.clone());
        *self.worker.lock().unwrap() = Some(handle);
        tx
    }

    /// Drops the command on a full queue rather than blocking the monitor
    /// loop -- the encoder falling behind capture.fps should never stall
    /// the rest of the pipeline.
    fn send(&self, tx: &SyncSender<EncoderCommand>, cmd: EncoderCommand) {
        if let Err(TrySendError::Disconnected(_)) = tx.try_send(cmd) {
            *self.tx.lock().unwrap() = None;
        }
    }

    fn clip_path(&self) -> PathBuf {
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        PathBuf::from(&self.config.assets_dir).join(format!("nomotion_{stamp}.mp4"))
    }

    /// Feed one tick's frame and classifier state. Called once per
    /// monitor iteration in capture order. The pre-roll ring is always
    /// topped up at the end, regardless of which branch below ran.
    pub fn on_tick(&self, frame: &Frame, state: &str, now: Instant) {
        if !self.config.enabled {
            return;
        }

        let prefixes = trigger_prefixes(&self.config.trigger_state);
        let matches = state_matches(state, &prefixes);

        {
            let mut session = self.session.lock().unwrap();
            match &*session {
                SessionState::Idle => {
                    if matches && self.cooldown_elapsed(now) {
                        self.start_session(&mut session, frame, now);
                    }
                }
                SessionState::Active { post_roll_deadline } => {
                    let deadline = *post_roll_deadline;
                    let stamped = stamp_border(frame, true);
                    if let Some(tx) = self.tx.lock().unwrap().clone() {
                        self.send(&tx, EncoderCommand::Frame(stamped));
                    }

                    if matches {
                        *session = SessionState::Active { post_roll_deadline: None };
                    } else {
                        let deadline = deadline.unwrap_or_else(|| {
                            now + Duration::from_secs_f64(self.config.stop_grace_seconds as f64)
                        });
                        if now >= deadline {
                            if let Some(tx) = self.tx.lock().unwrap().clone() {
                                self.send(&tx, EncoderCommand::Stop);
                            }
                            *session = SessionState::Idle;
                        } else {
                            *session = SessionState::Active {
                                post_roll_deadline: Some(deadline),
                            };
                        }
                    }
                }
            }
        }

        self.push_pre_roll(stamp_border(frame, false));
    }

    /// `true` if no session has ever started, or if `cooldown_seconds`
    /// has elapsed since the previous session's *start* (not its stop).
    fn cooldown_elapsed(&self, now: Instant) -> bool {
        self.last_start_ts.lock().unwrap().is_none_or(|last| {
            now.duration_since(last) >= Duration::from_secs(self.config.cooldown_seconds as u64)
        })
    }

    fn push_pre_roll(&self, frame: OwnedFrame) {
        if self.pre_roll_cap == 0 {
            return;
        }
        let mut ring = self.pre_roll.lock().unwrap();
        ring.push_back(frame);
        while ring.len() > self.pre_roll_cap {
            ring.pop_front();
        }
    }

    fn start_session(&self, session: &mut SessionState, frame: &Frame, now: Instant) {
        let pre_roll: Vec<OwnedFrame> = self.pre_roll.lock().unwrap().drain(..).collect();
        let tx = self.ensure_worker();
        self.send(
            &tx,
            EncoderCommand::Start {
                path: self.clip_path(),
                fps: self.fps,
                pre_roll,
            },
        );
        self.send(&tx, EncoderCommand::Frame(stamp_border(frame, true)));
        *self.last_start_ts.lock().unwrap() = Some(now);
        *session = SessionState::Active { post_roll_deadline: None };
    }

    /// Flushes any active session and tears down the encoder worker.
    pub fn shutdown(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            let in_session = matches!(*self.session.lock().unwrap(), SessionState::Active { .. });
            if in_session {
                self.send(&tx, EncoderCommand::Stop);
            }
            self.send(&tx, EncoderCommand::Shutdown);
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
        *self.session.lock().unwrap() = SessionState::Idle;
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use windows_capture::encoder::{AudioSettingsBuilder, ContainerSettingsBuilder, VideoEncoder, VideoSettingsBuilder};

    pub fn run_encoder_worker(rx: Receiver<EncoderCommand>, last_error: Arc<Mutex<Option<String>>>) {
        let mut encoder: Option<VideoEncoder> = None;

        for cmd in rx {
            match cmd {
                EncoderCommand::Start { path, fps, pre_roll } => {
                    if let Some(parent) = path.parent() {
                        if let Err(e) = std::fs::create_dir_all(parent) {
                            *last_error.lock().unwrap() = Some(
                                RecorderError::AssetsDir {
                                    path: parent.display().to_string(),
                                    source: e,
                                }
                                .to_string(),
                            );
                            continue;
                        }
                    }

                    let (w, h) = pre_roll
                        .first()
                        .map(|f| (f.width, f.height))
                        .unwrap_or((0, 0));
                    if w == 0 || h == 0 {
                        continue;
                    }

                    let built = VideoEncoder::new(
                        VideoSettingsBuilder::new(w, h).frame_rate(fps.round().max(1.0) as u32),
                        AudioSettingsBuilder::default().disabled(true),
                        ContainerSettingsBuilder::default(),
                        &path,
                    );

                    match built {
                        Ok(mut enc) => {
                            for frame in &pre_roll {
                                let _ = enc.send_frame_buffer(&frame.data, frame.width as usize * 4);
                            }
                            encoder = Some(enc);
                        }
                        Err(e) => {
                            *last_error.lock().unwrap() =
                                Some(RecorderError::WriterOpenFailed(e.to_string()).to_string());
                        }
                    }
                }
                EncoderCommand::Frame(frame) => {
                    if let Some(enc) = encoder.as_mut() {
                        let _ = enc.send_frame_buffer(&frame.data, frame.width as usize * 4);
                    }
                }
                EncoderCommand::Stop => {
                    if let Some(enc) = encoder.take() {
                        let _ = enc.finish();
                    }
                }
                EncoderCommand::Shutdown => {
                    if let Some(enc) = encoder.take() {
                        let _ = enc.finish();
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(not(windows))]
mod platform {
    use super::*;

    pub fn run_encoder_worker(rx: Receiver<EncoderCommand>, last_error: Arc<Mutex<Option<String>>>) {
        for cmd in rx {
            match cmd {
                EncoderCommand::Start { .. } => {
                    *last_error.lock().unwrap() = Some(RecorderError::UnsupportedPlatform.to_string());
                }
                EncoderCommand::Shutdown => return,
                EncoderCommand::Frame(_) | EncoderCommand::Stop => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(w: u32, h: u32) -> Frame {
        Frame {
            width: w,
            height: h,
            data: vec![10u8; (w * h * 4) as usize],
        }
    }

    #[test]
    fn trigger_prefix_matches_exact_and_suffixed_states() {
        let prefixes = trigger_prefixes("NO_MOTION, low_activity");
        assert_eq!(prefixes, vec!["NO_MOTION".to_string(), "LOW_ACTIVITY".to_string()]);
        assert!(state_matches("NO_MOTION", &prefixes));
        assert!(state_matches("NO_MOTION_WITH_AUDIO", &prefixes));
        assert!(!state_matches("MOTION", &prefixes));
    }

    #[test]
    fn stamping_draws_border_only_when_issue_active() {
        let f = frame(20, 20);
        let untouched = stamp_border(&f, false);
        assert_eq!(untouched.data, f.data);

        let stamped = stamp_border(&f, true);
        assert_eq!(&stamped.data[0..4], &YELLOW_BGRA);
    }

    #[test]
    fn pre_roll_ring_is_bounded_to_configured_frame_count() {
        let cfg = RecordingConfig {
            enabled: true,
            trigger_state: "NO_MOTION".to_string(),
            clip_seconds: 10,
            cooldown_seconds: 5,
            assets_dir: "./clips".to_string(),
            stop_grace_seconds: 3,
            pre_roll_seconds: 2.0,
        };
        let recorder = Recorder::new(cfg, 5.0);
        assert_eq!(recorder.pre_roll_cap, 10);

        let now = Instant::now();
        for _ in 0..25 {
            recorder.on_tick(&frame(4, 4), "MOTION", now);
        }
        assert_eq!(recorder.pre_roll.lock().unwrap().len(), 10);
    }

    #[test]
    fn disabled_recorder_ignores_ticks() {
        let cfg = RecordingConfig {
            enabled: false,
            trigger_state: "NO_MOTION".to_string(),
            clip_seconds: 10,
            cooldown_seconds: 5,
            assets_dir: "./clips".to_string(),
            stop_grace_seconds: 3,
            pre_roll_seconds: 1.0,
        };
        let recorder = Recorder::new(cfg, 5.0);
        recorder.on_tick(&frame(4, 4), "NO_MOTION", Instant::now());
        assert!(recorder.pre_roll.lock().unwrap().is_empty());
    }

    #[test]
    fn active_session_keeps_appending_to_the_pre_roll_ring() {
        // spec.md §4.3: pre_roll_ring is always maintained, including
        // while a session is active, not just in Idle/between sessions.
        let cfg = RecordingConfig {
            enabled: true,
            trigger_state: "NO_MOTION".to_string(),
            clip_seconds: 10,
            cooldown_seconds: 0,
            assets_dir: "./target/tmp-clips-preroll".to_string(),
            stop_grace_seconds: 5,
            pre_roll_seconds: 2.0,
        };
        let recorder = Recorder::new(cfg, 5.0);
        assert_eq!(recorder.pre_roll_cap, 10);
        let t0 = Instant::now();

        recorder.on_tick(&frame(4, 4), "NO_MOTION", t0);
        assert!(matches!(*recorder.session.lock().unwrap(), SessionState::Active { .. }));
        // start_session() drained the ring to seed the encoder; on_tick's
        // unconditional append at the end leaves exactly this tick's frame.
        assert_eq!(recorder.pre_roll.lock().unwrap().len(), 1);

        for i in 1..20 {
            recorder.on_tick(&frame(4, 4), "NO_MOTION", t0 + Duration::from_millis(i * 50));
        }
        assert_eq!(recorder.pre_roll.lock().unwrap().len(), 10);
        recorder.shutdown();
    }

    fn wait_for_last_error(recorder: &Recorder, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(e) = recorder.last_error() {
                return Some(e);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn trigger_state_starts_a_session_that_reaches_the_encoder_worker() {
        let cfg = RecordingConfig {
            enabled: true,
            trigger_state: "NO_MOTION".to_string(),
            clip_seconds: 10,
            cooldown_seconds: 2,
            assets_dir: "./target/tmp-clips".to_string(),
            stop_grace_seconds: 1,
            pre_roll_seconds: 1.0,
        };
        let recorder = Recorder::new(cfg, 5.0);
        let t0 = Instant::now();

        // Non-triggering ticks just feed the pre-roll ring.
        recorder.on_tick(&frame(4, 4), "MOTION", t0);
        assert!(recorder.last_error().is_none());

        // Triggering tick starts a session, which dispatches an
        // `EncoderCommand::Start` to the worker thread. On this
        // non-Windows host the stub worker reports an unsupported-platform
        // error, which is observable proof the command was dispatched.
        recorder.on_tick(&frame(4, 4), "NO_MOTION", t0);
        let err = wait_for_last_error(&recorder, Duration::from_secs(2));
        assert!(err.is_some(), "expected the encoder worker to report a start attempt");

        recorder.shutdown();
    }

    #[test]
    fn stop_grace_and_cooldown_are_driven_by_the_caller_supplied_clock() {
        let cfg = RecordingConfig {
            enabled: true,
            trigger_state: "NO_MOTION".to_string(),
            clip_seconds: 10,
            cooldown_seconds: 2,
            assets_dir: "./target/tmp-clips".to_string(),
            stop_grace_seconds: 1,
            pre_roll_seconds: 1.0,
        };
        let recorder = Recorder::new(cfg, 5.0);
        let t0 = Instant::now();

        recorder.on_tick(&frame(4, 4), "NO_MOTION", t0);
        wait_for_last_error(&recorder, Duration::from_secs(2));

        // Drop out of trigger state; stop_grace_seconds=1 means the session
        // stays active until the deadline, then returns to idle.
        recorder.on_tick(&frame(4, 4), "MOTION", t0 + Duration::from_millis(200));
        recorder.on_tick(&frame(4, 4), "MOTION", t0 + Duration::from_millis(500));
        // Still within stop_grace of the first non-matching tick.
        recorder.on_tick(&frame(4, 4), "MOTION", t0 + Duration::from_millis(900));
        // Past the 1s grace window measured from the first non-matching tick.
        recorder.on_tick(&frame(4, 4), "MOTION", t0 + Duration::from_millis(1_300));

        // cooldown_seconds=2 is measured from the previous start (t0), so
        // re-entering the trigger state before t0+2s must not start a
        // second session immediately.
        recorder.on_tick(&frame(4, 4), "NO_MOTION", t0 + Duration::from_millis(1_400));
        assert!(matches!(*recorder.session.lock().unwrap(), SessionState::Idle));

        // Past cooldown, a fresh trigger should start a new session.
        recorder.on_tick(&frame(4, 4), "MOTION", t0 + Duration::from_millis(3_500));
        recorder.on_tick(&frame(4, 4), "NO_MOTION", t0 + Duration::from_millis(3_600));
        assert!(wait_for_last_error(&recorder, Duration::from_secs(2)).is_some());

        recorder.shutdown();
    }

    #[test]
    fn disabled_recorder_never_touches_the_encoder_worker() {
        let cfg = RecordingConfig {
            enabled: false,
            trigger_state: "NO_MOTION".to_string(),
            clip_seconds: 10,
            cooldown_seconds: 2,
            assets_dir: "./target/tmp-clips".to_string(),
            stop_grace_seconds: 1,
            pre_roll_seconds: 1.0,
        };
        let recorder = Recorder::new(cfg, 5.0);
        let now = Instant::now();
        for _ in 0..10 {
            recorder.on_tick(&frame(4, 4), "NO_MOTION", now);
        }
        assert!(recorder.last_error().is_none());
        recorder.shutdown();
    }
}

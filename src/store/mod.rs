//! Thread-safe status store (C4): the one piece of shared mutable state
//! in the system. Every operation holds a single mutex for O(rows·cols)
//! work at most and never performs I/O under the lock, matching the
//! teacher's `capture/state.rs` single-`Mutex<AppState>` style.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::{json, Value};

const QUALITY_EVENTS_CAP: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct MonitorInfo {
    pub id: i64,
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
struct UiState {
    show_tile_numbers: bool,
    show_overlay_state: bool,
    grid_rows: u32,
    grid_cols: u32,
    region_x: i32,
    region_y: i32,
    region_width: u32,
    region_height: u32,
    current_state: String,
    monitors: Vec<MonitorInfo>,
    current_monitor_id: i64,
}

impl UiState {
    fn to_json(&self) -> Value {
        json!({
            "show_tile_numbers": self.show_tile_numbers,
            "show_overlay_state": self.show_overlay_state,
            "grid_rows": self.grid_rows,
            "grid_cols": self.grid_cols,
            "region_x": self.region_x,
            "region_y": self.region_y,
            "region_width": self.region_width,
            "region_height": self.region_height,
            "current_state": self.current_state,
            "monitors": self.monitors.iter().map(|m| json!({
                "id": m.id, "left": m.left, "top": m.top, "width": m.width, "height": m.height,
            })).collect::<Vec<_>>(),
            "current_monitor_id": self.current_monitor_id,
        })
    }
}

fn not_initialized_payload() -> Value {
    json!({
        "timestamp": now_secs(),
        "capture": {"state": "ERROR", "reason": "not_initialized", "backend": ""},
        "video": {
            "state": "ERROR",
            "confidence": 0.0,
            "motion_mean": 0.0,
            "motion_instant_mean": 0.0,
            "motion_instant_top1": 0.0,
            "motion_instant_activity": 0.0,
            "grid": {"rows": 1, "cols": 1},
            "tiles": [0.0],
            "stale": true,
            "stale_age_sec": 0.0,
        },
        "audio": {"available": false, "left": 0.0, "right": 0.0, "detected": false, "reason": "not_initialized"},
        "overall": {"state": "NOT_OK", "reasons": ["not_initialized"]},
        "errors": [],
        "region": {"x": 0, "y": 0, "width": 1, "height": 1},
    })
}

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs_f64()
}

struct Inner {
    latest_payload: Value,
    history: VecDeque<(f64, Value)>,
    disabled_tiles: Vec<u32>,
    ui: UiState,
    history_seconds: f64,
    quality_events: VecDeque<Value>,
    quit_requested: bool,
}

pub struct StatusStore {
    inner: Mutex<Inner>,
}

#[allow(clippy::too_many_arguments)]
impl StatusStore {
    pub fn new(
        history_seconds: f64,
        grid_rows: u32,
        grid_cols: u32,
        show_tile_numbers: bool,
        show_overlay_state: bool,
        region: (i32, i32, u32, u32),
        monitors: Vec<MonitorInfo>,
    ) -> Self {
        let current_monitor_id = monitor_containing(&monitors, region).unwrap_or(0);
        StatusStore {
            inner: Mutex::new(Inner {
                latest_payload: not_initialized_payload(),
                history: VecDeque::new(),
                disabled_tiles: Vec::new(),
                ui: UiState {
                    show_tile_numbers,
                    show_overlay_state,
                    grid_rows,
                    grid_cols,
                    region_x: region.0,
                    region_y: region.1,
                    region_width: region.2,
                    region_height: region.3,
                    current_state: "ERROR".to_string(),
                    monitors,
                    current_monitor_id,
                },
                history_seconds,
                quality_events: VecDeque::new(),
                quit_requested: false,
            }),
        }
    }

    pub fn set_latest(&self, payload: Value) {
        let mut inner = self.inner.lock().unwrap();
        let ts = payload.get("timestamp").and_then(Value::as_f64).unwrap_or_else(now_secs);

        let state = payload
            .get("video")
            .and_then(|v| v.get("state"))
            .and_then(Value::as_str)
            .or_else(|| payload.get("overall").and_then(|v| v.get("state")).and_then(Value::as_str))
            .unwrap_or("UNKNOWN")
            .to_string();
        inner.ui.current_state = state;

        inner.history.push_back((ts, payload.clone()));
        let cutoff = now_secs() - inner.history_seconds;
        while inner.history.front().is_some_and(|(t, _)| *t < cutoff) {
            inner.history.pop_front();
        }

        inner.latest_payload = payload;
    }

    pub fn get_payload(&self) -> Value {
        let inner = self.inner.lock().unwrap();
        Self::normalize(&inner.latest_payload, &inner.ui, &inner.disabled_tiles)
    }

    fn normalize(payload: &Value, ui: &UiState, disabled: &[u32]) -> Value {
        let mut payload = payload.clone();
        let video = payload
            .as_object_mut()
            .unwrap()
            .entry("video")
            .or_insert_with(|| json!({}));

        let rows = video.get("grid").and_then(|g| g.get("rows")).and_then(Value::as_u64).unwrap_or(ui.grid_rows as u64).max(1);
        let cols = video.get("grid").and_then(|g| g.get("cols")).and_then(Value::as_u64).unwrap_or(ui.grid_cols as u64).max(1);
        let len = (rows * cols) as usize;

        let raw_tiles: Vec<Value> = video
            .get("tiles")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut tiles: Vec<Option<f64>> = raw_tiles
            .iter()
            .map(|v| if v.is_null() || v.is_boolean() { None } else { v.as_f64() })
            .collect();
        tiles.resize(len, Some(0.0));
        tiles.truncate(len);

        for &idx in disabled {
            if (idx as usize) < tiles.len() {
                tiles[idx as usize] = None;
            }
        }

        let tiles_indexed: Vec<Value> = tiles
            .iter()
            .enumerate()
            .map(|(i, v)| match v {
                Some(f) => json!({"tile": i, "value": f}),
                None => json!({"tile": i, "value": "disabled"}),
            })
            .collect();

        let video_obj = video.as_object_mut().unwrap();
        video_obj.insert("grid".to_string(), json!({"rows": rows, "cols": cols}));
        video_obj.insert("tiles".to_string(), json!(tiles));
        video_obj.insert("tiles_indexed".to_string(), json!(tiles_indexed));
        video_obj.insert("disabled_tiles".to_string(), json!(disabled));

        let obj = payload.as_object_mut().unwrap();
        if !obj.get("errors").is_some_and(Value::is_array) {
            obj.insert("errors".to_string(), json!([]));
        }
        obj.insert("ui".to_string(), ui.to_json());

        payload
    }

    pub fn get_history(&self) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        let cutoff = now_secs() - inner.history_seconds;
        inner.history.iter().filter(|(t, _)| *t >= cutoff).map(|(_, p)| p.clone()).collect()
    }

    pub fn get_payload_history(&self) -> Vec<Value> {
        let inner = self.inner.lock().unwrap();
        let cutoff = now_secs() - inner.history_seconds;
        inner
            .history
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .map(|(_, p)| Self::normalize(p, &inner.ui, &inner.disabled_tiles))
            .collect()
    }

    pub fn set_disabled_tiles(&self, tiles: Vec<i64>) {
        let mut inner = self.inner.lock().unwrap();
        let mut cleaned: Vec<u32> = tiles.into_iter().filter(|&i| i >= 0).map(|i| i as u32).collect();
        cleaned.sort_unstable();
        cleaned.dedup();
        inner.disabled_tiles = cleaned;
    }

    pub fn get_disabled_tiles(&self) -> Vec<u32> {
        self.inner.lock().unwrap().disabled_tiles.clone()
    }

    pub fn set_grid(&self, rows: u32, cols: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.ui.grid_rows = rows.max(1);
        inner.ui.grid_cols = cols.max(1);
    }

    pub fn grid(&self) -> (u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.ui.grid_rows, inner.ui.grid_cols)
    }

    pub fn set_region(&self, x: i32, y: i32, width: u32, height: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.ui.region_x = x;
        inner.ui.region_y = y;
        inner.ui.region_width = width;
        inner.ui.region_height = height;
        inner.ui.current_monitor_id =
            monitor_containing(&inner.ui.monitors, (x, y, width, height)).unwrap_or(inner.ui.current_monitor_id);
    }

    pub fn set_tile_numbers(&self, enabled: bool) {
        self.inner.lock().unwrap().ui.show_tile_numbers = enabled;
    }

    pub fn set_state_overlay(&self, enabled: bool) {
        self.inner.lock().unwrap().ui.show_overlay_state = enabled;
    }

    pub fn ui_json(&self) -> Value {
        self.inner.lock().unwrap().ui.to_json()
    }

    pub fn request_quit(&self) {
        self.inner.lock().unwrap().quit_requested = true;
    }

    pub fn quit_requested(&self) -> bool {
        self.inner.lock().unwrap().quit_requested
    }

    pub fn add_quality_event(&self, event: Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.quality_events.push_back(event);
        while inner.quality_events.len() > QUALITY_EVENTS_CAP {
            inner.quality_events.pop_front();
        }
    }

    pub fn quality_events(&self) -> Vec<Value> {
        self.inner.lock().unwrap().quality_events.iter().cloned().collect()
    }
}

fn monitor_containing(monitors: &[MonitorInfo], region: (i32, i32, u32, u32)) -> Option<i64> {
    let cx = region.0 + region.2 as i32 / 2;
    let cy = region.1 + region.3 as i32 / 2;
    monitors
        .iter()
        .find(|m| cx >= m.left && cx < m.left + m.width as i32 && cy >= m.top && cy < m.top + m.height as i32)
        .map(|m| m.id)
}

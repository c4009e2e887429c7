//! Configuration loading and validation (§6 of the design spec).
//!
//! Mirrors the original `config/config.py`: a hand-validated reader over a
//! loosely-typed JSON document rather than a schema crate, because the
//! source this was distilled from never reached for one either. Every
//! missing or out-of-range key fails with the dotted key name attached.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub backend: String,
    pub fps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
    pub diff_gain: f64,
    pub no_motion_threshold: f64,
    pub low_activity_threshold: f64,
    pub no_motion_grace_period_seconds: f64,
    pub no_motion_grace_required_ratio: f64,
    pub ema_alpha: f64,
    pub history_seconds: f64,
    pub mean_full_scale: f64,
    pub tile_full_scale: f64,
    pub grid_rows: u32,
    pub grid_cols: u32,
    pub analysis_inset_px: u32,
    /// Ambient supplement (SPEC_FULL.md): attach `video.debug` when set.
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub enabled: bool,
    pub trigger_state: String,
    pub clip_seconds: u32,
    pub cooldown_seconds: u32,
    pub assets_dir: String,
    pub stop_grace_seconds: u32,
    pub pre_roll_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub enabled: bool,
    pub backend: String,
    pub device_id: Option<String>,
    pub device_index: i32,
    pub device_substr: String,
    pub samplerate: u32,
    pub channels: u32,
    pub block_ms: u32,
    pub calib_sec: f64,
    pub factor: f64,
    pub abs_min: f64,
    pub on_threshold: f64,
    pub off_threshold: f64,
    pub hold_ms: u32,
    pub smooth_samples: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    pub initial_region: RegionConfig,
    pub border_px: u32,
    pub grid_line_px: u32,
    pub show_tile_numbers: bool,
    pub show_overlay_state: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub motion: MotionConfig,
    pub recording: RecordingConfig,
    pub audio: AudioConfig,
    pub ui: UiConfig,
}

fn obj<'a>(raw: &'a Value, key: &str) -> Result<&'a serde_json::Map<String, Value>, ConfigError> {
    raw.get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| ConfigError::invalid(key, "expected an object"))
}

fn num(raw: &serde_json::Map<String, Value>, parent: &str, key: &str) -> Result<f64, ConfigError> {
    raw.get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| ConfigError::invalid(format!("{parent}.{key}"), "expected a number"))
}

fn opt_num(raw: &serde_json::Map<String, Value>, parent: &str, key: &str, default: f64) -> Result<f64, ConfigError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| ConfigError::invalid(format!("{parent}.{key}"), "expected a number")),
    }
}

fn string(raw: &serde_json::Map<String, Value>, parent: &str, key: &str) -> Result<String, ConfigError> {
    raw.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::invalid(format!("{parent}.{key}"), "expected a non-empty string"))
}

fn opt_string(raw: &serde_json::Map<String, Value>, parent: &str, key: &str, default: &str) -> Result<String, ConfigError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(default.to_string()),
        Some(v) => v
            .as_str()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .ok_or_else(|| ConfigError::invalid(format!("{parent}.{key}"), "expected a non-empty string")),
    }
}

fn opt_bool(raw: &serde_json::Map<String, Value>, parent: &str, key: &str, default: bool) -> Result<bool, ConfigError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| ConfigError::invalid(format!("{parent}.{key}"), "expected a boolean")),
    }
}

fn bool_req(raw: &serde_json::Map<String, Value>, parent: &str, key: &str) -> Result<bool, ConfigError> {
    raw.get(key)
        .and_then(Value::as_bool)
        .ok_or_else(|| ConfigError::invalid(format!("{parent}.{key}"), "expected a boolean"))
}

fn ranged(key: &str, value: f64, lo: f64, hi: f64) -> Result<f64, ConfigError> {
    if value < lo || value > hi {
        return Err(ConfigError::invalid(key, format!("must be within [{lo}, {hi}]")));
    }
    Ok(value)
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let raw: Value = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_value(&raw)
    }

    pub fn from_value(raw: &Value) -> Result<Self, ConfigError> {
        let server_raw = obj(raw, "server")?;
        let server = ServerConfig {
            host: string(server_raw, "server", "host")?,
            port: num(server_raw, "server", "port")? as u16,
        };

        let capture_raw = obj(raw, "capture")?;
        let backend = string(capture_raw, "capture", "backend")?.to_uppercase();
        if backend != "GDI" {
            return Err(ConfigError::invalid(
                "capture.backend",
                format!("unsupported backend {backend:?} (expected \"GDI\")"),
            ));
        }
        let fps = num(capture_raw, "capture", "fps")?;
        if fps <= 0.0 {
            return Err(ConfigError::invalid("capture.fps", "must be > 0"));
        }
        let capture = CaptureConfig { backend, fps };

        let motion_raw = obj(raw, "motion")?;
        let grid_rows = num(motion_raw, "motion", "grid_rows")? as i64;
        let grid_cols = num(motion_raw, "motion", "grid_cols")? as i64;
        if grid_rows < 1 {
            return Err(ConfigError::invalid("motion.grid_rows", "must be >= 1"));
        }
        if grid_cols < 1 {
            return Err(ConfigError::invalid("motion.grid_cols", "must be >= 1"));
        }
        let mean_full_scale = num(motion_raw, "motion", "mean_full_scale")?;
        if mean_full_scale <= 0.0 {
            return Err(ConfigError::invalid("motion.mean_full_scale", "must be > 0"));
        }
        let tile_full_scale = num(motion_raw, "motion", "tile_full_scale")?;
        if tile_full_scale <= 0.0 {
            return Err(ConfigError::invalid("motion.tile_full_scale", "must be > 0"));
        }
        let no_motion_grace_period_seconds =
            opt_num(motion_raw, "motion", "no_motion_grace_period_seconds", 0.0)?;
        if no_motion_grace_period_seconds < 0.0 {
            return Err(ConfigError::invalid(
                "motion.no_motion_grace_period_seconds",
                "must be >= 0",
            ));
        }
        let no_motion_grace_required_ratio = ranged(
            "motion.no_motion_grace_required_ratio",
            opt_num(motion_raw, "motion", "no_motion_grace_required_ratio", 1.0)?,
            0.0,
            1.0,
        )?;
        let ema_alpha = ranged("motion.ema_alpha", num(motion_raw, "motion", "ema_alpha")?, 0.0, 1.0)?;
        let motion = MotionConfig {
            diff_gain: num(motion_raw, "motion", "diff_gain")?,
            no_motion_threshold: num(motion_raw, "motion", "no_motion_threshold")?,
            low_activity_threshold: num(motion_raw, "motion", "low_activity_threshold")?,
            no_motion_grace_period_seconds,
            no_motion_grace_required_ratio,
            ema_alpha,
            history_seconds: num(motion_raw, "motion", "history_seconds")?,
            mean_full_scale,
            tile_full_scale,
            grid_rows: grid_rows as u32,
            grid_cols: grid_cols as u32,
            analysis_inset_px: opt_num(motion_raw, "motion", "analysis_inset_px", 10.0)? as u32,
            debug: opt_bool(motion_raw, "motion", "debug", false)?,
        };

        let recording_raw = raw
            .get("recording")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let clip_seconds = opt_num(&recording_raw, "recording", "clip_seconds", 10.0)? as i64;
        if clip_seconds <= 0 {
            return Err(ConfigError::invalid("recording.clip_seconds", "must be > 0"));
        }
        let cooldown_seconds = opt_num(&recording_raw, "recording", "cooldown_seconds", 30.0)? as i64;
        if cooldown_seconds < 0 {
            return Err(ConfigError::invalid("recording.cooldown_seconds", "must be >= 0"));
        }
        let pre_roll_seconds = opt_num(&recording_raw, "recording", "pre_roll_seconds", 2.0)?;
        if pre_roll_seconds < 0.0 {
            return Err(ConfigError::invalid("recording.pre_roll_seconds", "must be >= 0"));
        }
        let recording = RecordingConfig {
            enabled: opt_bool(&recording_raw, "recording", "enabled", true)?,
            trigger_state: opt_string(&recording_raw, "recording", "trigger_state", "NO_MOTION")?
                .to_uppercase(),
            clip_seconds: clip_seconds as u32,
            cooldown_seconds: cooldown_seconds as u32,
            assets_dir: opt_string(&recording_raw, "recording", "assets_dir", "./assets")?,
            stop_grace_seconds: opt_num(&recording_raw, "recording", "stop_grace_seconds", 10.0)? as u32,
            pre_roll_seconds,
        };

        let audio_raw = raw.get("audio").and_then(Value::as_object).cloned().unwrap_or_default();
        let on_threshold = ranged(
            "audio.on_threshold",
            opt_num(&audio_raw, "audio", "on_threshold", 0.01)?,
            0.0,
            1.0,
        )?;
        let off_threshold = ranged(
            "audio.off_threshold",
            opt_num(&audio_raw, "audio", "off_threshold", 0.005)?,
            0.0,
            1.0,
        )?;
        if off_threshold > on_threshold {
            return Err(ConfigError::invalid(
                "audio.off_threshold",
                "must be <= audio.on_threshold",
            ));
        }
        let calib_sec = opt_num(&audio_raw, "audio", "calib_sec", 2.0)?;
        if calib_sec < 0.0 {
            return Err(ConfigError::invalid("audio.calib_sec", "must be >= 0"));
        }
        let factor = opt_num(&audio_raw, "audio", "factor", 2.5)?;
        if factor <= 0.0 {
            return Err(ConfigError::invalid("audio.factor", "must be > 0"));
        }
        let abs_min = opt_num(&audio_raw, "audio", "abs_min", 0.000_12)?;
        if abs_min < 0.0 {
            return Err(ConfigError::invalid("audio.abs_min", "must be >= 0"));
        }
        let audio = AudioConfig {
            enabled: opt_bool(&audio_raw, "audio", "enabled", true)?,
            backend: opt_string(&audio_raw, "audio", "backend", "wasapi")?,
            device_id: audio_raw.get("device_id").and_then(Value::as_str).map(str::to_string),
            device_index: opt_num(&audio_raw, "audio", "device_index", -1.0)? as i32,
            device_substr: opt_string(&audio_raw, "audio", "device_substr", "")?,
            samplerate: {
                let v = opt_num(&audio_raw, "audio", "samplerate", 48_000.0)?;
                if v <= 0.0 {
                    return Err(ConfigError::invalid("audio.samplerate", "must be > 0"));
                }
                v as u32
            },
            channels: {
                let v = opt_num(&audio_raw, "audio", "channels", 2.0)?;
                if v <= 0.0 {
                    return Err(ConfigError::invalid("audio.channels", "must be > 0"));
                }
                v as u32
            },
            block_ms: {
                let v = opt_num(&audio_raw, "audio", "block_ms", 250.0)?;
                if v <= 0.0 {
                    return Err(ConfigError::invalid("audio.block_ms", "must be > 0"));
                }
                v as u32
            },
            calib_sec,
            factor,
            abs_min,
            on_threshold,
            off_threshold,
            hold_ms: opt_num(&audio_raw, "audio", "hold_ms", 300.0)? as u32,
            smooth_samples: {
                let v = opt_num(&audio_raw, "audio", "smooth_samples", 3.0)?;
                if v < 1.0 {
                    return Err(ConfigError::invalid("audio.smooth_samples", "must be >= 1"));
                }
                v as u32
            },
        };

        let ui_raw = obj(raw, "ui")?;
        let region_raw = obj(raw.get("ui").unwrap(), "initial_region")
            .map_err(|_| ConfigError::invalid("ui.initial_region", "expected an object"))?;
        let width = num(region_raw, "ui.initial_region", "width")? as i64;
        let height = num(region_raw, "ui.initial_region", "height")? as i64;
        if width < 1 {
            return Err(ConfigError::invalid("ui.initial_region.width", "must be >= 1"));
        }
        if height < 1 {
            return Err(ConfigError::invalid("ui.initial_region.height", "must be >= 1"));
        }
        let ui = UiConfig {
            initial_region: RegionConfig {
                x: num(region_raw, "ui.initial_region", "x")? as i32,
                y: num(region_raw, "ui.initial_region", "y")? as i32,
                width: width as u32,
                height: height as u32,
            },
            border_px: num(ui_raw, "ui", "border_px")? as u32,
            grid_line_px: num(ui_raw, "ui", "grid_line_px")? as u32,
            show_tile_numbers: bool_req(ui_raw, "ui", "show_tile_numbers")?,
            show_overlay_state: bool_req(ui_raw, "ui", "show_overlay_state")?,
        };

        Ok(AppConfig {
            server,
            capture,
            motion,
            recording,
            audio,
            ui,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Value {
        serde_json::json!({
            "server": {"host": "127.0.0.1", "port": 8080},
            "capture": {"backend": "gdi", "fps": 5},
            "motion": {
                "diff_gain": 1.0,
                "no_motion_threshold": 0.02,
                "low_activity_threshold": 0.06,
                "ema_alpha": 0.2,
                "history_seconds": 120,
                "mean_full_scale": 1.0,
                "tile_full_scale": 1.0,
                "grid_rows": 3,
                "grid_cols": 3
            },
            "recording": {"assets_dir": "./clips"},
            "audio": {"enabled": true},
            "ui": {
                "initial_region": {"x": 0, "y": 0, "width": 640, "height": 480},
                "border_px": 2,
                "grid_line_px": 1,
                "show_tile_numbers": true,
                "show_overlay_state": true
            }
        })
    }

    #[test]
    fn loads_minimal_valid_config() {
        let cfg = AppConfig::from_value(&sample()).expect("valid config");
        assert_eq!(cfg.capture.backend, "GDI");
        assert_eq!(cfg.motion.grid_rows, 3);
        assert_eq!(cfg.recording.trigger_state, "NO_MOTION");
    }

    #[test]
    fn rejects_unsupported_backend() {
        let mut raw = sample();
        raw["capture"]["backend"] = serde_json::json!("SCRAP");
        let err = AppConfig::from_value(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { key, .. } if key == "capture.backend"));
    }

    #[test]
    fn rejects_missing_required_key() {
        let mut raw = sample();
        raw["motion"].as_object_mut().unwrap().remove("ema_alpha");
        let err = AppConfig::from_value(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { key, .. } if key == "motion.ema_alpha"));
    }

    #[test]
    fn rejects_off_threshold_above_on_threshold() {
        let mut raw = sample();
        raw["audio"]["on_threshold"] = serde_json::json!(0.1);
        raw["audio"]["off_threshold"] = serde_json::json!(0.2);
        let err = AppConfig::from_value(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { key, .. } if key == "audio.off_threshold"));
    }

    #[test]
    fn rejects_zero_grid() {
        let mut raw = sample();
        raw["motion"]["grid_rows"] = serde_json::json!(0);
        let err = AppConfig::from_value(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { key, .. } if key == "motion.grid_rows"));
    }

    #[test]
    fn audio_calibration_keys_default_and_validate() {
        let cfg = AppConfig::from_value(&sample()).expect("valid config");
        assert_eq!(cfg.audio.calib_sec, 2.0);
        assert_eq!(cfg.audio.factor, 2.5);
        assert_eq!(cfg.audio.abs_min, 0.000_12);

        let mut raw = sample();
        raw["audio"]["factor"] = serde_json::json!(-1.0);
        let err = AppConfig::from_value(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { key, .. } if key == "audio.factor"));

        let mut raw = sample();
        raw["audio"]["calib_sec"] = serde_json::json!(-0.5);
        let err = AppConfig::from_value(&raw).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidKey { key, .. } if key == "audio.calib_sec"));
    }
}

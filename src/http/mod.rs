//! HTTP surface (C6): thin routing delegating to `StatusStore`, built on
//! `axum` + `tower-http` the way the beacon/signaling servers in the
//! example pack compose their routers — `Router`, `State`, typed JSON
//! extractors, `StatusCode` for validation failures.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::capture::Region;
use crate::error::ClientError;
use crate::store::StatusStore;

const INDEX_TEMPLATE: &str = include_str!("../../assets/index.html");

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StatusStore>,
    pub region: Arc<Mutex<Region>>,
    pub history_seconds: f64,
    pub assets_dir: String,
}

pub fn router(state: AppState) -> Router {
    let assets_dir = state.assets_dir.clone();

    Router::new()
        .route("/", get(index))
        .route("/status", get(status))
        .route("/history", get(history))
        .route("/tiles", get(get_tiles).put(put_tiles))
        .route("/ui", get(ui_settings))
        .route("/ui/settings", get(ui_settings))
        .route("/ui/tile-numbers", post(set_tile_numbers))
        .route("/ui/grid", post(set_grid))
        .route("/ui/state-overlay", post(set_state_overlay))
        .route("/ui/region", post(set_region))
        .route("/quit", post(quit))
        .route("/quality/events", get(quality_events))
        .route("/quality/clips", get(quality_clips))
        .nest_service("/clips", ServeDir::new(assets_dir))
        .nest_service("/assets", ServeDir::new("assets"))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
        .layer(RequestBodyLimitLayer::new(1024 * 1024))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn bad_request(message: impl Into<String>) -> axum::response::Response {
    let err = ClientError::BadRequest(message.into());
    (StatusCode::BAD_REQUEST, Json(json!({"error": err.to_string()}))).into_response()
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(INDEX_TEMPLATE.replace("{{HISTORY_SECONDS}}", &state.history_seconds.to_string()))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(state.store.get_payload())
}

async fn history(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"history": state.store.get_payload_history()}))
}

async fn get_tiles(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"disabled_tiles": state.store.get_disabled_tiles()}))
}

async fn put_tiles(State(state): State<AppState>, body: String) -> axum::response::Response {
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return bad_request("expected a JSON object");
    };
    let Some(tiles) = value.get("disabled_tiles").and_then(Value::as_array) else {
        return bad_request("disabled_tiles must be a list of integers");
    };
    let mut parsed = Vec::with_capacity(tiles.len());
    for t in tiles {
        match t.as_i64() {
            Some(i) => parsed.push(i),
            None => return bad_request("disabled_tiles must be a list of integers"),
        }
    }
    state.store.set_disabled_tiles(parsed);
    Json(json!({"disabled_tiles": state.store.get_disabled_tiles()})).into_response()
}

async fn ui_settings(State(state): State<AppState>) -> Json<Value> {
    Json(state.store.ui_json())
}

async fn set_tile_numbers(State(state): State<AppState>, body: String) -> axum::response::Response {
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return bad_request("expected a JSON object");
    };
    let Some(enabled) = value.get("enabled").and_then(Value::as_bool) else {
        return bad_request("enabled must be a boolean");
    };
    state.store.set_tile_numbers(enabled);
    Json(state.store.ui_json()).into_response()
}

async fn set_state_overlay(State(state): State<AppState>, body: String) -> axum::response::Response {
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return bad_request("expected a JSON object");
    };
    let Some(enabled) = value.get("enabled").and_then(Value::as_bool) else {
        return bad_request("enabled must be a boolean");
    };
    state.store.set_state_overlay(enabled);
    Json(state.store.ui_json()).into_response()
}

async fn set_grid(State(state): State<AppState>, body: String) -> axum::response::Response {
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return bad_request("expected a JSON object");
    };
    let rows = value.get("rows").and_then(Value::as_i64);
    let cols = value.get("cols").and_then(Value::as_i64);
    match (rows, cols) {
        (Some(r), Some(c)) if r > 0 && c > 0 => {
            state.store.set_grid(r as u32, c as u32);
            Json(state.store.ui_json()).into_response()
        }
        _ => bad_request("rows and cols must be positive integers"),
    }
}

async fn set_region(State(state): State<AppState>, body: String) -> axum::response::Response {
    let Ok(value) = serde_json::from_str::<Value>(&body) else {
        return bad_request("expected a JSON object");
    };
    let x = value.get("x").and_then(Value::as_i64);
    let y = value.get("y").and_then(Value::as_i64);
    let width = value.get("width").and_then(Value::as_i64);
    let height = value.get("height").and_then(Value::as_i64);
    match (x, y, width, height) {
        (Some(x), Some(y), Some(w), Some(h)) if w > 0 && h > 0 => {
            state.store.set_region(x as i32, y as i32, w as u32, h as u32);
            *state.region.lock().unwrap() = Region::new(x as i32, y as i32, w as u32, h as u32);
            Json(state.store.ui_json()).into_response()
        }
        _ => bad_request("x, y, width, height must be integers with width,height > 0"),
    }
}

async fn quit(State(state): State<AppState>) -> Json<Value> {
    state.store.request_quit();
    Json(json!({"ok": true}))
}

async fn quality_events(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"events": state.store.quality_events()}))
}

async fn quality_clips(State(state): State<AppState>) -> Json<Value> {
    let mut clips = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&state.assets_dir) {
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else { continue };
            if !metadata.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().to_string();
            clips.push(json!({
                "filename": filename,
                "url": format!("/clips/{}", entry.file_name().to_string_lossy()),
                "size_bytes": metadata.len(),
            }));
        }
    }
    Json(json!({"clips": clips}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState {
            store: Arc::new(StatusStore::new(120.0, 2, 2, true, true, (0, 0, 100, 100), vec![])),
            region: Arc::new(Mutex::new(Region::new(0, 0, 100, 100))),
            history_seconds: 120.0,
            assets_dir: "./clips".to_string(),
        }
    }

    #[tokio::test]
    async fn status_returns_schema_correct_payload() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn put_tiles_rejects_non_list_body() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/tiles")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"disabled_tiles":"nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn put_tiles_echoes_normalized_list() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/tiles")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"disabled_tiles":[3,1,1,-2]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["disabled_tiles"], json!([1, 3]));
    }

    #[tokio::test]
    async fn quit_sets_store_flag() {
        let state = test_state();
        let store = Arc::clone(&state.store);
        let app = router(state);
        let response = app
            .oneshot(Request::builder().method("POST").uri("/quit").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.quit_requested());
    }

    #[tokio::test]
    async fn set_grid_rejects_non_positive_values() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/ui/grid")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"rows":0,"cols":3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn index_serves_the_html_shell_with_history_seconds_substituted() {
        let app = router(test_state());
        let response = app.oneshot(Request::get("/").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("120"));
        assert!(!html.contains("{{HISTORY_SECONDS}}"));
    }

    #[tokio::test]
    async fn history_reflects_previously_set_payloads() {
        let s = test_state();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        s.store.set_latest(json!({
            "timestamp": now,
            "capture": {"state": "OK", "reason": "", "backend": "GDI"},
            "video": {"state": "NO_MOTION", "grid": {"rows": 2, "cols": 2}, "tiles": [0.0, 0.0, 0.0, 0.0]},
            "audio": {"available": false, "left": 0.0, "right": 0.0, "detected": false, "reason": "disabled"},
            "overall": {"state": "OK", "reasons": []},
            "region": {"x": 0, "y": 0, "width": 100, "height": 100},
        }));
        let app = router(s);
        let response = app.oneshot(Request::get("/history").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert!(!payload["history"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ui_settings_round_trip_tile_numbers_and_overlay_flags() {
        let app = router(test_state());

        let response = app
            .clone()
            .oneshot(
                Request::post("/ui/tile-numbers")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"enabled": false}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(
                Request::post("/ui/state-overlay")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"enabled": false}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(Request::get("/ui").body(Body::empty()).unwrap()).await.unwrap();
        let payload = body_json(response).await;
        assert_eq!(payload["show_tile_numbers"], false);
        assert_eq!(payload["show_overlay_state"], false);
    }

    #[tokio::test]
    async fn set_region_accepts_positive_dimensions_and_rejects_non_positive() {
        let app = router(test_state());

        let ok = app
            .clone()
            .oneshot(
                Request::post("/ui/region")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"x": 10, "y": 20, "width": 200, "height": 150}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let bad = app
            .oneshot(
                Request::post("/ui/region")
                    .header("content-type", "application/json")
                    .body(Body::from(json!({"x": 0, "y": 0, "width": 0, "height": 150}).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn quality_events_lists_recorded_events() {
        let s = test_state();
        s.store.add_quality_event(json!({"timestamp": 1.0, "kind": "capture_error"}));
        let app = router(s);
        let response = app.oneshot(Request::get("/quality/events").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn quality_clips_lists_an_empty_directory_without_error() {
        let mut s = test_state();
        s.assets_dir = "./target/tmp-clips-http-empty".to_string();
        std::fs::create_dir_all(&s.assets_dir).unwrap();
        let app = router(s);
        let response = app.oneshot(Request::get("/quality/clips").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert!(payload["clips"].as_array().unwrap().is_empty());
    }
}

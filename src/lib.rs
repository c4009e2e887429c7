//! Library surface for `nomotion-watch`: the capture/analysis/publish
//! pipeline plus the composition root that wires it into a running
//! daemon. Split from `main.rs` the way the teacher exposes `lib.rs`
//! behind its Tauri binary.

pub mod capture;
pub mod config;
pub mod error;
pub mod http;
pub mod monitor;
pub mod store;
pub mod telemetry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capture::audio::AudioMeter;
use capture::recorder::Recorder;
use capture::Region;
use config::AppConfig;
use monitor::MonitorLoop;
use store::{MonitorInfo, StatusStore};

/// Runs the full daemon until `POST /quit` sets the store's quit flag.
pub async fn run(config: AppConfig) {
    let region = Arc::new(Mutex::new(Region::new(
        config.ui.initial_region.x,
        config.ui.initial_region.y,
        config.ui.initial_region.width,
        config.ui.initial_region.height,
    )));

    // A single virtual-desktop-sized monitor entry; real multi-monitor
    // enumeration is the overlay's responsibility (out of scope, §1).
    let monitors = vec![MonitorInfo {
        id: 0,
        left: 0,
        top: 0,
        width: 7_680,
        height: 4_320,
    }];

    let store = Arc::new(StatusStore::new(
        config.motion.history_seconds,
        config.motion.grid_rows,
        config.motion.grid_cols,
        config.ui.show_tile_numbers,
        config.ui.show_overlay_state,
        (
            config.ui.initial_region.x,
            config.ui.initial_region.y,
            config.ui.initial_region.width,
            config.ui.initial_region.height,
        ),
        monitors,
    ));

    let capturer: Arc<dyn capture::Capturer> = match capture::build_capturer(&config.capture.backend) {
        Ok(c) => Arc::from(c),
        Err(e) => {
            tracing::error!(error = %e, "fatal capture backend error");
            std::process::exit(2);
        }
    };

    let audio = Arc::new(AudioMeter::new(config.audio.clone()));
    audio.start();

    let recorder = Arc::new(Recorder::new(config.recording.clone(), config.capture.fps));

    let monitor_loop = Arc::new(MonitorLoop::new());
    monitor_loop.start(
        Arc::clone(&capturer),
        Arc::clone(&audio),
        Arc::clone(&store),
        Arc::clone(&recorder),
        Arc::clone(&region),
        config.motion.clone(),
        config.capture.fps,
    );

    let app_state = http::AppState {
        store: Arc::clone(&store),
        region: Arc::clone(&region),
        history_seconds: config.motion.history_seconds,
        assets_dir: config.recording.assets_dir.clone(),
    };
    let app = http::router(app_state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, addr = %addr, "failed to bind HTTP listener");
        std::process::exit(2);
    });
    tracing::info!(addr = %addr, "http server listening");

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let server_handle = tokio::spawn({
        let shutdown_flag = Arc::clone(&shutdown_flag);
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while !shutdown_flag.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                })
                .await
        }
    });

    let quit_watcher = {
        let store = Arc::clone(&store);
        let monitor_loop = Arc::clone(&monitor_loop);
        let audio = Arc::clone(&audio);
        let recorder = Arc::clone(&recorder);
        let shutdown_flag = Arc::clone(&shutdown_flag);
        tokio::task::spawn_blocking(move || {
            while !store.quit_requested() {
                std::thread::sleep(Duration::from_millis(100));
            }
            monitor_loop.stop();
            audio.stop();
            recorder.shutdown();
            shutdown_flag.store(true, Ordering::SeqCst);
        })
    };

    let _ = tokio::join!(server_handle, quit_watcher);
}

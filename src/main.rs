//! Composition root entry point (C7). Parses CLI flags, loads and
//! validates configuration, then hands off to the library's `run`.

use nomotion_watch::{capture, config::AppConfig, telemetry};

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "--list-audio-devices") {
        telemetry::init();
        match capture::audio::list_devices() {
            Ok(devices) => {
                for (i, name) in devices.iter().enumerate() {
                    println!("{i}: {name}");
                }
            }
            Err(e) => {
                eprintln!("failed to list audio devices: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    telemetry::init();

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "config.json".to_string());

    let config = match AppConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, config_path = %config_path, "fatal configuration error");
            std::process::exit(2);
        }
    };

    let rt = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    rt.block_on(nomotion_watch::run(config));
}

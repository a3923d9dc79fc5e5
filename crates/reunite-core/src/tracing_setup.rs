use std::fs::OpenOptions;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::constants::env;

pub fn init_tracing() {
    init_tracing_with_service("reunite");
}

/// Install the global subscriber: stderr output filtered by `REUNITE_LOG`
/// (default `info`), plus a DEBUG file layer when `REUNITE_LOG_FILE` is set.
/// Calling it twice is harmless; the second call keeps the first subscriber.
pub fn init_tracing_with_service(service_name: &str) {
    let filter = EnvFilter::try_from_env(env::LOG_FILTER)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(filter);

    let registry = tracing_subscriber::registry().with(stderr_layer);

    let file = std::env::var(env::LOG_FILE).ok().and_then(|log_path| {
        match OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(file) => Some((log_path, file)),
            Err(e) => {
                eprintln!("Failed to open log file {}: {}", log_path, e);
                None
            }
        }
    });

    let result = if let Some((log_path, file)) = file {
        let file_layer = fmt::layer()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG);

        let result = registry.with(file_layer).try_init();
        if result.is_ok() {
            eprintln!("File logging enabled: {}", log_path);
        }
        result
    } else {
        registry.try_init()
    };

    if result.is_ok() {
        tracing::debug!(service = service_name, "tracing initialised");
    }
}

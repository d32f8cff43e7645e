//! Structured test logging.
//!
//! Tests that exercise the listener and the waiters interleave many tasks, so
//! a plain `println!` trail is hard to follow. `init_global_test_logging`
//! installs a subscriber that writes compact lines to the test writer and, when
//! a `target/` directory can be found, JSONL to `target/test-logs/phonehome.jsonl`.

use std::path::PathBuf;
use std::sync::{Mutex, Once};
use tracing_subscriber::prelude::*;

static GLOBAL_LOGGING_INIT: Once = Once::new();

/// Install the test subscriber. Safe to call from every test.
///
/// `PHONEHOME_TEST_LOG_LEVEL` sets the level for the bridge crates (default `debug`).
pub fn init_global_test_logging() {
    GLOBAL_LOGGING_INIT.call_once(|| {
        let file_layer = create_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_thread_ids(true)
                .with_current_span(true)
        });

        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level =
            std::env::var("PHONEHOME_TEST_LOG_LEVEL").unwrap_or_else(|_| "debug".to_string());
        let filter = tracing_subscriber::EnvFilter::try_new(format!(
            "phonehome_bridge={level},phonehome_common={level},test={level}"
        ))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stderr_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn create_log_file() -> Option<std::fs::File> {
    let dir = find_target_dir()?.join("test-logs");
    std::fs::create_dir_all(&dir).ok()?;
    std::fs::File::create(dir.join("phonehome.jsonl")).ok()
}

fn find_target_dir() -> Option<PathBuf> {
    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        return Some(PathBuf::from(target_dir));
    }
    let mut cwd = std::env::current_dir().ok()?;
    loop {
        let target = cwd.join("target");
        if target.is_dir() {
            return Some(target);
        }
        if !cwd.pop() {
            return None;
        }
    }
}

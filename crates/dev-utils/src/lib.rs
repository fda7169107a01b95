//! Test helpers shared by the KKV crates.
use std::{
    path::PathBuf,
    sync::{Mutex, Once},
};

use tracing_subscriber::{prelude::*, registry::Registry};

static INIT: Once = Once::new();
static CHROME_GUARD: Mutex<Option<tracing_chrome::FlushGuard>> = Mutex::new(None);

/// Installs colored panic backtraces. When built with `DEBUG` set, also
/// prints spans to stderr and records a chrome trace under `./log`.
///
/// Safe to call from every test binary, only the first call has an effect.
pub fn setup_test_log() {
    INIT.call_once(|| {
        color_backtrace::install();
        if option_env!("DEBUG").is_none() {
            return;
        }
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_line_number(true)
            .with_file(true);
        let chrome_layer = trace_file().map(|path| {
            let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .include_args(true)
                .file(path)
                .build();
            if let Ok(mut slot) = CHROME_GUARD.lock() {
                *slot = Some(guard);
            }
            layer
        });
        let _ = tracing::subscriber::set_global_default(
            Registry::default().with(fmt_layer).with(chrome_layer),
        );
    });
}

fn trace_file() -> Option<PathBuf> {
    let dir = PathBuf::from("./log");
    std::fs::create_dir_all(&dir).ok()?;
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    Some(dir.join(format!("kkv-trace-{}.json", stamp)))
}

//! Process-wide `fern` dispatcher, built once behind a `std::sync::Once`
//! guard and exposed as a reusable `init_logging` call rather than an
//! implicit startup side effect.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, Once};
use std::time::Instant;

static LOGGING: Once = Once::new();
static FILE_LOGGING: DynFileLogger = DynFileLogger {
    file: Mutex::new(None),
};

struct DynFileLogger {
    file: Mutex<Option<File>>,
}

impl Write for &'static DynFileLogger {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.lock().unwrap().as_mut().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.lock().unwrap().as_mut().unwrap().flush()
    }
}

/// Install the global `fern` dispatcher (idempotent across calls) and point
/// its file sink at `log_file`. Safe to call repeatedly; only the first
/// call installs the dispatcher, subsequent calls just retarget the file.
pub fn init_logging(log_file: &Path, level: log::LevelFilter) {
    LOGGING.call_once(|| {
        let start = Instant::now();
        let file: Box<dyn Write + Send + 'static> = Box::new(&FILE_LOGGING);

        fern::Dispatch::new()
            .format(move |out, message, record| {
                let elapsed = start.elapsed().as_secs();
                let hours = elapsed / 3600;
                let mins = elapsed % 3600 / 60;
                let secs = elapsed % 3600 % 60;
                out.finish(format_args!(
                    "[{hours}:{mins}:{secs} {} {}] {}",
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(level)
            .chain(file)
            .apply()
            .expect("logger should initialize correctly");
    });

    *FILE_LOGGING.file.lock().unwrap() =
        Some(fern::log_file(log_file).expect("log file should be creatable"));
}

pub fn level_from_str(level: &str) -> log::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

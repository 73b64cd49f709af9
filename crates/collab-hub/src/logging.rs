use crate::config::Config;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "collab-hub.log";

type SharedLogFile = Arc<Mutex<File>>;

/// Installs the global subscriber. `RUST_LOG` wins over everything else.
pub fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(config.debug, env_level())));
    let (file, open_error) = match open_hub_log(&config.log_dir) {
        Ok(file) => (file, None),
        Err(err) => (None, Some(err)),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || Tee { file: file.clone() })
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return;
    }
    if let Some(err) = open_error {
        warn!(event = "log_file_error", log_dir = %config.log_dir, error = %err);
    }
}

fn env_level() -> Option<String> {
    std::env::var("COLLAB_LOG_LEVEL")
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn default_level(debug: bool, env_level: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    env_level.unwrap_or_else(|| "info".to_string())
}

fn hub_log_path(log_dir: &str) -> Option<PathBuf> {
    let log_dir = log_dir.trim();
    (!log_dir.is_empty()).then(|| Path::new(log_dir).join(LOG_FILE_NAME))
}

fn open_hub_log(log_dir: &str) -> io::Result<Option<SharedLogFile>> {
    let Some(path) = hub_log_path(log_dir) else {
        return Ok(None);
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(Some(Arc::new(Mutex::new(file))))
}

/// Stdout plus the optional hub log file. File errors never fail a log line.
struct Tee {
    file: Option<SharedLogFile>,
}

impl Tee {
    fn with_file(&self, op: impl FnOnce(&mut File)) {
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            op(&mut *file);
        }
    }
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.with_file(|file| {
            let _ = file.write_all(buf);
        });
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| {
            let _ = file.flush();
        });
        io::stdout().flush()
    }
}

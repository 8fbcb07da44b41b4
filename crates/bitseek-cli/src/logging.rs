use crate::config::RuntimeConfig;
use chrono::Utc;
use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// Owns the optional log file shared by every writer; flushes it on drop.
pub struct LogGuard {
    file: Option<Arc<StdMutex<File>>>,
}

impl LogGuard {
    fn new(file: Option<File>) -> Self {
        Self {
            file: file.map(|file| Arc::new(StdMutex::new(file))),
        }
    }

    fn make_writer(&self) -> BoxMakeWriter {
        let file = self.file.clone();
        BoxMakeWriter::new(move || MultiWriter { file: file.clone() })
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
                let _ = file.sync_all();
            }
        }
    }
}

struct MultiWriter {
    file: Option<Arc<StdMutex<File>>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stderr().flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

/// `RUST_LOG` wins, then `BITSEEK_LOG_LEVEL`, then a level derived from
/// `--debug`/`--verbose`.
pub fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
    let level = env::var("BITSEEK_LOG_LEVEL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default_level(config).to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = config.log_dir.as_deref().and_then(|dir| match open_log_file(dir) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    });
    let guard = LogGuard::new(file);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(guard.make_writer())
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn default_level(config: &RuntimeConfig) -> &'static str {
    if config.debug || config.verbose {
        "debug"
    } else {
        "warn"
    }
}

fn open_log_file(dir: &Path) -> io::Result<File> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("bitseek-{}.log", Utc::now().format("%Y%m%d")));
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GlobalArgs;

    #[test]
    fn level_follows_debug_and_verbose() {
        let quiet = RuntimeConfig::resolve(&GlobalArgs::default(), |_| None);
        assert_eq!(default_level(&quiet), "warn");
        let args = GlobalArgs {
            verbose: true,
            ..GlobalArgs::default()
        };
        let loud = RuntimeConfig::resolve(&args, |_| None);
        assert_eq!(default_level(&loud), "debug");
    }

    #[test]
    fn log_file_is_created_in_missing_directory() {
        let dir = env::temp_dir().join(format!("bitseek-log-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut file = open_log_file(&dir.join("nested")).expect("log file");
        file.write_all(b"line\n").expect("write");
        let entries = std::fs::read_dir(dir.join("nested")).expect("read dir").count();
        assert_eq!(entries, 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn guard_writers_share_one_file_until_dropped() {
        let dir = env::temp_dir().join(format!("bitseek-guard-test-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let guard = LogGuard::new(Some(open_log_file(&dir).expect("log file")));
        for line in ["first\n", "second\n"] {
            let mut writer = MultiWriter {
                file: guard.file.clone(),
            };
            writer.write_all(line.as_bytes()).expect("write");
        }
        drop(guard);
        let path = std::fs::read_dir(&dir)
            .expect("read dir")
            .next()
            .expect("one log file")
            .expect("dir entry")
            .path();
        let contents = std::fs::read_to_string(path).expect("read log");
        assert_eq!(contents, "first\nsecond\n");
        let _ = std::fs::remove_dir_all(&dir);
    }
}

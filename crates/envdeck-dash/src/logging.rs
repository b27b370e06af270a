use std::{
    env,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

/// Keeps the log file handle alive for the life of the process.
pub struct LogGuard {
    file: Option<Arc<Mutex<fs::File>>>,
    pub path: Option<PathBuf>,
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<Arc<Mutex<fs::File>>>,
}

/// Installs the global subscriber. `role` names the process ("outer" or
/// "inner") in the log file name. The inner process owns the terminal, so it
/// never mirrors to stdout.
pub fn init_logging(role: &str) -> Option<LogGuard> {
    let level = env::var("ENVDECK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match open_log_file(&log_dir(), role) {
        Ok(guard) => guard,
        Err(err) => {
            if role != "inner" {
                eprintln!("envdeck: log file unavailable: {err}");
            }
            LogGuard {
                file: None,
                path: None,
            }
        }
    };
    let file = guard.file.clone();
    let stdout_enabled = role != "inner" && stdout_requested();
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
        stdout_enabled,
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn stdout_requested() -> bool {
    matches!(
        env::var("ENVDECK_LOG_STDOUT").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") | Some("YES")
    )
}

fn log_dir() -> PathBuf {
    match env::var("ENVDECK_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
        _ => envdeck_mux::state_dir().join("logs"),
    }
}

fn open_log_file(dir: &Path, role: &str) -> io::Result<LogGuard> {
    fs::create_dir_all(dir)?;
    let path = dir.join(log_file_name(role, std::process::id()));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
        path: Some(path),
    })
}

fn log_file_name(role: &str, pid: u32) -> String {
    let role: String = role
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
        .collect();
    format!("envdeck-{role}-{pid}.log")
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|p| p.into_inner());
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|p| p.into_inner());
            let _ = file.flush();
        }
        Ok(())
    }
}

use crate::error::MuxError;
use crate::runner::{args, ControlClient, MuxRunner};
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};
use tracing::{debug, info, warn};

/// Name of the single multiplexer session every instance hosts.
pub const SESSION_NAME: &str = "envdeck";
pub const DEFAULT_WIDTH: u16 = 200;
pub const DEFAULT_HEIGHT: u16 = 50;
const SOCKET_PREFIX: &str = "envdeck";

/// One multiplexer instance scoped to this run.
///
/// The handle is constructed explicitly and passed to every component that
/// needs it; whoever created it owns its lifecycle.
pub struct MuxServer {
    name: String,
    runner: Arc<dyn MuxRunner>,
    marker_dir: Option<PathBuf>,
    owned: bool,
    started: AtomicBool,
    control: Mutex<Option<Box<dyn ControlClient>>>,
    exec_lock: Mutex<()>,
}

impl MuxServer {
    /// A fresh instance named after the current process id.
    pub fn new(runner: Arc<dyn MuxRunner>, marker_dir: Option<PathBuf>) -> Self {
        let name = socket_name_for(std::process::id());
        Self::with_name(runner, name, marker_dir)
    }

    pub fn with_name(
        runner: Arc<dyn MuxRunner>,
        name: impl Into<String>,
        marker_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            runner,
            marker_dir,
            owned: true,
            started: AtomicBool::new(false),
            control: Mutex::new(None),
            exec_lock: Mutex::new(()),
        }
    }

    /// Attaches to an instance another process already started. Adopted
    /// instances never write or remove liveness markers.
    pub fn adopt(runner: Arc<dyn MuxRunner>, name: impl Into<String>) -> Self {
        let server = Self {
            name: name.into(),
            runner,
            marker_dir: None,
            owned: false,
            started: AtomicBool::new(true),
            control: Mutex::new(None),
            exec_lock: Mutex::new(()),
        };
        debug!(socket = %server.name, "mux_adopted");
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Target string for a pane of the main window, e.g. `envdeck:0.1`.
    pub fn main_pane(&self, index: usize) -> String {
        format!("{SESSION_NAME}:0.{index}")
    }

    /// Creates the detached instance if it is not running yet. `command` is
    /// what region A runs; empty means the default shell.
    pub fn ensure_started(
        &self,
        size: Option<(u16, u16)>,
        command: &[String],
    ) -> Result<(), MuxError> {
        if self.is_started() {
            return Ok(());
        }
        let (width, height) = match size {
            Some((w, h)) if w > 0 && h > 0 => (w, h),
            _ => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
        };

        let mut sized = args(["new-session", "-d", "-s", SESSION_NAME]);
        sized.extend(args(["-x", &width.to_string(), "-y", &height.to_string()]));
        sized.extend(command.iter().cloned());
        if let Err(err) = self.run(&sized) {
            debug!(socket = %self.name, error = %err, "sized_new_session_failed_retrying");
            let mut plain = args(["new-session", "-d", "-s", SESSION_NAME]);
            plain.extend(command.iter().cloned());
            self.run(&plain)?;
        }
        self.started.store(true, Ordering::SeqCst);
        info!(socket = %self.name, width, height, "mux_started");

        for option in global_options() {
            self.run_quiet(&option);
        }

        match self
            .runner
            .spawn_client(&self.name, &args(["-C", "attach-session", "-t", SESSION_NAME]))
        {
            Ok(client) => {
                if let Ok(mut slot) = self.control.lock() {
                    *slot = Some(client);
                }
            }
            Err(err) => warn!(socket = %self.name, error = %err, "keepalive_client_failed"),
        }

        self.write_marker();
        Ok(())
    }

    /// Executes one command scoped to this instance. Calls are serialized.
    pub fn run(&self, args: &[String]) -> Result<String, MuxError> {
        let _guard = self.exec_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.runner.run(&self.name, args)
    }

    /// Best-effort variant: failures are logged and dropped.
    pub fn run_quiet(&self, args: &[String]) {
        if let Err(err) = self.run(args) {
            debug!(socket = %self.name, error = %err, "best_effort_call_failed");
        }
    }

    /// Stops only the hidden keep-alive client, before a real terminal
    /// attaches.
    pub fn kill_control_client(&self) {
        let client = match self.control.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut client) = client {
            client.stop();
            debug!(socket = %self.name, "keepalive_client_stopped");
        }
    }

    /// Full teardown. Safe to call repeatedly.
    pub fn kill(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.kill_control_client();
        self.run_quiet(&args(["kill-server"]));
        self.remove_marker();
        info!(socket = %self.name, "mux_killed");
    }

    /// Wakes every client blocked on `channel`.
    pub fn signal(&self, channel: &str) -> Result<(), MuxError> {
        self.run(&args(["wait-for", "-S", channel])).map(|_| ())
    }

    /// Blocks until `channel` is signalled. Does not hold the exec lock so
    /// other calls keep flowing while waiting.
    pub fn wait_for(&self, channel: &str) -> Result<(), MuxError> {
        self.runner
            .run(&self.name, &args(["wait-for", channel]))
            .map(|_| ())
    }

    /// Hands the caller's terminal to the instance until detach or teardown.
    pub fn attach(&self) -> Result<(), MuxError> {
        self.runner
            .run_interactive(&self.name, &args(["attach-session", "-t", SESSION_NAME]))
    }

    fn marker_path(&self) -> Option<PathBuf> {
        if !self.owned {
            return None;
        }
        self.marker_dir
            .as_ref()
            .map(|dir| dir.join(std::process::id().to_string()))
    }

    fn write_marker(&self) {
        let Some(path) = self.marker_path() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(err) = fs::write(&path, &self.name) {
            warn!(path = %path.display(), error = %err, "marker_write_failed");
        }
    }

    fn remove_marker(&self) {
        if let Some(path) = self.marker_path() {
            let _ = fs::remove_file(path);
        }
    }
}

fn global_options() -> Vec<Vec<String>> {
    let home = format!("{SESSION_NAME}:0.0");
    vec![
        args(["set-option", "-g", "remain-on-exit", "on"]),
        args(["set-option", "-g", "status", "off"]),
        args(["set-option", "-g", "mouse", "on"]),
        args(["set-option", "-s", "escape-time", "0"]),
        args(["set-option", "-g", "window-size", "latest"]),
        args(["set-option", "-g", "history-limit", "50000"]),
        args(["bind-key", "-n", "C-g", "select-pane", "-t", &home]),
    ]
}

pub fn socket_name_for(pid: u32) -> String {
    format!("{SOCKET_PREFIX}-{pid}")
}

/// Per-user state directory for envdeck.
pub fn state_dir() -> PathBuf {
    if let Ok(value) = env::var("ENVDECK_STATE_DIR") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    if let Ok(value) = env::var("XDG_STATE_HOME") {
        if !value.trim().is_empty() {
            return PathBuf::from(value).join("envdeck");
        }
    }
    if let Ok(value) = env::var("HOME") {
        return PathBuf::from(value)
            .join(".local")
            .join("state")
            .join("envdeck");
    }
    PathBuf::from(".envdeck/state")
}

pub fn default_marker_dir() -> PathBuf {
    state_dir().join("mux")
}

/// Whether a process with this pid exists. Permission errors count as alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    true
}

/// Force-kills instances whose owning process is gone and removes their
/// markers. Markers of live processes are left alone. Returns the pids that
/// were cleaned.
pub fn cleanup_stale(
    dir: &Path,
    runner: &dyn MuxRunner,
    is_alive: &dyn Fn(u32) -> bool,
) -> Vec<u32> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut cleaned = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(pid) = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if is_alive(pid) {
            continue;
        }
        let socket = fs::read_to_string(&path)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| socket_name_for(pid));
        if let Err(err) = runner.run(&socket, &args(["kill-server"])) {
            debug!(socket = %socket, error = %err, "stale_kill_failed");
        }
        let _ = fs::remove_file(&path);
        info!(pid, socket = %socket, "stale_instance_cleaned");
        cleaned.push(pid);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeMux;

    #[test]
    fn ensure_started_is_idempotent_and_applies_options() {
        let fake = Arc::new(FakeMux::new());
        let server = MuxServer::with_name(fake.clone(), "envdeck-test", None);

        server.ensure_started(Some((120, 40)), &[]).expect("start");
        server.ensure_started(Some((120, 40)), &[]).expect("start again");

        assert_eq!(fake.count_calls("new-session"), 1);
        assert!(fake.count_calls("set-option") >= 5);
        assert_eq!(fake.clients_spawned(), 1);
        assert!(server.is_started());
    }

    #[test]
    fn ensure_started_retries_without_sizing() {
        let fake = Arc::new(FakeMux::new());
        fake.fail_when(|args| {
            args.first().map(String::as_str) == Some("new-session")
                && args.iter().any(|a| a == "-x")
        });
        let server = MuxServer::with_name(fake.clone(), "envdeck-test", None);

        server.ensure_started(None, &[]).expect("fallback start");

        let calls = fake.calls_for("new-session");
        assert_eq!(calls.len(), 2);
        assert!(!calls[1].iter().any(|a| a == "-x"));
    }

    #[test]
    fn keepalive_failure_is_not_fatal() {
        let fake = Arc::new(FakeMux::new());
        fake.fail_clients();
        let server = MuxServer::with_name(fake.clone(), "envdeck-test", None);
        assert!(server.ensure_started(None, &[]).is_ok());
    }

    #[test]
    fn kill_is_idempotent_and_removes_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = Arc::new(FakeMux::new());
        let server = MuxServer::with_name(fake.clone(), "envdeck-test", Some(dir.path().into()));
        server.ensure_started(None, &[]).expect("start");
        let marker = dir.path().join(std::process::id().to_string());
        assert!(marker.exists());

        server.kill();
        server.kill();

        assert_eq!(fake.count_calls("kill-server"), 1);
        assert!(!marker.exists());
        assert_eq!(fake.clients_stopped(), 1);
    }

    #[test]
    fn adopted_instance_never_writes_markers() {
        let fake = Arc::new(FakeMux::new());
        let server = MuxServer::adopt(fake, "envdeck-999");
        assert!(server.is_started());
        assert!(server.marker_path().is_none());
    }

    #[test]
    fn stale_cleanup_is_pid_scoped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let own = std::process::id();
        fs::write(dir.path().join("424242"), "envdeck-424242").expect("dead marker");
        fs::write(dir.path().join("1000"), "envdeck-1000").expect("live marker");
        fs::write(dir.path().join(own.to_string()), socket_name_for(own)).expect("own marker");
        fs::write(dir.path().join("notes.txt"), "ignored").expect("junk");
        let fake = FakeMux::new();

        let alive = |pid: u32| pid == 1000 || pid == own;
        let cleaned = cleanup_stale(dir.path(), &fake, &alive);

        assert_eq!(cleaned, vec![424242]);
        assert!(!dir.path().join("424242").exists());
        assert!(dir.path().join("1000").exists());
        assert!(dir.path().join(own.to_string()).exists());
        let kills = fake.calls_for("kill-server");
        assert_eq!(kills.len(), 1);
        assert_eq!(fake.sockets_for("kill-server"), vec!["envdeck-424242".to_string()]);
    }

    #[test]
    fn own_pid_counts_as_alive() {
        assert!(pid_alive(std::process::id()));
    }
}

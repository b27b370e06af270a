use crate::error::MuxError;
use crate::runner::args;
use crate::server::{MuxServer, SESSION_NAME};
use std::{
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use tracing::{debug, info};

/// Id reserved for untracked preview sessions.
pub const UNTRACKED_ID: u64 = 0;
/// Exit code reported while a session is alive or its status is unknown.
pub const EXIT_UNKNOWN: i32 = -1;
const WATCH_INTERVAL: Duration = Duration::from_millis(250);

/// What to run in a new window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn args<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn dir(mut self, dir: Option<PathBuf>) -> Self {
        self.dir = dir;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Liveness {
    alive: bool,
    exit_code: i32,
}

/// One spawned command bound to one multiplexer window.
pub struct Session {
    id: u64,
    label: String,
    window: String,
    spec: SpawnSpec,
    server: Arc<MuxServer>,
    liveness: Arc<Mutex<Liveness>>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("window", &self.window)
            .finish()
    }
}

impl Session {
    /// Spawns `spec` in a new detached window sized `width`x`height` and
    /// starts the background watcher.
    pub fn create(
        id: u64,
        label: impl Into<String>,
        spec: SpawnSpec,
        size: (u16, u16),
        server: Arc<MuxServer>,
    ) -> Result<Arc<Self>, MuxError> {
        let label = label.into();
        let target = format!("{SESSION_NAME}:");
        let mut cmd = args(["new-window", "-d", "-P", "-F", "#{pane_id}", "-t", &target]);
        cmd.extend(args(["-n", &label]));
        if let Some(dir) = &spec.dir {
            cmd.push("-c".to_string());
            cmd.push(dir.to_string_lossy().into_owned());
        }
        for (key, value) in &spec.env {
            cmd.push("-e".to_string());
            cmd.push(format!("{key}={value}"));
        }
        cmd.push(spec.program.clone());
        cmd.extend(spec.args.iter().cloned());

        let output = server.run(&cmd)?;
        let window = output.trim().to_string();
        if !window.starts_with('%') {
            return Err(MuxError::Parse(format!("expected pane id, got {window:?}")));
        }

        let session = Arc::new(Self {
            id,
            label,
            window,
            spec,
            server,
            liveness: Arc::new(Mutex::new(Liveness {
                alive: true,
                exit_code: EXIT_UNKNOWN,
            })),
            closed: Arc::new(AtomicBool::new(false)),
        });
        session.resize(size.0, size.1);
        session.spawn_watcher();
        info!(id, label = %session.label, window = %session.window, program = %session.spec.program, "session_created");
        Ok(session)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Opaque window handle. It follows the session's content through swaps.
    pub fn window(&self) -> &str {
        &self.window
    }

    pub fn spec(&self) -> &SpawnSpec {
        &self.spec
    }

    pub fn is_alive(&self) -> bool {
        self.read().alive
    }

    /// Exit code once the command terminated, `EXIT_UNKNOWN` before.
    pub fn exit_code(&self) -> i32 {
        self.read().exit_code
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn resize(&self, width: u16, height: u16) {
        if width == 0 || height == 0 {
            return;
        }
        self.server.run_quiet(&args([
            "resize-window",
            "-t",
            &self.window,
            "-x",
            &width.to_string(),
            "-y",
            &height.to_string(),
        ]));
    }

    /// Restarts the command in place after it exited. No-op while alive.
    pub fn respawn(&self) -> Result<(), MuxError> {
        if self.is_closed() || self.is_alive() {
            return Ok(());
        }
        self.server
            .run(&args(["respawn-pane", "-k", "-t", &self.window]))?;
        self.write(Liveness {
            alive: true,
            exit_code: EXIT_UNKNOWN,
        });
        self.spawn_watcher();
        info!(id = self.id, label = %self.label, "session_respawned");
        Ok(())
    }

    /// Tears the window down on a background thread. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.liveness.lock().unwrap_or_else(|p| p.into_inner());
            state.alive = false;
        }
        let server = self.server.clone();
        let window = self.window.clone();
        let label = self.label.clone();
        thread::spawn(move || {
            server.run_quiet(&args(["kill-window", "-t", &window]));
            debug!(label = %label, window = %window, "session_closed");
        });
    }

    fn read(&self) -> Liveness {
        *self.liveness.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self, value: Liveness) {
        *self.liveness.lock().unwrap_or_else(|p| p.into_inner()) = value;
    }

    fn spawn_watcher(&self) {
        let server = self.server.clone();
        let window = self.window.clone();
        let liveness = self.liveness.clone();
        let closed = self.closed.clone();
        let id = self.id;
        thread::spawn(move || watch(id, server, window, liveness, closed));
    }
}

fn watch(
    id: u64,
    server: Arc<MuxServer>,
    window: String,
    liveness: Arc<Mutex<Liveness>>,
    closed: Arc<AtomicBool>,
) {
    let query = args([
        "display-message",
        "-p",
        "-t",
        &window,
        "#{pane_dead} #{pane_dead_status}",
    ]);
    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }
        let observed = server
            .run(&query)
            .map_err(|err| err.to_string())
            .and_then(|out| parse_dead_status(&out));
        match observed {
            Ok(None) => {}
            Ok(Some(code)) => {
                set_dead(&liveness, code);
                info!(id, window = %window, exit_code = code, "session_exited");
                return;
            }
            Err(err) => {
                set_dead(&liveness, EXIT_UNKNOWN);
                debug!(id, window = %window, error = %err, "session_watch_lost");
                return;
            }
        }
        thread::sleep(WATCH_INTERVAL);
    }
}

fn set_dead(liveness: &Mutex<Liveness>, code: i32) {
    let mut state = liveness.lock().unwrap_or_else(|p| p.into_inner());
    state.alive = false;
    state.exit_code = code;
}

/// Parses `#{pane_dead} #{pane_dead_status}`: `None` while running,
/// `Some(code)` once dead.
fn parse_dead_status(output: &str) -> Result<Option<i32>, String> {
    let mut parts = output.split_whitespace();
    match parts.next() {
        Some("0") => Ok(None),
        Some("1") => Ok(Some(
            parts
                .next()
                .and_then(|code| code.parse::<i32>().ok())
                .unwrap_or(EXIT_UNKNOWN),
        )),
        other => Err(format!("unexpected pane status {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{wait_until, FakeMux};

    fn server(fake: &Arc<FakeMux>) -> Arc<MuxServer> {
        Arc::new(MuxServer::adopt(fake.clone(), "envdeck-test"))
    }

    #[test]
    fn parse_dead_status_variants() {
        assert_eq!(parse_dead_status("0 \n"), Ok(None));
        assert_eq!(parse_dead_status("1 3\n"), Ok(Some(3)));
        assert_eq!(parse_dead_status("1\n"), Ok(Some(EXIT_UNKNOWN)));
        assert!(parse_dead_status("").is_err());
    }

    #[test]
    fn create_builds_new_window_command() {
        let fake = Arc::new(FakeMux::new());
        let spec = SpawnSpec::new("bash")
            .arg("-l")
            .dir(Some(PathBuf::from("/srv/app")))
            .env("ENVDECK_SENTINEL", "/tmp/x");
        let session = Session::create(1, "Shell — app", spec, (100, 30), server(&fake))
            .expect("create");

        assert_eq!(session.window(), "%1");
        let call = &fake.calls_for("new-window")[0];
        assert!(call.windows(2).any(|w| w[0] == "-c" && w[1] == "/srv/app"));
        assert!(call.windows(2).any(|w| w[0] == "-e" && w[1] == "ENVDECK_SENTINEL=/tmp/x"));
        assert_eq!(&call[call.len() - 2..], &["bash".to_string(), "-l".to_string()]);
        assert_eq!(fake.count_calls("resize-window"), 1);
        session.close();
    }

    #[test]
    fn watcher_records_exit_code() {
        let fake = Arc::new(FakeMux::new());
        let session = Session::create(1, "build", SpawnSpec::new("make"), (80, 24), server(&fake))
            .expect("create");
        assert!(session.is_alive());
        assert_eq!(session.exit_code(), EXIT_UNKNOWN);

        fake.exit_pane(session.window(), 2);

        assert!(wait_until(Duration::from_secs(3), || !session.is_alive()));
        assert_eq!(session.exit_code(), 2);
    }

    #[test]
    fn watcher_fails_safe_when_window_vanishes() {
        let fake = Arc::new(FakeMux::new());
        let session = Session::create(1, "tail", SpawnSpec::new("tail"), (80, 24), server(&fake))
            .expect("create");

        fake.vanish_pane(session.window());

        assert!(wait_until(Duration::from_secs(3), || !session.is_alive()));
        assert_eq!(session.exit_code(), EXIT_UNKNOWN);
    }

    #[test]
    fn close_is_idempotent_and_async() {
        let fake = Arc::new(FakeMux::new());
        let session = Session::create(1, "sh", SpawnSpec::new("sh"), (80, 24), server(&fake))
            .expect("create");
        let window = session.window().to_string();

        session.close();
        session.close();

        assert!(!session.is_alive());
        assert!(wait_until(Duration::from_secs(3), || !fake.is_live(&window)));
        assert_eq!(fake.count_calls("kill-window"), 1);
    }

    #[test]
    fn respawn_revives_dead_session() {
        let fake = Arc::new(FakeMux::new());
        let session = Session::create(1, "job", SpawnSpec::new("job"), (80, 24), server(&fake))
            .expect("create");
        fake.exit_pane(session.window(), 1);
        assert!(wait_until(Duration::from_secs(3), || !session.is_alive()));

        session.respawn().expect("respawn");

        assert!(session.is_alive());
        assert_eq!(session.exit_code(), EXIT_UNKNOWN);
        session.close();
    }

    #[test]
    fn create_propagates_spawn_failure() {
        let fake = Arc::new(FakeMux::new());
        fake.fail_when(|args| args.first().map(String::as_str) == Some("new-window"));
        let result = Session::create(1, "x", SpawnSpec::new("x"), (80, 24), server(&fake));
        assert!(result.is_err());
    }
}

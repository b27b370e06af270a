//! Scripted in-memory multiplexer for tests.
//!
//! `FakeMux` implements [`MuxRunner`] and keeps just enough state to answer
//! the queries the engine makes: pane ids handed out by `new-window` and
//! `split-window`, dead panes and their exit status, the zoom flag, pane
//! geometry. Every call is recorded with its socket.

use crate::error::MuxError;
use crate::runner::{ControlClient, MuxRunner};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

type FailRule = Box<dyn Fn(&[String]) -> bool + Send + Sync>;

#[derive(Default)]
struct FakeState {
    calls: Vec<(String, Vec<String>)>,
    next_pane: u32,
    live: HashSet<String>,
    dead: HashMap<String, i32>,
    zoomed: bool,
    dims: (u16, u16),
    fail_clients: bool,
}

pub struct FakeMux {
    state: Mutex<FakeState>,
    rules: Mutex<Vec<FailRule>>,
    clients_spawned: Arc<AtomicUsize>,
    clients_stopped: Arc<AtomicUsize>,
}

impl Default for FakeMux {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMux {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_pane: 1,
                dims: (120, 40),
                ..FakeState::default()
            }),
            rules: Mutex::new(Vec::new()),
            clients_spawned: Arc::new(AtomicUsize::new(0)),
            clients_stopped: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes every call matching `rule` fail with a non-zero status.
    pub fn fail_when<F>(&self, rule: F)
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.rules.lock().unwrap().push(Box::new(rule));
    }

    pub fn clear_failures(&self) {
        self.rules.lock().unwrap().clear();
    }

    pub fn fail_clients(&self) {
        self.state.lock().unwrap().fail_clients = true;
    }

    /// Marks a pane's command as exited with `code`.
    pub fn exit_pane(&self, pane: &str, code: i32) {
        let mut state = self.state.lock().unwrap();
        state.live.remove(pane);
        state.dead.insert(pane.to_string(), code);
    }

    /// Removes a pane entirely, as if its window was destroyed externally.
    pub fn vanish_pane(&self, pane: &str) {
        let mut state = self.state.lock().unwrap();
        state.live.remove(pane);
        state.dead.remove(pane);
    }

    pub fn set_dimensions(&self, width: u16, height: u16) {
        self.state.lock().unwrap().dims = (width, height);
    }

    pub fn is_zoomed(&self) -> bool {
        self.state.lock().unwrap().zoomed
    }

    pub fn is_live(&self, pane: &str) -> bool {
        self.state.lock().unwrap().live.contains(pane)
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        let state = self.state.lock().unwrap();
        state.calls.iter().map(|(_, args)| args.clone()).collect()
    }

    pub fn calls_for(&self, command: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|args| args.first().map(String::as_str) == Some(command))
            .collect()
    }

    pub fn count_calls(&self, command: &str) -> usize {
        self.calls_for(command).len()
    }

    pub fn sockets_for(&self, command: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .filter(|(_, args)| args.first().map(String::as_str) == Some(command))
            .map(|(socket, _)| socket.clone())
            .collect()
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn clients_spawned(&self) -> usize {
        self.clients_spawned.load(Ordering::SeqCst)
    }

    pub fn clients_stopped(&self) -> usize {
        self.clients_stopped.load(Ordering::SeqCst)
    }

    fn should_fail(&self, args: &[String]) -> bool {
        self.rules.lock().unwrap().iter().any(|rule| rule(args))
    }

    fn allocate_pane(state: &mut FakeState) -> String {
        let pane = format!("%{}", state.next_pane);
        state.next_pane += 1;
        state.live.insert(pane.clone());
        pane
    }

    fn display(state: &FakeState, args: &[String]) -> Result<String, MuxError> {
        let target = flag_value(args, "-t").unwrap_or_default();
        let format = args.last().cloned().unwrap_or_default();
        if format.contains("pane_dead") {
            if let Some(code) = state.dead.get(&target) {
                return Ok(format!("1 {code}\n"));
            }
            // Named targets like `envdeck:0.0` are the main window's own
            // panes and stay live unless a test exits them.
            if state.live.contains(&target) || !target.starts_with('%') {
                return Ok("0 \n".to_string());
            }
            return Err(MuxError::command(args, 1, "can't find pane"));
        }
        if format.contains("window_zoomed_flag") {
            return Ok(if state.zoomed { "1\n" } else { "0\n" }.to_string());
        }
        if format.contains("pane_width") {
            return Ok(format!("{} {}\n", state.dims.0, state.dims.1));
        }
        Ok(String::new())
    }
}

impl MuxRunner for FakeMux {
    fn run(&self, socket: &str, args: &[String]) -> Result<String, MuxError> {
        let failing = self.should_fail(args);
        let mut state = self.state.lock().unwrap();
        state.calls.push((socket.to_string(), args.to_vec()));
        if failing {
            return Err(MuxError::command(args, 1, "scripted failure"));
        }
        let command = args.first().map(String::as_str).unwrap_or_default();
        match command {
            "new-window" | "split-window" => {
                let pane = Self::allocate_pane(&mut state);
                Ok(format!("{pane}\n"))
            }
            "display-message" => Self::display(&state, args),
            "resize-pane" if args.iter().any(|a| a == "-Z") => {
                state.zoomed = !state.zoomed;
                Ok(String::new())
            }
            "kill-window" | "kill-pane" => {
                if let Some(target) = flag_value(args, "-t") {
                    state.live.remove(&target);
                    state.dead.remove(&target);
                }
                Ok(String::new())
            }
            "respawn-pane" => {
                if let Some(target) = flag_value(args, "-t") {
                    state.dead.remove(&target);
                    state.live.insert(target);
                }
                Ok(String::new())
            }
            _ => Ok(String::new()),
        }
    }

    fn spawn_client(
        &self,
        socket: &str,
        args: &[String],
    ) -> Result<Box<dyn ControlClient>, MuxError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((socket.to_string(), args.to_vec()));
        if state.fail_clients {
            return Err(MuxError::command(args, 1, "client refused"));
        }
        self.clients_spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeClient {
            stopped: self.clients_stopped.clone(),
            done: false,
        }))
    }

    fn run_interactive(&self, socket: &str, args: &[String]) -> Result<(), MuxError> {
        self.run(socket, args).map(|_| ())
    }
}

struct FakeClient {
    stopped: Arc<AtomicUsize>,
    done: bool,
}

impl ControlClient for FakeClient {
    fn stop(&mut self) {
        if !self.done {
            self.done = true;
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1))
        .cloned()
}

/// Polls `check` until it holds or `timeout` elapses.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

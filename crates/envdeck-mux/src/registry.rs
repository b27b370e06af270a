use crate::error::MuxError;
use crate::label::next_label;
use crate::pane::PaneLayout;
use crate::server::{MuxServer, DEFAULT_HEIGHT, DEFAULT_WIDTH};
use crate::session::{Session, SpawnSpec, EXIT_UNKNOWN, UNTRACKED_ID};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Labels starting with this prefix are log followers and get swept by
/// [`SessionRegistry::close_dead_logs`].
pub const LOG_VIEW_PREFIX: &str = "Logs — ";

/// One row of the tab strip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabInfo {
    pub position: usize,
    pub label: String,
    pub active: bool,
    pub alive: bool,
}

struct RegistryState {
    sessions: Vec<Arc<Session>>,
    active: usize,
    next_id: u64,
}

impl RegistryState {
    fn active_session(&self) -> Option<Arc<Session>> {
        self.sessions.get(self.active).cloned()
    }

    /// Live sessions win over dead ones carrying the same label.
    fn position_of(&self, label: &str) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.label() == label && s.is_alive())
            .or_else(|| self.sessions.iter().rposition(|s| s.label() == label))
    }

    fn clamp_active(&mut self) {
        if self.sessions.is_empty() {
            self.active = 0;
        } else if self.active >= self.sessions.len() {
            self.active = self.sessions.len() - 1;
        }
    }
}

/// Ordered set of tracked sessions ("tabs") plus the active index.
///
/// Bookkeeping happens under `state`; multiplexer calls run after it is
/// released. `view` orders viewport changes so the shown window always
/// matches the last bookkeeping step that asked for it.
pub struct SessionRegistry {
    server: Arc<MuxServer>,
    layout: Option<Arc<PaneLayout>>,
    state: Mutex<RegistryState>,
    view: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(server: Arc<MuxServer>, layout: Option<Arc<PaneLayout>>) -> Self {
        Self {
            server,
            layout,
            state: Mutex::new(RegistryState {
                sessions: Vec::new(),
                active: 0,
                next_id: 1,
            }),
            view: Mutex::new(()),
        }
    }

    pub fn server(&self) -> &Arc<MuxServer> {
        &self.server
    }

    pub fn layout(&self) -> Option<&Arc<PaneLayout>> {
        self.layout.as_ref()
    }

    /// Focuses the live session named `label`, or creates one.
    pub fn open(&self, label: &str, spec: SpawnSpec) -> Result<Arc<Session>, MuxError> {
        let existing = {
            let state = self.lock();
            state
                .sessions
                .iter()
                .position(|s| s.label() == label && s.is_alive())
        };
        if let Some(index) = existing {
            if let Some(session) = self.focus_by_index(index) {
                if session.label() == label {
                    return Ok(session);
                }
            }
        }
        self.spawn(label.to_string(), spec)
    }

    /// Always creates a session, suffixing the label when live sessions
    /// already use it.
    pub fn open_new(&self, label: &str, spec: SpawnSpec) -> Result<Arc<Session>, MuxError> {
        let label = {
            let state = self.lock();
            let live: Vec<&str> = state
                .sessions
                .iter()
                .filter(|s| s.is_alive())
                .map(|s| s.label())
                .collect();
            next_label(label, live).to_string()
        };
        self.spawn(label, spec)
    }

    /// Spawns a session the registry does not track, for a quick look in the
    /// viewport. The caller owns it and must close it.
    pub fn open_preview(&self, label: &str, spec: SpawnSpec) -> Result<Arc<Session>, MuxError> {
        let size = self.viewport_size();
        let session = Session::create(UNTRACKED_ID, label, spec, size, self.server.clone())?;
        if let Some(layout) = &self.layout {
            let _view = self.view_guard();
            layout.show_session(session.window());
        }
        Ok(session)
    }

    pub fn focus_by_label(&self, label: &str) -> Option<Arc<Session>> {
        let index = {
            let state = self.lock();
            state
                .sessions
                .iter()
                .position(|s| s.label() == label && s.is_alive())
        }?;
        self.focus_by_index(index)
    }

    pub fn focus_by_index(&self, index: usize) -> Option<Arc<Session>> {
        let _view = self.view_guard();
        let (target, changed) = {
            let mut state = self.lock();
            let target = state.sessions.get(index).cloned()?;
            let changed = state.active != index;
            state.active = index;
            (target, changed)
        };
        if changed || !self.is_shown(target.window()) {
            self.show(target.window());
        }
        Some(target)
    }

    pub fn next_tab(&self) {
        self.step(1);
    }

    pub fn prev_tab(&self) {
        self.step(-1);
    }

    fn step(&self, delta: isize) {
        let _view = self.view_guard();
        let target = {
            let mut state = self.lock();
            let len = state.sessions.len();
            if len < 2 {
                return;
            }
            state.active = (state.active as isize + delta).rem_euclid(len as isize) as usize;
            state.active_session()
        };
        if let Some(session) = target {
            self.show(session.window());
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.lock().sessions.iter().any(|s| s.label() == label)
    }

    pub fn is_label_alive(&self, label: &str) -> bool {
        self.lock()
            .sessions
            .iter()
            .any(|s| s.label() == label && s.is_alive())
    }

    /// Exit code of the session named `label`; `EXIT_UNKNOWN` if it never
    /// ran or is still running.
    pub fn exit_code_for_label(&self, label: &str) -> i32 {
        let state = self.lock();
        state
            .position_of(label)
            .and_then(|i| state.sessions.get(i))
            .map(|s| s.exit_code())
            .unwrap_or(EXIT_UNKNOWN)
    }

    pub fn find_by_label(&self, label: &str) -> Option<Arc<Session>> {
        let state = self.lock();
        state
            .position_of(label)
            .and_then(|i| state.sessions.get(i).cloned())
    }

    /// Closes the active tab. Returns its label, or `None` when empty.
    pub fn close_active(&self) -> Option<String> {
        let id = self.lock().active_session()?.id();
        self.close_matching(|s| s.id() == id)
            .into_iter()
            .next()
    }

    pub fn close_by_label(&self, label: &str) -> bool {
        let id = {
            let state = self.lock();
            state
                .position_of(label)
                .and_then(|i| state.sessions.get(i))
                .map(|s| s.id())
        };
        match id {
            Some(id) => !self.close_matching(|s| s.id() == id).is_empty(),
            None => false,
        }
    }

    /// Closes every finished log follower. Returns how many were closed.
    pub fn close_dead_logs(&self) -> usize {
        self.close_matching(|s| !s.is_alive() && s.label().starts_with(LOG_VIEW_PREFIX))
            .len()
    }

    /// Closes everything and tears down the multiplexer instance.
    pub fn close_all(&self) {
        let sessions = {
            let _view = self.view_guard();
            let sessions = {
                let mut state = self.lock();
                state.active = 0;
                std::mem::take(&mut state.sessions)
            };
            if let Some(layout) = &self.layout {
                layout.return_session();
            }
            sessions
        };
        for session in &sessions {
            session.close();
        }
        info!(closed = sessions.len(), "registry_closed_all");
        self.server.kill();
    }

    /// Restarts the active tab in place when its command has exited.
    pub fn restart_active(&self) -> Result<bool, MuxError> {
        let Some(session) = self.active_session() else {
            return Ok(false);
        };
        if session.is_alive() {
            return Ok(false);
        }
        session.respawn()?;
        Ok(true)
    }

    /// Puts the active tab back in the viewport, or clears the viewport when
    /// there are no tabs. Used after a preview goes away.
    pub fn show_active(&self) {
        let Some(layout) = &self.layout else {
            return;
        };
        let _view = self.view_guard();
        match self.active_session() {
            Some(session) => layout.show_session(session.window()),
            None => layout.return_session(),
        }
    }

    pub fn tab_labels(&self) -> Vec<TabInfo> {
        let state = self.lock();
        state
            .sessions
            .iter()
            .enumerate()
            .map(|(position, s)| TabInfo {
                position,
                label: s.label().to_string(),
                active: position == state.active,
                alive: s.is_alive(),
            })
            .collect()
    }

    pub fn active_session(&self) -> Option<Arc<Session>> {
        self.lock().active_session()
    }

    pub fn active_index(&self) -> usize {
        self.lock().active
    }

    pub fn active_window(&self) -> Option<String> {
        self.active_session().map(|s| s.window().to_string())
    }

    pub fn active_label(&self) -> Option<String> {
        self.active_session().map(|s| s.label().to_string())
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    fn spawn(&self, label: String, spec: SpawnSpec) -> Result<Arc<Session>, MuxError> {
        let id = {
            let mut state = self.lock();
            let id = state.next_id;
            state.next_id += 1;
            id
        };
        let size = self.viewport_size();
        let session = Session::create(id, label, spec, size, self.server.clone())?;
        let _view = self.view_guard();
        {
            let mut state = self.lock();
            state.sessions.push(session.clone());
            state.active = state.sessions.len() - 1;
        }
        self.show(session.window());
        Ok(session)
    }

    fn close_matching<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&Session) -> bool,
    {
        let _view = self.view_guard();
        let (removed, next) = {
            let mut state = self.lock();
            let active_id = state.active_session().map(|s| s.id());
            let (removed, kept): (Vec<_>, Vec<_>) = state
                .sessions
                .drain(..)
                .partition(|s| predicate(s.as_ref()));
            state.sessions = kept;
            if let Some(id) = active_id {
                if let Some(index) = state.sessions.iter().position(|s| s.id() == id) {
                    state.active = index;
                }
            }
            state.clamp_active();
            (removed, state.active_session())
        };
        if removed.is_empty() {
            return Vec::new();
        }

        if let Some(layout) = &self.layout {
            let shown = layout.active_window();
            let visible = removed
                .iter()
                .any(|s| shown.as_deref() == Some(s.window()));
            if visible {
                layout.return_session();
                if let Some(session) = &next {
                    layout.show_session(session.window());
                }
            }
        }

        let labels: Vec<String> = removed.iter().map(|s| s.label().to_string()).collect();
        for session in removed {
            session.close();
        }
        debug!(closed = ?labels, "registry_closed");
        labels
    }

    fn show(&self, window: &str) {
        if let Some(layout) = &self.layout {
            layout.show_session(window);
        }
    }

    fn is_shown(&self, window: &str) -> bool {
        match &self.layout {
            Some(layout) => layout.active_window().as_deref() == Some(window),
            None => true,
        }
    }

    fn viewport_size(&self) -> (u16, u16) {
        match &self.layout {
            Some(layout) => layout.right_pane_dimensions(),
            None => (DEFAULT_WIDTH, DEFAULT_HEIGHT),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn view_guard(&self) -> MutexGuard<'_, ()> {
        self.view.lock().unwrap_or_else(|p| p.into_inner())
    }
}

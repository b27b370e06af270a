use crate::backend::{Environment, Service, Usage, Verb};
use crate::config::{render_command, render_label, Config, Vars};
use crate::msg::{
    Action, Cmd, FollowUp, Msg, TickKind, SERVICES_INTERVAL, SPINNER_INTERVAL, STATS_INTERVAL,
    STATUS_INTERVAL, UI_INTERVAL,
};
use crate::sentinel::{SentinelKind, Sentinels, SENTINEL_ENV};
use chrono::{DateTime, Local};
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use envdeck_mux::{Session, SessionRegistry, SpawnSpec, TabInfo, EXIT_UNKNOWN, LOG_VIEW_PREFIX};
use ratatui::widgets::ListState;
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};
use tracing::{debug, info, warn};

pub const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const SERVICE_ACTIONS: [&str; 4] = ["start", "stop", "restart", "logs"];
const PREVIEW_PREFIX: &str = "Preview — ";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Panel {
    Tabs,
    Environments,
    Services,
    Details,
}

impl Panel {
    pub fn title(self) -> &'static str {
        match self {
            Panel::Tabs => "Tabs",
            Panel::Environments => "Environments",
            Panel::Services => "Services",
            Panel::Details => "Details",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfirmAction {
    Quit,
    Restart(String),
    Delete(String),
}

#[derive(Clone, Debug)]
pub struct Confirm {
    pub prompt: String,
    pub action: ConfirmAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputPurpose {
    NewEnvironment,
}

#[derive(Clone, Debug)]
pub struct TextInput {
    pub title: String,
    pub buffer: String,
    pub purpose: InputPurpose,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PickerPurpose {
    ServiceAction { env: String, service: String },
}

#[derive(Clone, Debug)]
pub struct Picker {
    pub title: String,
    pub options: Vec<String>,
    pub state: ListState,
    pub purpose: PickerPurpose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warn,
    Error,
}

#[derive(Clone, Debug)]
pub struct Status {
    pub text: String,
    pub level: Level,
    pub activity: bool,
}

/// A named entity with a slow operation in flight.
#[derive(Clone, Debug)]
pub struct Pending {
    pub label: &'static str,
    pub since: Instant,
}

#[derive(Clone, Debug)]
struct Expected {
    tab: String,
    name: String,
}

struct Preview {
    session: Arc<Session>,
    target: String,
}

pub struct App {
    pub config: Config,
    registry: Arc<SessionRegistry>,
    sentinels: Sentinels,
    pub panel: Panel,
    prev_panel: Panel,
    pub help: bool,
    pub confirm: Option<Confirm>,
    pub input: Option<TextInput>,
    pub picker: Option<Picker>,
    pub envs: Vec<Environment>,
    pub usage: HashMap<String, Usage>,
    pub services: Vec<Service>,
    services_for: Option<String>,
    pub env_state: ListState,
    pub service_state: ListState,
    pub tab_state: ListState,
    pub details_scroll: u16,
    pub pending: HashMap<String, Pending>,
    expected: HashMap<SentinelKind, Expected>,
    pub status: Option<Status>,
    pub spinner: usize,
    preview: Option<Preview>,
    armed: HashSet<TickKind>,
    ready_sent: bool,
    pub loaded: bool,
    pub refreshed_at: Option<DateTime<Local>>,
    quit: bool,
}

impl App {
    pub fn new(config: Config, registry: Arc<SessionRegistry>, sentinels: Sentinels) -> Self {
        Self {
            config,
            registry,
            sentinels,
            panel: Panel::Environments,
            prev_panel: Panel::Environments,
            help: false,
            confirm: None,
            input: None,
            picker: None,
            envs: Vec::new(),
            usage: HashMap::new(),
            services: Vec::new(),
            services_for: None,
            env_state: ListState::default(),
            service_state: ListState::default(),
            tab_state: ListState::default(),
            details_scroll: 0,
            pending: HashMap::new(),
            expected: HashMap::new(),
            status: None,
            spinner: 0,
            preview: None,
            armed: HashSet::new(),
            ready_sent: false,
            loaded: false,
            refreshed_at: None,
            quit: false,
        }
    }

    /// Commands that start the loop: first discovery plus the recurring polls.
    pub fn init(&mut self, warning: Option<String>) -> Vec<Cmd> {
        if let Some(warning) = warning {
            self.set_status(Level::Warn, warning);
        }
        let mut cmds = vec![Cmd::Discover];
        self.arm(TickKind::Status, STATUS_INTERVAL, &mut cmds);
        if self.config.features.stats {
            cmds.push(Cmd::Stats);
            self.arm(TickKind::Stats, STATS_INTERVAL, &mut cmds);
        }
        if self.config.features.services {
            self.arm(TickKind::Services, SERVICES_INTERVAL, &mut cmds);
        }
        cmds
    }

    pub fn should_quit(&self) -> bool {
        self.quit
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn tabs(&self) -> Vec<TabInfo> {
        self.registry.tab_labels()
    }

    pub fn selected_env(&self) -> Option<&Environment> {
        self.env_state.selected().and_then(|i| self.envs.get(i))
    }

    pub fn selected_service(&self) -> Option<&Service> {
        self.service_state.selected().and_then(|i| self.services.get(i))
    }

    pub fn preview_target(&self) -> Option<&str> {
        self.preview.as_ref().map(|p| p.target.as_str())
    }

    pub fn spinner_frame(&self) -> &'static str {
        SPINNER_FRAMES[self.spinner % SPINNER_FRAMES.len()]
    }

    pub fn panels(&self) -> Vec<Panel> {
        let mut panels = vec![Panel::Tabs, Panel::Environments];
        if self.config.features.services {
            panels.push(Panel::Services);
        }
        panels.push(Panel::Details);
        panels
    }

    pub fn update(&mut self, msg: Msg) -> Vec<Cmd> {
        let mut cmds = Vec::new();
        match msg {
            Msg::Key(key) => cmds = self.handle_key(key),
            Msg::Resize(..) => {}
            Msg::Tick(kind) => self.on_tick(kind, &mut cmds),
            Msg::Discovered(result) => self.on_discovered(result, &mut cmds),
            Msg::Stats(result) => match result {
                Ok(usage) => self.usage = usage,
                Err(err) => debug!(error = %err, "stats_failed"),
            },
            Msg::Services { env, result } => self.on_services(env, result),
            Msg::ActionDone {
                env,
                action,
                follow_up,
                result,
            } => self.on_action_done(env, action, follow_up, result, &mut cmds),
            Msg::HealthWaitDone {
                env,
                healthy,
                follow_up,
            } => self.on_health_wait_done(env, healthy, follow_up, &mut cmds),
        }
        self.sync_tabs();
        if self.needs_ui_tick() {
            self.arm(TickKind::Ui, UI_INTERVAL, &mut cmds);
        }
        if self.status.as_ref().is_some_and(|s| s.activity) {
            self.arm(TickKind::Spinner, SPINNER_INTERVAL, &mut cmds);
        }
        cmds
    }

    /// Tears down the preview and every tab. Called once the loop exits.
    pub fn shutdown(&mut self) {
        self.discard_preview();
        self.registry.close_all();
    }

    fn arm(&mut self, kind: TickKind, delay: std::time::Duration, cmds: &mut Vec<Cmd>) {
        if self.armed.insert(kind) {
            cmds.push(Cmd::Tick(kind, delay));
        }
    }

    fn needs_ui_tick(&self) -> bool {
        !self.registry.is_empty() || self.preview.is_some() || !self.expected.is_empty()
    }

    fn on_tick(&mut self, kind: TickKind, cmds: &mut Vec<Cmd>) {
        self.armed.remove(&kind);
        match kind {
            TickKind::Status => {
                cmds.push(Cmd::Discover);
                self.arm(TickKind::Status, STATUS_INTERVAL, cmds);
            }
            TickKind::Stats => {
                if self.config.features.stats {
                    cmds.push(Cmd::Stats);
                    self.arm(TickKind::Stats, STATS_INTERVAL, cmds);
                }
            }
            TickKind::Services => {
                if self.config.features.services {
                    if let Some(env) = self.selected_env().filter(|e| e.running) {
                        let name = env.name.clone();
                        self.services_for = Some(name.clone());
                        cmds.push(Cmd::Services(name));
                    }
                    self.arm(TickKind::Services, SERVICES_INTERVAL, cmds);
                }
            }
            TickKind::Ui => self.poll_sentinels(cmds),
            TickKind::Spinner => self.spinner = self.spinner.wrapping_add(1),
        }
    }

    fn on_discovered(&mut self, result: Result<Vec<Environment>, String>, cmds: &mut Vec<Cmd>) {
        if !self.ready_sent {
            self.ready_sent = true;
            cmds.push(Cmd::SignalReady);
        }
        let mut envs = match result {
            Ok(envs) => envs,
            Err(err) => {
                warn!(error = %err, "discovery_failed");
                self.set_status(Level::Error, format!("discovery failed: {err}"));
                return;
            }
        };
        for env in envs.iter_mut() {
            if !self.pending.contains_key(&env.name) {
                continue;
            }
            if let Some(old) = self.envs.iter().find(|old| old.name == env.name) {
                env.running = old.running;
                env.health = old.health.clone();
            }
        }

        let selected = self.selected_env().map(|e| e.name.clone());
        self.envs = envs;
        self.loaded = true;
        self.refreshed_at = Some(Local::now());
        let index = selected
            .as_ref()
            .and_then(|name| self.envs.iter().position(|e| &e.name == name));
        match index {
            Some(index) => self.env_state.select(Some(index)),
            None => {
                self.env_state.select(None);
                ensure_selection(&mut self.env_state, self.envs.len());
            }
        }
        let now = self.selected_env().map(|e| e.name.clone());
        if now != selected {
            self.selection_changed(cmds);
        }
    }

    fn on_services(&mut self, env: String, result: Result<Vec<Service>, String>) {
        if self.services_for.as_deref() != Some(env.as_str()) {
            return;
        }
        match result {
            Ok(services) => {
                self.services = services;
                if self.service_state.selected().map_or(true, |i| i >= self.services.len()) {
                    self.service_state.select(None);
                }
                ensure_selection(&mut self.service_state, self.services.len());
            }
            Err(err) => self.set_status(Level::Warn, format!("services for {env}: {err}")),
        }
    }

    fn on_action_done(
        &mut self,
        env: String,
        action: Action,
        follow_up: FollowUp,
        result: Result<String, String>,
        cmds: &mut Vec<Cmd>,
    ) {
        let key = pending_key(&env, &action);
        self.pending.remove(&key);
        let what = action.describe(&env);
        match result {
            Ok(_) => {
                info!(action = %what, "action_succeeded");
                match action {
                    Action::Env(Verb::Start) | Action::Env(Verb::Restart) => {
                        self.pending.insert(env.clone(), pending("waiting"));
                        self.set_activity(format!("waiting for {env} to become healthy"));
                        cmds.push(Cmd::WaitHealthy { env, follow_up });
                    }
                    _ => self.set_status(Level::Success, format!("{what}: done")),
                }
            }
            Err(err) => {
                warn!(action = %what, error = %err, "action_failed");
                self.set_status(Level::Error, format!("{what} failed: {err}"));
            }
        }
        cmds.push(Cmd::Discover);
    }

    fn on_health_wait_done(
        &mut self,
        env: String,
        healthy: bool,
        follow_up: FollowUp,
        cmds: &mut Vec<Cmd>,
    ) {
        self.pending.remove(&env);
        if healthy {
            self.set_status(Level::Success, format!("{env} is healthy"));
        } else {
            self.set_status(
                Level::Warn,
                format!(
                    "{env} not healthy after {}s; continuing",
                    self.config.health_timeout_secs
                ),
            );
        }
        if follow_up == FollowUp::OpenShell {
            self.open_shell(&env);
        }
        cmds.push(Cmd::Discover);
    }

    fn selection_changed(&mut self, cmds: &mut Vec<Cmd>) {
        self.services.clear();
        self.service_state.select(None);
        self.services_for = None;
        self.details_scroll = 0;
        let Some(env) = self.selected_env().cloned() else {
            return;
        };
        if self.config.features.services && env.running {
            self.services_for = Some(env.name.clone());
            cmds.push(Cmd::Services(env.name.clone()));
        }
        if self.preview.as_ref().is_some_and(|p| p.target != env.name) {
            self.discard_preview();
            self.open_preview(&env);
            if self.preview.is_none() {
                self.registry.show_active();
            }
        }
    }

    fn sync_tabs(&mut self) {
        let len = self.registry.len();
        if len == 0 {
            self.tab_state.select(None);
        } else if self.tab_state.selected().map_or(true, |i| i >= len) {
            self.tab_state.select(Some(self.registry.active_index()));
        }
    }

    // Keys

    fn handle_key(&mut self, key: KeyEvent) -> Vec<Cmd> {
        if self.help {
            self.handle_key_help(key);
            return Vec::new();
        }
        if self.confirm.is_some() {
            return self.handle_key_confirm(key);
        }
        if self.input.is_some() {
            return self.handle_key_input(key);
        }
        if self.picker.is_some() {
            return self.handle_key_picker(key);
        }
        self.handle_key_normal(key)
    }

    fn handle_key_help(&mut self, key: KeyEvent) {
        if matches!(key.code, KeyCode::Esc | KeyCode::Char('?') | KeyCode::Char('q')) {
            self.help = false;
        }
    }

    fn handle_key_confirm(&mut self, key: KeyEvent) -> Vec<Cmd> {
        match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') | KeyCode::Enter => {
                let Some(confirm) = self.confirm.take() else {
                    return Vec::new();
                };
                match confirm.action {
                    ConfirmAction::Quit => {
                        self.quit = true;
                        Vec::new()
                    }
                    ConfirmAction::Restart(env) => {
                        self.start_action(&env, Action::Env(Verb::Restart), FollowUp::Nothing)
                    }
                    ConfirmAction::Delete(env) => self.delete_environment(&env),
                }
            }
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                self.confirm = None;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn handle_key_input(&mut self, key: KeyEvent) -> Vec<Cmd> {
        let Some(input) = self.input.as_mut() else {
            return Vec::new();
        };
        match key.code {
            KeyCode::Esc => {
                self.input = None;
            }
            KeyCode::Enter => {
                let value = input.buffer.trim().to_string();
                let purpose = input.purpose;
                self.input = None;
                if value.is_empty() {
                    return Vec::new();
                }
                return match purpose {
                    InputPurpose::NewEnvironment => self.create_environment(&value),
                };
            }
            KeyCode::Backspace => {
                input.buffer.pop();
            }
            KeyCode::Char(ch) => input.buffer.push(ch),
            _ => {}
        }
        Vec::new()
    }

    fn handle_key_picker(&mut self, key: KeyEvent) -> Vec<Cmd> {
        let Some(picker) = self.picker.as_mut() else {
            return Vec::new();
        };
        match key.code {
            KeyCode::Esc => self.picker = None,
            KeyCode::Char('j') | KeyCode::Down => {
                list_next_state(&mut picker.state, picker.options.len())
            }
            KeyCode::Char('k') | KeyCode::Up => {
                list_prev_state(&mut picker.state, picker.options.len())
            }
            KeyCode::Enter => {
                let choice = picker
                    .state
                    .selected()
                    .and_then(|i| picker.options.get(i))
                    .cloned();
                let purpose = picker.purpose.clone();
                self.picker = None;
                let Some(choice) = choice else {
                    return Vec::new();
                };
                let PickerPurpose::ServiceAction { env, service } = purpose;
                return match choice.as_str() {
                    "logs" => {
                        self.open_service_logs(&env, &service);
                        Vec::new()
                    }
                    other => match parse_verb(other) {
                        Some(verb) => self.start_action(
                            &env,
                            Action::Service { service, verb },
                            FollowUp::Nothing,
                        ),
                        None => Vec::new(),
                    },
                };
            }
            _ => {}
        }
        Vec::new()
    }

    fn handle_key_normal(&mut self, key: KeyEvent) -> Vec<Cmd> {
        let mut cmds = Vec::new();
        if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
            self.request_quit();
            return cmds;
        }
        match key.code {
            KeyCode::Char('q') => self.request_quit(),
            KeyCode::Char('?') => self.help = true,
            KeyCode::Tab => self.cycle_panel(true),
            KeyCode::BackTab => self.cycle_panel(false),
            KeyCode::Esc => {
                self.panel = if self.panel == Panel::Tabs {
                    self.prev_panel
                } else {
                    Panel::Environments
                };
            }
            KeyCode::Char('j') | KeyCode::Down => self.move_cursor(true, &mut cmds),
            KeyCode::Char('k') | KeyCode::Up => self.move_cursor(false, &mut cmds),
            KeyCode::Enter => return self.activate(),
            KeyCode::Char('l') => match self.panel {
                Panel::Services => {
                    if let (Some(env), Some(service)) = (
                        self.selected_env().map(|e| e.name.clone()),
                        self.selected_service().map(|s| s.name.clone()),
                    ) {
                        self.open_service_logs(&env, &service);
                    }
                }
                _ => {
                    if let Some(env) = self.selected_env().map(|e| e.name.clone()) {
                        self.open_logs(&env);
                    }
                }
            },
            KeyCode::Char('t') => {
                if let Some(env) = self.selected_env().map(|e| e.name.clone()) {
                    self.open_extra_shell(&env);
                }
            }
            KeyCode::Char('s') => {
                if let Some(env) = self.selected_env().map(|e| e.name.clone()) {
                    return self.start_action(&env, Action::Env(Verb::Start), FollowUp::Nothing);
                }
            }
            KeyCode::Char('S') => {
                if let Some(env) = self.selected_env().map(|e| e.name.clone()) {
                    return self.start_action(&env, Action::Env(Verb::Stop), FollowUp::Nothing);
                }
            }
            KeyCode::Char('R') => {
                if let Some(env) = self.selected_env().map(|e| e.name.clone()) {
                    self.confirm = Some(Confirm {
                        prompt: format!("Restart {env}?"),
                        action: ConfirmAction::Restart(env),
                    });
                }
            }
            KeyCode::Char('n') => {
                self.input = Some(TextInput {
                    title: "New environment name".to_string(),
                    buffer: String::new(),
                    purpose: InputPurpose::NewEnvironment,
                });
            }
            KeyCode::Char('d') => {
                if let Some(env) = self.selected_env().map(|e| e.name.clone()) {
                    self.confirm = Some(Confirm {
                        prompt: format!("Delete {env}? This cannot be undone."),
                        action: ConfirmAction::Delete(env),
                    });
                }
            }
            KeyCode::Char('c') => {
                if self.config.features.credentials {
                    self.reload_credentials();
                }
            }
            KeyCode::Char('p') => {
                if self.config.features.preview {
                    self.toggle_preview();
                }
            }
            KeyCode::Char('[') => {
                self.discard_preview();
                self.registry.prev_tab();
                self.registry.show_active();
                self.tab_state.select(Some(self.registry.active_index()));
            }
            KeyCode::Char(']') => {
                self.discard_preview();
                self.registry.next_tab();
                self.registry.show_active();
                self.tab_state.select(Some(self.registry.active_index()));
            }
            KeyCode::Char('x') => {
                if self.preview.is_some() {
                    self.close_preview();
                } else if let Some(label) = self.registry.close_active() {
                    self.set_status(Level::Info, format!("closed {label}"));
                    self.tab_state.select(None);
                }
            }
            KeyCode::Char('X') => {
                let closed = self.registry.close_dead_logs();
                self.tab_state.select(None);
                self.set_status(Level::Info, format!("closed {closed} finished log tabs"));
            }
            KeyCode::Char('r') => {
                cmds.push(Cmd::Discover);
                if self.config.features.stats {
                    cmds.push(Cmd::Stats);
                }
                if let Some(env) = self.selected_env().filter(|e| e.running) {
                    if self.config.features.services {
                        cmds.push(Cmd::Services(env.name.clone()));
                    }
                }
                self.set_status(Level::Info, "refreshing");
            }
            KeyCode::Char('z') => {
                if let Some(layout) = self.registry.layout() {
                    if layout.is_zoomed() {
                        layout.unzoom_right();
                    } else {
                        layout.zoom_right();
                    }
                }
            }
            KeyCode::Char('f') => {
                if let Some(layout) = self.registry.layout() {
                    layout.focus_right();
                }
            }
            KeyCode::F(5) => match self.registry.restart_active() {
                Ok(true) => self.set_status(Level::Info, "restarted tab"),
                Ok(false) => self.set_status(Level::Info, "active tab is still running"),
                Err(err) => self.set_status(Level::Error, format!("restart failed: {err}")),
            },
            _ => {}
        }
        cmds
    }

    fn request_quit(&mut self) {
        if self.registry.is_empty() {
            self.quit = true;
            return;
        }
        self.confirm = Some(Confirm {
            prompt: format!("Quit and close {} tab(s)?", self.registry.len()),
            action: ConfirmAction::Quit,
        });
    }

    fn cycle_panel(&mut self, forward: bool) {
        let panels = self.panels();
        let index = panels.iter().position(|p| *p == self.panel).unwrap_or(0);
        let next = if forward {
            (index + 1) % panels.len()
        } else {
            (index + panels.len() - 1) % panels.len()
        };
        self.focus_panel(panels[next]);
    }

    fn focus_panel(&mut self, panel: Panel) {
        if panel == Panel::Tabs && self.panel != Panel::Tabs {
            self.prev_panel = self.panel;
        }
        self.panel = panel;
    }

    fn move_cursor(&mut self, forward: bool, cmds: &mut Vec<Cmd>) {
        match self.panel {
            Panel::Tabs => {
                let len = self.registry.len();
                if forward {
                    list_next_state(&mut self.tab_state, len);
                } else {
                    list_prev_state(&mut self.tab_state, len);
                }
            }
            Panel::Environments => {
                let before = self.env_state.selected();
                if forward {
                    list_next_state(&mut self.env_state, self.envs.len());
                } else {
                    list_prev_state(&mut self.env_state, self.envs.len());
                }
                if self.env_state.selected() != before {
                    self.selection_changed(cmds);
                }
            }
            Panel::Services => {
                if forward {
                    list_next_state(&mut self.service_state, self.services.len());
                } else {
                    list_prev_state(&mut self.service_state, self.services.len());
                }
            }
            Panel::Details => {
                self.details_scroll = if forward {
                    self.details_scroll.saturating_add(1)
                } else {
                    self.details_scroll.saturating_sub(1)
                };
            }
        }
    }

    fn activate(&mut self) -> Vec<Cmd> {
        match self.panel {
            Panel::Tabs => {
                if let Some(index) = self.tab_state.selected() {
                    self.discard_preview();
                    self.registry.focus_by_index(index);
                    self.registry.show_active();
                }
                Vec::new()
            }
            Panel::Environments => {
                let Some(env) = self.selected_env().cloned() else {
                    return Vec::new();
                };
                if env.running {
                    self.open_shell(&env.name);
                    Vec::new()
                } else {
                    self.start_action(&env.name, Action::Env(Verb::Start), FollowUp::OpenShell)
                }
            }
            Panel::Services => {
                let (Some(env), Some(service)) = (
                    self.selected_env().map(|e| e.name.clone()),
                    self.selected_service().cloned(),
                ) else {
                    return Vec::new();
                };
                let mut state = ListState::default();
                state.select(Some(0));
                self.picker = Some(Picker {
                    title: format!("{} · {}", env, service.title()),
                    options: SERVICE_ACTIONS.iter().map(|s| s.to_string()).collect(),
                    state,
                    purpose: PickerPurpose::ServiceAction {
                        env,
                        service: service.name,
                    },
                });
                Vec::new()
            }
            Panel::Details => {
                self.promote_preview();
                Vec::new()
            }
        }
    }

    // Actions

    fn start_action(&mut self, env: &str, action: Action, follow_up: FollowUp) -> Vec<Cmd> {
        let key = pending_key(env, &action);
        if self.pending.contains_key(&key) || self.pending.contains_key(env) {
            self.set_status(Level::Warn, format!("{env} is busy"));
            return Vec::new();
        }
        let Some(record) = self.envs.iter().find(|e| e.name == env).cloned() else {
            return Vec::new();
        };
        let verb = match &action {
            Action::Env(verb) | Action::Service { verb, .. } => *verb,
        };
        self.pending.insert(key, pending(verb.progressive()));
        self.set_activity(format!("{}…", action.describe(env)));
        vec![Cmd::Action {
            env: record,
            action,
            follow_up,
        }]
    }

    fn open_shell(&mut self, env: &str) {
        if let Some((label, spec)) = self.shell_spec(env) {
            self.open_tab(&label, spec);
        }
    }

    /// Opens another shell for `env` even when one is already open.
    fn open_extra_shell(&mut self, env: &str) {
        let Some((label, spec)) = self.shell_spec(env) else {
            return;
        };
        self.discard_preview();
        match self.registry.open_new(&label, spec) {
            Ok(session) => {
                self.tab_state.select(Some(self.registry.active_index()));
                self.set_status(Level::Info, format!("opened {}", session.label()));
            }
            Err(err) => self.set_status(Level::Error, format!("could not open {label}: {err}")),
        }
    }

    fn shell_spec(&self, env: &str) -> Option<(String, SpawnSpec)> {
        let record = self.envs.iter().find(|e| e.name == env)?;
        let label = render_label(&self.config.labels.shell, &record.vars());
        let spec = SpawnSpec::new(self.config.shell.clone()).dir(record.path.as_ref().map(PathBuf::from));
        Some((label, spec))
    }

    fn open_logs(&mut self, env: &str) {
        let Some(record) = self.envs.iter().find(|e| e.name == env).cloned() else {
            return;
        };
        let template = self.config.commands.logs.clone();
        if template.trim().is_empty() {
            self.set_status(Level::Warn, "no logs command configured");
            return;
        }
        let label = format!("{LOG_VIEW_PREFIX}{env}");
        let spec = SpawnSpec::new("sh").args(["-c".to_string(), render_command(&template, &record.vars())]);
        self.open_tab(&label, spec);
    }

    fn open_service_logs(&mut self, env: &str, service: &str) {
        let template = self.config.commands.service_logs.clone();
        if template.trim().is_empty() {
            self.set_status(Level::Warn, "no service_logs command configured");
            return;
        }
        let vars = Vars {
            name: env,
            service,
            ..Vars::default()
        };
        let label = format!("{LOG_VIEW_PREFIX}{env}/{service}");
        let spec = SpawnSpec::new("sh").args(["-c".to_string(), render_command(&template, &vars)]);
        self.open_tab(&label, spec);
    }

    fn open_tab(&mut self, label: &str, spec: SpawnSpec) -> Option<Arc<Session>> {
        self.discard_preview();
        match self.registry.open(label, spec) {
            Ok(session) => {
                self.tab_state.select(Some(self.registry.active_index()));
                Some(session)
            }
            Err(err) => {
                self.set_status(Level::Error, format!("could not open {label}: {err}"));
                None
            }
        }
    }

    fn create_environment(&mut self, name: &str) -> Vec<Cmd> {
        let template = self.config.commands.create.clone();
        let label = render_label(&self.config.labels.create, &Vars::named(name));
        self.run_detached(SentinelKind::Create, name, &template, label);
        Vec::new()
    }

    fn delete_environment(&mut self, name: &str) -> Vec<Cmd> {
        if self.pending.contains_key(name) {
            self.set_status(Level::Warn, format!("{name} is busy"));
            return Vec::new();
        }
        let template = self.config.commands.delete.clone();
        let label = render_label(&self.config.labels.delete, &Vars::named(name));
        if self.run_detached(SentinelKind::Delete, name, &template, label) {
            self.pending.insert(name.to_string(), pending("deleting"));
        }
        Vec::new()
    }

    fn reload_credentials(&mut self) {
        let template = self.config.commands.credentials.clone();
        let label = self.config.labels.credentials.clone();
        self.run_detached(SentinelKind::Credentials, "", &template, label);
    }

    /// Runs a script in its own tab; completion arrives through the sentinel
    /// file for `kind`.
    fn run_detached(&mut self, kind: SentinelKind, name: &str, template: &str, label: String) -> bool {
        if self.expected.contains_key(&kind) {
            self.set_status(Level::Warn, format!("a {kind} script is already running"));
            return false;
        }
        if template.trim().is_empty() {
            self.set_status(Level::Warn, format!("no {kind} command configured"));
            return false;
        }
        self.sentinels.clear(kind);
        let script = render_command(template, &Vars::named(name));
        let spec = SpawnSpec::new("sh")
            .args(["-c".to_string(), self.sentinels.wrap(kind, &script)])
            .env(
                SENTINEL_ENV,
                self.sentinels.path(kind).to_string_lossy().into_owned(),
            );
        let Some(session) = self.open_tab(&label, spec) else {
            return false;
        };
        self.expected.insert(
            kind,
            Expected {
                tab: session.label().to_string(),
                name: name.to_string(),
            },
        );
        self.set_activity(format!("{}…", describe_script(kind, name)));
        true
    }

    fn poll_sentinels(&mut self, cmds: &mut Vec<Cmd>) {
        let kinds: Vec<SentinelKind> = self.expected.keys().copied().collect();
        for kind in kinds {
            let Some(expected) = self.expected.get(&kind).cloned() else {
                continue;
            };
            if let Some(done) = self.sentinels.take(kind) {
                self.finish_script(kind, done.code, done.payload, cmds);
            } else if !self.registry.has_label(&expected.tab) {
                self.expected.remove(&kind);
                if kind == SentinelKind::Delete {
                    self.pending.remove(&expected.name);
                }
                self.set_status(
                    Level::Warn,
                    format!("{} abandoned", describe_script(kind, &expected.name)),
                );
            } else if !self.registry.is_label_alive(&expected.tab) {
                let code = self.registry.exit_code_for_label(&expected.tab);
                self.finish_script(kind, code, None, cmds);
            }
        }
    }

    fn finish_script(
        &mut self,
        kind: SentinelKind,
        code: i32,
        payload: Option<String>,
        cmds: &mut Vec<Cmd>,
    ) {
        let Some(expected) = self.expected.remove(&kind) else {
            return;
        };
        let what = describe_script(kind, &expected.name);
        if kind == SentinelKind::Delete {
            self.pending.remove(&expected.name);
        }
        info!(kind = %kind, name = %expected.name, code, "script_finished");
        if code == 0 {
            self.registry.close_by_label(&expected.tab);
            self.tab_state.select(None);
            let text = match payload {
                Some(payload) => format!("{what} finished: {payload}"),
                None => format!("{what} finished"),
            };
            self.set_status(Level::Success, text);
            if kind == SentinelKind::Credentials {
                self.restart_running(cmds);
            }
        } else {
            let code_text = if code == EXIT_UNKNOWN {
                "unknown exit".to_string()
            } else {
                format!("exit {code}")
            };
            let text = match payload {
                Some(payload) => format!("{what} failed ({code_text}): {payload}"),
                None => format!("{what} failed ({code_text})"),
            };
            self.set_status(Level::Error, text);
        }
        cmds.push(Cmd::Discover);
    }

    /// Restarts every running environment so it picks up new credentials.
    fn restart_running(&mut self, cmds: &mut Vec<Cmd>) {
        let running: Vec<String> = self
            .envs
            .iter()
            .filter(|e| e.running && !self.pending.contains_key(&e.name))
            .map(|e| e.name.clone())
            .collect();
        for env in &running {
            cmds.extend(self.start_action(env, Action::Env(Verb::Restart), FollowUp::Nothing));
        }
        if !running.is_empty() {
            self.set_activity(format!("restarting {} environment(s)", running.len()));
        }
    }

    // Preview

    fn toggle_preview(&mut self) {
        if self.preview.is_some() {
            self.close_preview();
            return;
        }
        if let Some(env) = self.selected_env().cloned() {
            self.open_preview(&env);
        }
    }

    fn open_preview(&mut self, env: &Environment) {
        let template = self.config.commands.logs.clone();
        if template.trim().is_empty() {
            self.set_status(Level::Warn, "no logs command configured");
            return;
        }
        let spec = SpawnSpec::new("sh").args(["-c".to_string(), render_command(&template, &env.vars())]);
        match self
            .registry
            .open_preview(&format!("{PREVIEW_PREFIX}{}", env.name), spec)
        {
            Ok(session) => {
                self.preview = Some(Preview {
                    session,
                    target: env.name.clone(),
                });
            }
            Err(err) => self.set_status(Level::Error, format!("preview failed: {err}")),
        }
    }

    /// Parks and kills the preview without choosing what to show next.
    fn discard_preview(&mut self) {
        let Some(preview) = self.preview.take() else {
            return;
        };
        if let Some(layout) = self.registry.layout() {
            if layout.active_window().as_deref() == Some(preview.session.window()) {
                layout.return_session();
            }
        }
        preview.session.close();
    }

    fn close_preview(&mut self) {
        self.discard_preview();
        self.registry.show_active();
    }

    fn promote_preview(&mut self) {
        let Some(target) = self.preview_target().map(str::to_string) else {
            return;
        };
        self.discard_preview();
        self.open_logs(&target);
    }

    // Status

    fn set_status(&mut self, level: Level, text: impl Into<String>) {
        self.status = Some(Status {
            text: text.into(),
            level,
            activity: false,
        });
    }

    fn set_activity(&mut self, text: impl Into<String>) {
        self.status = Some(Status {
            text: text.into(),
            level: Level::Info,
            activity: true,
        });
    }
}

fn pending(label: &'static str) -> Pending {
    Pending {
        label,
        since: Instant::now(),
    }
}

fn pending_key(env: &str, action: &Action) -> String {
    match action {
        Action::Env(_) => env.to_string(),
        Action::Service { service, .. } => format!("{env}/{service}"),
    }
}

fn parse_verb(value: &str) -> Option<Verb> {
    match value {
        "start" => Some(Verb::Start),
        "stop" => Some(Verb::Stop),
        "restart" => Some(Verb::Restart),
        _ => None,
    }
}

fn describe_script(kind: SentinelKind, name: &str) -> String {
    match kind {
        SentinelKind::Credentials => "credentials reload".to_string(),
        _ => format!("{kind} {name}"),
    }
}

pub fn ensure_selection(state: &mut ListState, len: usize) {
    if len == 0 {
        state.select(None);
        return;
    }
    if state.selected().is_none() {
        state.select(Some(0));
    }
}

pub fn list_next_state(state: &mut ListState, len: usize) {
    if len == 0 {
        state.select(None);
        return;
    }
    let next = match state.selected() {
        Some(idx) => (idx + 1) % len,
        None => 0,
    };
    state.select(Some(next));
}

pub fn list_prev_state(state: &mut ListState, len: usize) {
    if len == 0 {
        state.select(None);
        return;
    }
    let next = match state.selected() {
        Some(0) | None => len - 1,
        Some(idx) => idx - 1,
    };
    state.select(Some(next));
}

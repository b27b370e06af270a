use crate::backend::{Environment, Service, Usage, Verb};
use crossterm::event::KeyEvent;
use std::{collections::HashMap, time::Duration};

pub const STATUS_INTERVAL: Duration = Duration::from_secs(5);
pub const STATS_INTERVAL: Duration = Duration::from_secs(3);
pub const SERVICES_INTERVAL: Duration = Duration::from_secs(5);
pub const UI_INTERVAL: Duration = Duration::from_millis(100);
pub const SPINNER_INTERVAL: Duration = Duration::from_millis(80);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TickKind {
    Status,
    Stats,
    Services,
    Ui,
    Spinner,
}

/// What a slow operation does once its health wait is over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FollowUp {
    Nothing,
    OpenShell,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Env(Verb),
    Service { service: String, verb: Verb },
}

impl Action {
    pub fn describe(&self, env: &str) -> String {
        match self {
            Action::Env(verb) => format!("{} {env}", verb.as_str()),
            Action::Service { service, verb } => format!("{} {env}/{service}", verb.as_str()),
        }
    }
}

/// Everything that can enter the loop.
#[derive(Debug)]
pub enum Msg {
    Key(KeyEvent),
    Resize(u16, u16),
    Tick(TickKind),
    Discovered(Result<Vec<Environment>, String>),
    Stats(Result<HashMap<String, Usage>, String>),
    Services {
        env: String,
        result: Result<Vec<Service>, String>,
    },
    ActionDone {
        env: String,
        action: Action,
        follow_up: FollowUp,
        result: Result<String, String>,
    },
    HealthWaitDone {
        env: String,
        healthy: bool,
        follow_up: FollowUp,
    },
}

/// Side effects requested by the state machine. Each delivers exactly one
/// [`Msg`] back, except `SignalReady`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cmd {
    Tick(TickKind, Duration),
    Discover,
    Stats,
    Services(String),
    Action {
        env: Environment,
        action: Action,
        follow_up: FollowUp,
    },
    WaitHealthy {
        env: String,
        follow_up: FollowUp,
    },
    SignalReady,
}

//! Collaborator commands: discovery, stats, services and lifecycle actions.
//!
//! Every collaborator is a shell command that prints JSON on stdout. Nothing
//! here knows what an environment actually is beyond the records it parses.

use crate::config::{render_command, Config, Vars};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Environment {
    pub name: String,
    pub alias: String,
    pub branch: String,
    pub running: bool,
    pub health: String,
    pub cpu: String,
    pub memory: String,
    pub kind: String,
    pub path: Option<String>,
}

impl Environment {
    /// Healthy means running with a health string that is empty or reports
    /// a good state.
    pub fn is_healthy(&self) -> bool {
        if !self.running {
            return false;
        }
        matches!(
            self.health.trim().to_ascii_lowercase().as_str(),
            "" | "healthy" | "ok" | "up" | "running"
        )
    }

    pub fn vars(&self) -> Vars<'_> {
        Vars {
            name: &self.name,
            alias: &self.alias,
            branch: &self.branch,
            ..Vars::default()
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Service {
    pub name: String,
    pub display_name: String,
    pub status: String,
}

impl Service {
    pub fn title(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.name
        } else {
            &self.display_name
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Usage {
    pub cpu: String,
    pub memory: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Start,
    Stop,
    Restart,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Restart => "restart",
        }
    }

    pub fn progressive(self) -> &'static str {
        match self {
            Verb::Start => "starting",
            Verb::Stop => "stopping",
            Verb::Restart => "restarting",
        }
    }
}

pub async fn discover(config: &Config) -> Result<Vec<Environment>, String> {
    let template = &config.commands.discover;
    if template.trim().is_empty() {
        return Ok(Vec::new());
    }
    let output = run_shell(template).await?;
    parse_json::<Vec<Environment>>(&output)
}

pub async fn stats(config: &Config) -> Result<HashMap<String, Usage>, String> {
    let template = &config.commands.stats;
    if template.trim().is_empty() {
        return Ok(HashMap::new());
    }
    let output = run_shell(template).await?;
    parse_json::<HashMap<String, Usage>>(&output)
}

pub async fn services(config: &Config, env: &str) -> Result<Vec<Service>, String> {
    let template = &config.commands.services;
    if template.trim().is_empty() {
        return Ok(Vec::new());
    }
    let output = run_shell(&render_command(template, &Vars::named(env))).await?;
    parse_json::<Vec<Service>>(&output)
}

pub async fn env_action(config: &Config, env: &Environment, verb: Verb) -> Result<String, String> {
    let template = match verb {
        Verb::Start => &config.commands.start,
        Verb::Stop => &config.commands.stop,
        Verb::Restart => &config.commands.restart,
    };
    if template.trim().is_empty() {
        return Err(format!("no {} command configured", verb.as_str()));
    }
    run_shell(&render_command(template, &env.vars())).await
}

pub async fn service_action(
    config: &Config,
    env: &str,
    service: &str,
    verb: Verb,
) -> Result<String, String> {
    let template = &config.commands.service_action;
    if template.trim().is_empty() {
        return Err("no service_action command configured".to_string());
    }
    let vars = Vars {
        name: env,
        service,
        action: verb.as_str(),
        ..Vars::default()
    };
    run_shell(&render_command(template, &vars)).await
}

/// Polls discovery until `env` reports healthy or `timeout` elapses.
pub async fn wait_healthy(config: &Config, env: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(envs) = discover(config).await {
            if envs.iter().any(|e| e.name == env && e.is_healthy()) {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(env, timeout_secs = timeout.as_secs(), "health_wait_timed_out");
            return false;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Runs `script` through `sh -c`. Failure carries the last non-empty output
/// line, or the raw error.
pub async fn run_shell(script: &str) -> Result<String, String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(script)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| format!("sh: {err}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let code = output.status.code().unwrap_or(-1);
    debug!(script, code, "collaborator_failed");
    Err(last_line(&stderr)
        .or_else(|| last_line(&stdout))
        .map(str::to_string)
        .unwrap_or_else(|| format!("exited with {code}")))
}

pub fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).rev().find(|line| !line.is_empty())
}

fn parse_json<T: serde::de::DeserializeOwned>(output: &str) -> Result<T, String> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return serde_json::from_str("[]")
            .or_else(|_| serde_json::from_str("{}"))
            .map_err(|err| err.to_string());
    }
    serde_json::from_str(trimmed).map_err(|err| format!("bad collaborator output: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(discover: &str) -> Config {
        let mut config = Config::default();
        config.commands.discover = discover.to_string();
        config
    }

    #[test]
    fn environment_records_tolerate_missing_fields() {
        let envs: Vec<Environment> =
            parse_json(r#"[{"name":"api","running":true,"health":"Healthy"},{"name":"db"}]"#)
                .expect("parse");
        assert_eq!(envs.len(), 2);
        assert!(envs[0].is_healthy());
        assert!(!envs[1].running);
        assert!(!envs[1].is_healthy());
    }

    #[test]
    fn unhealthy_strings_are_not_healthy() {
        let env = Environment {
            name: "api".into(),
            running: true,
            health: "starting".into(),
            ..Environment::default()
        };
        assert!(!env.is_healthy());
    }

    #[test]
    fn empty_output_parses_as_empty_collection() {
        let envs: Vec<Environment> = parse_json("  \n").expect("parse");
        assert!(envs.is_empty());
        let usage: HashMap<String, Usage> = parse_json("").expect("parse");
        assert!(usage.is_empty());
    }

    #[test]
    fn last_line_skips_blank_lines() {
        assert_eq!(last_line("one\ntwo\n\n  \n"), Some("two"));
        assert_eq!(last_line(""), None);
    }

    #[test]
    fn service_title_prefers_display_name() {
        let service = Service {
            name: "api-1".into(),
            display_name: "API".into(),
            status: "running".into(),
        };
        assert_eq!(service.title(), "API");
    }

    #[tokio::test]
    async fn discover_parses_command_output() {
        let config = config_with(r#"printf '[{"name":"api","running":true}]'"#);
        let envs = discover(&config).await.expect("discover");
        assert_eq!(envs[0].name, "api");
    }

    #[tokio::test]
    async fn unconfigured_discovery_is_empty() {
        let envs = discover(&Config::default()).await.expect("discover");
        assert!(envs.is_empty());
    }

    #[tokio::test]
    async fn failing_command_reports_last_line() {
        let err = run_shell("echo first >&2; echo 'port in use' >&2; exit 3")
            .await
            .expect_err("fails");
        assert_eq!(err, "port in use");
        let err = run_shell("exit 4").await.expect_err("fails");
        assert_eq!(err, "exited with 4");
    }

    #[tokio::test]
    async fn missing_action_template_is_an_error() {
        let env = Environment {
            name: "api".into(),
            ..Environment::default()
        };
        let err = env_action(&Config::default(), &env, Verb::Start)
            .await
            .expect_err("fails");
        assert!(err.contains("start"));
    }

    #[tokio::test]
    async fn wait_healthy_gives_up_after_timeout() {
        let config = config_with(r#"printf '[{"name":"api","running":false}]'"#);
        assert!(!wait_healthy(&config, "api", Duration::from_millis(10)).await);
        let config = config_with(r#"printf '[{"name":"api","running":true,"health":"ok"}]'"#);
        assert!(wait_healthy(&config, "api", Duration::from_secs(5)).await);
    }
}

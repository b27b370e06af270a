use serde::{Deserialize, Serialize};
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 60;

/// Collaborator commands. Each is a shell template; an empty template means
/// the collaborator is not available.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Commands {
    pub discover: String,
    pub stats: String,
    pub services: String,
    pub start: String,
    pub stop: String,
    pub restart: String,
    pub service_action: String,
    pub logs: String,
    pub service_logs: String,
    pub create: String,
    pub delete: String,
    pub credentials: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Features {
    pub services: bool,
    pub stats: bool,
    pub credentials: bool,
    pub preview: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            services: true,
            stats: true,
            credentials: true,
            preview: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Labels {
    pub shell: String,
    pub create: String,
    pub delete: String,
    pub credentials: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            shell: "Shell — {name}".to_string(),
            create: "Create — {name}".to_string(),
            delete: "Delete — {name}".to_string(),
            credentials: "Credentials".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub shell: String,
    pub left_pct: u16,
    pub health_timeout_secs: u64,
    pub commands: Commands,
    pub features: Features,
    pub labels: Labels,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            left_pct: envdeck_mux::DEFAULT_LEFT_PCT,
            health_timeout_secs: DEFAULT_HEALTH_TIMEOUT_SECS,
            commands: Commands::default(),
            features: Features::default(),
            labels: Labels::default(),
        }
    }
}

/// Values a template can reference.
#[derive(Clone, Debug, Default)]
pub struct Vars<'a> {
    pub name: &'a str,
    pub alias: &'a str,
    pub branch: &'a str,
    pub service: &'a str,
    pub action: &'a str,
}

impl<'a> Vars<'a> {
    pub fn named(name: &'a str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    fn pairs(&self) -> [(&'static str, &'a str); 5] {
        [
            ("{name}", self.name),
            ("{alias}", self.alias),
            ("{branch}", self.branch),
            ("{service}", self.service),
            ("{action}", self.action),
        ]
    }
}

/// Substitutes placeholders verbatim. Used for tab labels.
pub fn render_label(template: &str, vars: &Vars<'_>) -> String {
    substitute(template, vars, |value| value.to_string())
}

/// Substitutes placeholders with shell-quoted values. Used for commands run
/// through `sh -c`.
pub fn render_command(template: &str, vars: &Vars<'_>) -> String {
    substitute(template, vars, shell_quote)
}

fn substitute(template: &str, vars: &Vars<'_>, encode: impl Fn(&str) -> String) -> String {
    let mut out = template.to_string();
    for (key, value) in vars.pairs() {
        if out.contains(key) {
            out = out.replace(key, &encode(value));
        }
    }
    out
}

pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | ':'))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Loads the config file. A missing file yields defaults; a malformed one
/// yields defaults plus a warning for the status line.
pub fn load_config(path: &Path) -> io::Result<(Config, Option<String>)> {
    if !path.exists() {
        return Ok((Config::default(), None));
    }
    let contents = fs::read_to_string(path)?;
    match toml::from_str::<Config>(&contents) {
        Ok(config) => Ok((config.normalized(), None)),
        Err(err) => Ok((
            Config::default(),
            Some(format!("config {} ignored: {}", path.display(), first_line(&err.to_string()))),
        )),
    }
}

impl Config {
    fn normalized(mut self) -> Self {
        if self.shell.trim().is_empty() {
            self.shell = default_shell();
        }
        if self.left_pct == 0 || self.left_pct >= 100 {
            self.left_pct = envdeck_mux::DEFAULT_LEFT_PCT;
        }
        if self.health_timeout_secs == 0 {
            self.health_timeout_secs = DEFAULT_HEALTH_TIMEOUT_SECS;
        }
        self
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = env::var("ENVDECK_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("envdeck")
        .join("config.toml")
}

fn default_shell() -> String {
    env::var("SHELL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

fn first_line(input: &str) -> &str {
    input.lines().next().unwrap_or(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (config, warning) = load_config(&dir.path().join("nope.toml")).expect("load");
        assert!(warning.is_none());
        assert_eq!(config.left_pct, 28);
        assert_eq!(config.labels.shell, "Shell — {name}");
        assert!(config.features.preview);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("file");
        writeln!(
            file,
            "left_pct = 35\n[commands]\ndiscover = \"envctl ls --json\"\n[features]\nstats = false"
        )
        .expect("write");

        let (config, warning) = load_config(file.path()).expect("load");

        assert!(warning.is_none());
        assert_eq!(config.left_pct, 35);
        assert_eq!(config.commands.discover, "envctl ls --json");
        assert!(!config.features.stats);
        assert!(config.features.services);
        assert_eq!(config.health_timeout_secs, DEFAULT_HEALTH_TIMEOUT_SECS);
    }

    #[test]
    fn malformed_file_falls_back_with_warning() {
        let mut file = tempfile::NamedTempFile::new().expect("file");
        writeln!(file, "left_pct = [").expect("write");

        let (config, warning) = load_config(file.path()).expect("load");

        assert_eq!(config, Config::default());
        assert!(warning.expect("warning").contains("ignored"));
    }

    #[test]
    fn out_of_range_values_are_normalized() {
        let mut file = tempfile::NamedTempFile::new().expect("file");
        writeln!(file, "left_pct = 140\nhealth_timeout_secs = 0\nshell = \"\"").expect("write");
        let (config, _) = load_config(file.path()).expect("load");
        assert_eq!(config.left_pct, 28);
        assert_eq!(config.health_timeout_secs, 60);
        assert!(!config.shell.is_empty());
    }

    #[test]
    fn command_templates_quote_values() {
        let vars = Vars {
            name: "my env",
            service: "api",
            ..Vars::default()
        };
        assert_eq!(
            render_command("envctl logs {name} --service {service}", &vars),
            "envctl logs 'my env' --service api"
        );
        assert_eq!(render_label("Shell — {name}", &vars), "Shell — my env");
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("feature/x-1"), "feature/x-1");
    }
}

//! Completion markers written by detached scripts.
//!
//! A script reports completion by writing `<exitcode>\n[payload]` to the
//! file for its kind. The dashboard polls, deletes on read, and treats a
//! missing file as "still running".

use crate::config::shell_quote;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

pub const SENTINEL_ENV: &str = "ENVDECK_SENTINEL";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SentinelKind {
    Create,
    Delete,
    Credentials,
}

impl SentinelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SentinelKind::Create => "create",
            SentinelKind::Delete => "delete",
            SentinelKind::Credentials => "credentials",
        }
    }
}

impl fmt::Display for SentinelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub code: i32,
    pub payload: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Sentinels {
    dir: PathBuf,
}

impl Default for Sentinels {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl Sentinels {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, kind: SentinelKind) -> PathBuf {
        self.dir.join(format!("envdeck-{kind}.status"))
    }

    /// Removes a leftover marker before a new run of `kind` starts.
    pub fn clear(&self, kind: SentinelKind) {
        let _ = fs::remove_file(self.path(kind));
    }

    /// Reads and deletes the marker. `None` while the script is running or
    /// the file is only partially written.
    pub fn take(&self, kind: SentinelKind) -> Option<Completion> {
        let path = self.path(kind);
        let contents = fs::read_to_string(&path).ok()?;
        let completion = parse(&contents)?;
        let _ = fs::remove_file(&path);
        Some(completion)
    }

    /// Shell snippet that runs `script` and writes its exit code to the
    /// marker unless the script already wrote one itself.
    pub fn wrap(&self, kind: SentinelKind, script: &str) -> String {
        wrap_script(&self.path(kind), script)
    }
}

fn wrap_script(path: &Path, script: &str) -> String {
    let target = shell_quote(&path.to_string_lossy());
    let script = shell_quote(script);
    // The script runs in its own shell so `exit` and `set -e` can't skip
    // the trailer.
    format!(
        "sh -c {script}\ncode=$?\n[ -f {target} ] || printf '%s\\n' \"$code\" > {target}\nexit $code"
    )
}

fn parse(contents: &str) -> Option<Completion> {
    let mut lines = contents.lines();
    let code = lines.next()?.trim().parse::<i32>().ok()?;
    let payload = lines
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string);
    Some(Completion { code, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn parse_reads_code_and_payload() {
        assert_eq!(
            parse("0\nhttps://demo.local\n"),
            Some(Completion {
                code: 0,
                payload: Some("https://demo.local".into())
            })
        );
        assert_eq!(parse("3\n"), Some(Completion { code: 3, payload: None }));
        assert_eq!(parse(""), None);
        assert_eq!(parse("nope\n"), None);
    }

    #[test]
    fn take_deletes_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sentinels = Sentinels::new(dir.path());
        assert!(sentinels.take(SentinelKind::Create).is_none());

        fs::write(sentinels.path(SentinelKind::Create), "1\nname taken\n").expect("write");

        let completion = sentinels.take(SentinelKind::Create).expect("completion");
        assert_eq!(completion.code, 1);
        assert_eq!(completion.payload.as_deref(), Some("name taken"));
        assert!(!sentinels.path(SentinelKind::Create).exists());
    }

    #[test]
    fn partial_marker_is_left_in_place() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sentinels = Sentinels::new(dir.path());
        fs::write(sentinels.path(SentinelKind::Delete), "").expect("write");
        assert!(sentinels.take(SentinelKind::Delete).is_none());
        assert!(sentinels.path(SentinelKind::Delete).exists());
    }

    #[test]
    fn wrapper_writes_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sentinels = Sentinels::new(dir.path());
        let status = Command::new("sh")
            .arg("-c")
            .arg(sentinels.wrap(SentinelKind::Create, "exit 5"))
            .status()
            .expect("sh");
        assert_eq!(status.code(), Some(5));
        assert_eq!(
            sentinels.take(SentinelKind::Create),
            Some(Completion { code: 5, payload: None })
        );
    }

    #[test]
    fn wrapper_records_early_exit_and_errexit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sentinels = Sentinels::new(dir.path());
        for (script, code) in [("echo creating; exit 3", 3), ("set -e; false; echo after", 1)] {
            let status = Command::new("sh")
                .arg("-c")
                .arg(sentinels.wrap(SentinelKind::Delete, script))
                .status()
                .expect("sh");
            assert_eq!(status.code(), Some(code), "{script}");
            assert_eq!(
                sentinels.take(SentinelKind::Delete),
                Some(Completion { code, payload: None }),
                "{script}"
            );
        }
    }

    #[test]
    fn wrapper_keeps_script_written_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sentinels = Sentinels::new(dir.path());
        let script = format!(
            "printf '0\\nready at :8080\\n' > \"${SENTINEL_ENV}\""
        );
        let status = Command::new("sh")
            .arg("-c")
            .arg(sentinels.wrap(SentinelKind::Credentials, &script))
            .env(SENTINEL_ENV, sentinels.path(SentinelKind::Credentials))
            .status()
            .expect("sh");
        assert!(status.success());
        let completion = sentinels.take(SentinelKind::Credentials).expect("completion");
        assert_eq!(completion.payload.as_deref(), Some("ready at :8080"));
    }
}

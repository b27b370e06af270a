use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("tmux is not installed or not on PATH")]
    NotInstalled,
    #[error("failed to spawn tmux: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("tmux {args} exited with {status}: {stderr}")]
    Command {
        args: String,
        status: i32,
        stderr: String,
    },
    #[error("unexpected tmux output: {0}")]
    Parse(String),
    #[error("multiplexer instance {0} is not started")]
    NotStarted(String),
}

impl MuxError {
    pub fn command(args: &[String], status: i32, stderr: &str) -> Self {
        MuxError::Command {
            args: args.join(" "),
            status,
            stderr: stderr.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_names_the_failing_invocation() {
        let args = vec!["split-window".to_string(), "-h".to_string()];
        let err = MuxError::command(&args, 1, "no space for new pane\n");
        assert_eq!(
            err.to_string(),
            "tmux split-window -h exited with 1: no space for new pane"
        );
    }
}

//! The two halves of a launch.
//!
//! The outer process owns the user's terminal: it starts a private
//! multiplexer instance whose first pane runs this binary again with
//! `--inner`, waits for the dashboard to report ready, then attaches. The
//! inner process is the dashboard itself.

use crate::app::App;
use crate::config::{config_path, load_config};
use crate::exec::Executor;
use crate::msg::Msg;
use crate::sentinel::Sentinels;
use crate::ui::{self, Term};
use anyhow::{Context, Result};
use crossterm::event::{Event, EventStream, KeyEventKind};
use envdeck_mux::{
    args, cleanup_stale, default_marker_dir, pid_alive, MuxRunner, MuxServer, PaneLayout,
    SessionRegistry, TmuxRunner,
};
use futures_util::StreamExt;
use std::{
    env,
    process::ExitCode,
    sync::{mpsc as std_mpsc, Arc},
    thread,
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn};

pub const SOCKET_ENV: &str = "ENVDECK_MUX_SOCKET";
pub const READY_ENV: &str = "ENVDECK_READY_CHANNEL";
const READY_POLL: Duration = Duration::from_millis(250);
const PLACEHOLDER_SCRIPT: &str =
    "printf '\\n  Select an environment and press Enter.\\n'; while :; do sleep 3600; done";

pub fn run_outer() -> Result<ExitCode> {
    let runner: Arc<dyn MuxRunner> =
        Arc::new(TmuxRunner::locate().context("envdeck needs tmux on PATH")?);
    let markers = default_marker_dir();
    let cleaned = cleanup_stale(&markers, runner.as_ref(), &pid_alive);
    if !cleaned.is_empty() {
        info!(count = cleaned.len(), "stale_instances_cleaned");
    }

    let server = Arc::new(MuxServer::new(runner, Some(markers)));
    let channel = format!("{}-ready", server.name());
    let exe = env::current_exe().context("locating envdeck binary")?;
    let command = inner_command(server.name(), &channel, &exe.to_string_lossy());
    server
        .ensure_started(crossterm::terminal::size().ok(), &command)
        .context("starting tmux")?;

    wait_until_ready(&server, &channel);

    if let Some(output) = dead_dashboard_output(&server) {
        server.kill();
        eprintln!("{}", output.trim_end());
        return Ok(ExitCode::FAILURE);
    }

    server.kill_control_client();
    if let Err(err) = server.attach() {
        warn!(error = %err, "attach_failed");
    }
    server.kill();
    Ok(ExitCode::SUCCESS)
}

fn inner_command(socket: &str, channel: &str, exe: &str) -> Vec<String> {
    args([
        "env",
        &format!("{SOCKET_ENV}={socket}"),
        &format!("{READY_ENV}={channel}"),
        exe,
        "--inner",
    ])
}

/// Blocks on the ready channel, giving up early if the dashboard pane dies
/// before it signals.
fn wait_until_ready(server: &Arc<MuxServer>, channel: &str) {
    let (tx, rx) = std_mpsc::channel();
    let waiter = server.clone();
    let name = channel.to_string();
    thread::spawn(move || {
        let _ = tx.send(waiter.wait_for(&name));
    });
    loop {
        match rx.recv_timeout(READY_POLL) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => {
                warn!(error = %err, "ready_wait_failed");
                return;
            }
            Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                if dashboard_dead(server) {
                    return;
                }
            }
        }
    }
}

fn dashboard_dead(server: &MuxServer) -> bool {
    server
        .run(&args([
            "display-message",
            "-p",
            "-t",
            &server.main_pane(0),
            "#{pane_dead}",
        ]))
        .map(|out| out.trim().starts_with('1'))
        .unwrap_or(true)
}

fn dead_dashboard_output(server: &MuxServer) -> Option<String> {
    if !dashboard_dead(server) {
        return None;
    }
    let output = server
        .run(&args(["capture-pane", "-p", "-t", &server.main_pane(0)]))
        .unwrap_or_default();
    if output.trim().is_empty() {
        Some("envdeck: dashboard exited during startup".to_string())
    } else {
        Some(output)
    }
}

pub async fn run_inner() -> Result<ExitCode> {
    let socket = env::var(SOCKET_ENV).with_context(|| format!("{SOCKET_ENV} is not set"))?;
    let ready = env::var(READY_ENV).ok().filter(|v| !v.trim().is_empty());
    let runner: Arc<dyn MuxRunner> =
        Arc::new(TmuxRunner::locate().context("envdeck needs tmux on PATH")?);
    let server = Arc::new(MuxServer::adopt(runner, socket));

    let path = config_path();
    let (config, warning) =
        load_config(&path).with_context(|| format!("reading {}", path.display()))?;

    let placeholder = args(["sh", "-c", PLACEHOLDER_SCRIPT]);
    let layout = match PaneLayout::setup(server.clone(), Some(config.left_pct), &placeholder) {
        Ok(layout) => layout,
        Err(err) => {
            eprintln!("envdeck: could not split the dashboard window: {err}");
            if let Some(channel) = &ready {
                let _ = server.signal(channel);
            }
            return Ok(ExitCode::FAILURE);
        }
    };

    let registry = Arc::new(SessionRegistry::new(server.clone(), Some(layout)));
    let mut app = App::new(config.clone(), registry, Sentinels::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let exec = Executor::new(Arc::new(config), server, ready, tx);

    let mut terminal = ui::setup_terminal()?;
    let result = run_loop(&mut terminal, &mut app, &exec, rx, warning).await;
    ui::restore_terminal(&mut terminal)?;
    app.shutdown();
    result.map(|()| ExitCode::SUCCESS)
}

async fn run_loop(
    terminal: &mut Term,
    app: &mut App,
    exec: &Executor,
    mut rx: UnboundedReceiver<Msg>,
    warning: Option<String>,
) -> Result<()> {
    let mut events = EventStream::new();
    exec.run_all(app.init(warning));

    loop {
        terminal.draw(|frame| ui::draw(frame, app))?;
        let cmds = tokio::select! {
            Some(msg) = rx.recv() => app.update(msg),
            maybe_event = events.next() => match maybe_event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    app.update(Msg::Key(key))
                }
                Some(Ok(Event::Resize(width, height))) => app.update(Msg::Resize(width, height)),
                Some(Ok(_)) => Vec::new(),
                Some(Err(err)) => return Err(err).context("reading terminal events"),
                None => break,
            },
        };
        exec.run_all(cmds);
        if app.should_quit() {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use envdeck_mux::fake::FakeMux;

    #[test]
    fn inner_command_passes_socket_and_channel() {
        let command = inner_command("envdeck-42", "envdeck-42-ready", "/usr/bin/envdeck");
        assert_eq!(
            command,
            vec![
                "env",
                "ENVDECK_MUX_SOCKET=envdeck-42",
                "ENVDECK_READY_CHANNEL=envdeck-42-ready",
                "/usr/bin/envdeck",
                "--inner",
            ]
        );
    }

    #[test]
    fn live_dashboard_has_no_failure_output() {
        let fake = Arc::new(FakeMux::new());
        let server = MuxServer::adopt(fake, "envdeck-launch");
        assert!(!dashboard_dead(&server));
        assert!(dead_dashboard_output(&server).is_none());
    }

    #[test]
    fn dead_dashboard_reports_generic_message_without_output() {
        let fake = Arc::new(FakeMux::new());
        let server = MuxServer::adopt(fake.clone(), "envdeck-launch");
        fake.exit_pane(&server.main_pane(0), 1);
        assert_eq!(
            dead_dashboard_output(&server).as_deref(),
            Some("envdeck: dashboard exited during startup")
        );
    }
}

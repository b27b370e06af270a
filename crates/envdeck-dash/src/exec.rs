//! Runs [`Cmd`]s off the event loop. Every command is one tokio task that
//! sends exactly one [`Msg`] back, except `SignalReady` which only talks to
//! the multiplexer.

use crate::backend;
use crate::config::Config;
use crate::msg::{Action, Cmd, Msg};
use envdeck_mux::MuxServer;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Executor {
    config: Arc<Config>,
    server: Arc<MuxServer>,
    ready_channel: Option<String>,
    tx: UnboundedSender<Msg>,
}

impl Executor {
    pub fn new(
        config: Arc<Config>,
        server: Arc<MuxServer>,
        ready_channel: Option<String>,
        tx: UnboundedSender<Msg>,
    ) -> Self {
        Self {
            config,
            server,
            ready_channel,
            tx,
        }
    }

    pub fn run_all(&self, cmds: Vec<Cmd>) {
        for cmd in cmds {
            self.run(cmd);
        }
    }

    pub fn run(&self, cmd: Cmd) {
        let tx = self.tx.clone();
        let config = self.config.clone();
        match cmd {
            Cmd::Tick(kind, delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Msg::Tick(kind));
                });
            }
            Cmd::Discover => {
                tokio::spawn(async move {
                    let result = backend::discover(&config).await;
                    let _ = tx.send(Msg::Discovered(result));
                });
            }
            Cmd::Stats => {
                tokio::spawn(async move {
                    let result = backend::stats(&config).await;
                    let _ = tx.send(Msg::Stats(result));
                });
            }
            Cmd::Services(env) => {
                tokio::spawn(async move {
                    let result = backend::services(&config, &env).await;
                    let _ = tx.send(Msg::Services { env, result });
                });
            }
            Cmd::Action {
                env,
                action,
                follow_up,
            } => {
                tokio::spawn(async move {
                    let started = tokio::time::Instant::now();
                    let result = match &action {
                        Action::Env(verb) => backend::env_action(&config, &env, *verb).await,
                        Action::Service { service, verb } => {
                            backend::service_action(&config, &env.name, service, *verb).await
                        }
                    };
                    info!(
                        action = %action.describe(&env.name),
                        ok = result.is_ok(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "action_finished"
                    );
                    let _ = tx.send(Msg::ActionDone {
                        env: env.name,
                        action,
                        follow_up,
                        result,
                    });
                });
            }
            Cmd::WaitHealthy { env, follow_up } => {
                tokio::spawn(async move {
                    let timeout = Duration::from_secs(config.health_timeout_secs);
                    let healthy = backend::wait_healthy(&config, &env, timeout).await;
                    let _ = tx.send(Msg::HealthWaitDone {
                        env,
                        healthy,
                        follow_up,
                    });
                });
            }
            Cmd::SignalReady => {
                let Some(channel) = self.ready_channel.clone() else {
                    debug!("no_ready_channel");
                    return;
                };
                let server = self.server.clone();
                tokio::task::spawn_blocking(move || match server.signal(&channel) {
                    Ok(()) => debug!(channel = %channel, "ready_signalled"),
                    Err(err) => warn!(channel = %channel, error = %err, "ready_signal_failed"),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Environment, Verb};
    use crate::msg::{FollowUp, TickKind};
    use envdeck_mux::fake::{wait_until, FakeMux};
    use tokio::sync::mpsc;

    fn executor(config: Config, fake: Arc<FakeMux>) -> (Executor, mpsc::UnboundedReceiver<Msg>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(MuxServer::adopt(fake, "envdeck-exec"));
        let exec = Executor::new(Arc::new(config), server, Some("envdeck-ready".into()), tx);
        (exec, rx)
    }

    #[tokio::test]
    async fn tick_is_delivered_after_delay() {
        let (exec, mut rx) = executor(Config::default(), Arc::new(FakeMux::new()));
        exec.run(Cmd::Tick(TickKind::Ui, Duration::from_millis(5)));
        let msg = rx.recv().await.expect("msg");
        assert!(matches!(msg, Msg::Tick(TickKind::Ui)));
    }

    #[tokio::test]
    async fn discover_sends_parsed_records() {
        let mut config = Config::default();
        config.commands.discover = r#"printf '[{"name":"api","running":true}]'"#.to_string();
        let (exec, mut rx) = executor(config, Arc::new(FakeMux::new()));

        exec.run(Cmd::Discover);

        match rx.recv().await.expect("msg") {
            Msg::Discovered(Ok(envs)) => assert_eq!(envs[0].name, "api"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_action_reports_error_text() {
        let mut config = Config::default();
        config.commands.stop = "echo 'still in use' >&2; exit 1".to_string();
        let (exec, mut rx) = executor(config, Arc::new(FakeMux::new()));

        exec.run(Cmd::Action {
            env: Environment {
                name: "api".into(),
                ..Environment::default()
            },
            action: Action::Env(Verb::Stop),
            follow_up: FollowUp::Nothing,
        });

        match rx.recv().await.expect("msg") {
            Msg::ActionDone { env, result, .. } => {
                assert_eq!(env, "api");
                assert_eq!(result, Err("still in use".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn signal_ready_uses_channel() {
        let fake = Arc::new(FakeMux::new());
        let (exec, _rx) = executor(Config::default(), fake.clone());

        exec.run(Cmd::SignalReady);

        assert!(wait_until(Duration::from_secs(2), || fake.count_calls("wait-for") == 1));
        assert_eq!(fake.calls_for("wait-for")[0], vec!["wait-for", "-S", "envdeck-ready"]);
    }
}

use envdeck_mux::fake::{wait_until, FakeMux};
use envdeck_mux::{
    args, cleanup_stale, MuxServer, PaneLayout, SessionRegistry, SpawnSpec, EXIT_UNKNOWN,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

fn started_registry(fake: &Arc<FakeMux>, marker_dir: &std::path::Path) -> SessionRegistry {
    let server = Arc::new(MuxServer::with_name(
        fake.clone(),
        "envdeck-flow",
        Some(marker_dir.to_path_buf()),
    ));
    server
        .ensure_started(Some((160, 48)), &args(["envdeck", "--inner"]))
        .expect("start");
    let layout = PaneLayout::setup(server.clone(), Some(30), &args(["cat"])).expect("layout");
    SessionRegistry::new(server, Some(layout))
}

#[test]
fn full_lifecycle_runs_against_one_instance() {
    let fake = Arc::new(FakeMux::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = started_registry(&fake, dir.path());
    let marker = dir.path().join(std::process::id().to_string());
    assert_eq!(fs::read_to_string(&marker).expect("marker"), "envdeck-flow");

    let shell = registry
        .open("Shell — api", SpawnSpec::new("bash"))
        .expect("open shell");
    let logs = registry
        .open("Logs — api", SpawnSpec::new("tail").args(["-f", "api.log"]))
        .expect("open logs");
    assert_eq!(registry.layout().and_then(|l| l.active_window()).as_deref(), Some(logs.window()));

    registry.prev_tab();
    assert_eq!(registry.layout().and_then(|l| l.active_window()).as_deref(), Some(shell.window()));

    fake.exit_pane(logs.window(), 0);
    assert!(wait_until(Duration::from_secs(3), || !logs.is_alive()));
    assert_eq!(registry.close_dead_logs(), 1);
    assert_eq!(registry.len(), 1);

    registry.close_all();

    assert!(fake.sockets_for("new-window").iter().all(|s| s == "envdeck-flow"));
    assert_eq!(fake.count_calls("kill-server"), 1);
    assert_eq!(fake.clients_stopped(), 1);
    assert!(!marker.exists());
}

#[test]
fn scripted_tab_records_exit_code_for_label() {
    let fake = Arc::new(FakeMux::new());
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = started_registry(&fake, dir.path());

    assert_eq!(registry.exit_code_for_label("Create — demo"), EXIT_UNKNOWN);
    let tab = registry
        .open(
            "Create — demo",
            SpawnSpec::new("sh")
                .args(["-c", "./create.sh demo"])
                .env("ENVDECK_SENTINEL", "/tmp/envdeck-create.status"),
        )
        .expect("open");
    fake.exit_pane(tab.window(), 4);
    assert!(wait_until(Duration::from_secs(3), || !tab.is_alive()));

    assert!(registry.has_label("Create — demo"));
    assert!(!registry.is_label_alive("Create — demo"));
    assert_eq!(registry.exit_code_for_label("Create — demo"), 4);
    registry.close_all();
}

#[test]
fn stale_markers_from_dead_runs_are_cleaned() {
    let fake = FakeMux::new();
    let dir = tempfile::tempdir().expect("tempdir");
    let own = std::process::id();
    fs::write(dir.path().join("999999"), "envdeck-999999").expect("write");
    fs::write(dir.path().join(own.to_string()), format!("envdeck-{own}")).expect("write");

    let cleaned = cleanup_stale(dir.path(), &fake, &|pid| pid == own);

    assert_eq!(cleaned, vec![999999]);
    assert_eq!(fake.sockets_for("kill-server"), vec!["envdeck-999999".to_string()]);
    assert!(dir.path().join(own.to_string()).exists());
}

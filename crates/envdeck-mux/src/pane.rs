use crate::error::MuxError;
use crate::runner::args;
use crate::server::MuxServer;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub const DEFAULT_LEFT_PCT: u16 = 28;
const FALLBACK_DIMENSIONS: (u16, u16) = (120, 40);

/// The fixed two-region split of the main window.
///
/// Region A (pane 0) hosts the control surface and keeps input focus by
/// default. Region B (pane 1) is the single content viewport. Sessions are
/// brought into region B by swapping their pane with the placeholder, and
/// parked again by swapping back, so their scrollback and running process
/// are never disturbed.
pub struct PaneLayout {
    server: Arc<MuxServer>,
    placeholder: String,
    active: Mutex<Option<String>>,
}

impl PaneLayout {
    /// Splits the main window once. `left_pct` sizes region A; out-of-range
    /// values are clamped into (0, 100).
    pub fn setup(
        server: Arc<MuxServer>,
        left_pct: Option<u16>,
        placeholder: &[String],
    ) -> Result<Arc<Self>, MuxError> {
        let left = left_pct.unwrap_or(DEFAULT_LEFT_PCT).clamp(1, 99);
        let right = 100 - left;
        let mut cmd = args(["split-window", "-h", "-d", "-P", "-F", "#{pane_id}"]);
        cmd.extend(args(["-t", &server.main_pane(0), "-l", &format!("{right}%")]));
        cmd.extend(placeholder.iter().cloned());

        let output = server.run(&cmd)?;
        let placeholder = output.trim().to_string();
        if !placeholder.starts_with('%') {
            return Err(MuxError::Parse(format!(
                "expected placeholder pane id, got {placeholder:?}"
            )));
        }
        let layout = Arc::new(Self {
            server,
            placeholder,
            active: Mutex::new(None),
        });
        layout.focus_left();
        info!(left_pct = left, placeholder = %layout.placeholder, "pane_layout_ready");
        Ok(layout)
    }

    pub fn placeholder(&self) -> &str {
        &self.placeholder
    }

    /// Window currently occupying the viewport.
    pub fn active_window(&self) -> Option<String> {
        self.marker().clone()
    }

    pub fn has_active_session(&self) -> bool {
        self.marker().is_some()
    }

    /// Brings `window` into the viewport, parking whatever was shown first.
    /// An empty `window` only parks the current one.
    pub fn show_session(&self, window: &str) {
        let mut active = self.marker();
        if active.as_deref() == Some(window) {
            return;
        }
        if let Some(current) = active.take() {
            self.swap(&current);
        }
        if window.is_empty() {
            return;
        }
        if self.swap(window) {
            *active = Some(window.to_string());
        }
        drop(active);
        self.focus_left();
    }

    /// Parks the shown window. No-op when the viewport holds the placeholder.
    pub fn return_session(&self) {
        let mut active = self.marker();
        if let Some(current) = active.take() {
            self.swap(&current);
        }
    }

    /// Parks `from` and shows `to` as one step.
    pub fn switch_tab(&self, from: &str, to: &str) {
        if from == to {
            return;
        }
        self.return_session();
        self.show_session(to);
    }

    pub fn is_zoomed(&self) -> bool {
        self.server
            .run(&args([
                "display-message",
                "-p",
                "-t",
                &self.server.main_pane(1),
                "#{window_zoomed_flag}",
            ]))
            .map(|out| out.trim() == "1")
            .unwrap_or(false)
    }

    pub fn zoom_right(&self) {
        if !self.is_zoomed() {
            self.toggle_zoom_flag();
        }
    }

    pub fn unzoom_right(&self) {
        if self.is_zoomed() {
            self.toggle_zoom_flag();
        }
    }

    pub fn focus_right(&self) {
        self.server
            .run_quiet(&args(["select-pane", "-t", &self.server.main_pane(1)]));
    }

    pub fn focus_left(&self) {
        self.server
            .run_quiet(&args(["select-pane", "-t", &self.server.main_pane(0)]));
    }

    /// Live size of the viewport, or a safe default when the query fails.
    pub fn right_pane_dimensions(&self) -> (u16, u16) {
        self.server
            .run(&args([
                "display-message",
                "-p",
                "-t",
                &self.server.main_pane(1),
                "#{pane_width} #{pane_height}",
            ]))
            .ok()
            .and_then(|out| parse_dimensions(&out))
            .unwrap_or(FALLBACK_DIMENSIONS)
    }

    fn toggle_zoom_flag(&self) {
        self.server
            .run_quiet(&args(["resize-pane", "-Z", "-t", &self.server.main_pane(1)]));
    }

    fn swap(&self, window: &str) -> bool {
        match self.server.run(&args([
            "swap-pane",
            "-d",
            "-s",
            window,
            "-t",
            &self.placeholder,
        ])) {
            Ok(_) => true,
            Err(err) => {
                debug!(window, error = %err, "swap_failed");
                false
            }
        }
    }

    fn marker(&self) -> MutexGuard<'_, Option<String>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn parse_dimensions(output: &str) -> Option<(u16, u16)> {
    let mut parts = output.split_whitespace();
    let width = parts.next()?.parse::<u16>().ok()?;
    let height = parts.next()?.parse::<u16>().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

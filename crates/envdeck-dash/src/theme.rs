use crate::app::Level;
use ratatui::style::{Color, Modifier, Style};

pub const HEADER_STYLE: Style = Style::new()
    .fg(Color::Rgb(142, 192, 124))
    .add_modifier(Modifier::BOLD);
pub const SELECTED_STYLE: Style = Style::new()
    .bg(Color::Rgb(131, 165, 152))
    .fg(Color::Black)
    .add_modifier(Modifier::BOLD);
pub const FOCUS_COLOR: Color = Color::Cyan;
pub const MUTED: Color = Color::Rgb(146, 131, 116);

pub mod icons {
    pub const RUNNING: &str = "●";
    pub const STOPPED: &str = "○";
    pub const DEAD: &str = "✗";
    pub const ACTIVE_TAB: &str = "▸";
}

pub fn health_color(running: bool, health: &str) -> Color {
    if !running {
        return MUTED;
    }
    match health.trim().to_ascii_lowercase().as_str() {
        "" | "healthy" | "ok" | "up" | "running" => Color::Rgb(184, 187, 38),
        "starting" | "degraded" => Color::Rgb(250, 189, 47),
        _ => Color::Rgb(254, 128, 25),
    }
}

pub fn service_color(status: &str) -> Color {
    match status.trim().to_ascii_lowercase().as_str() {
        "running" | "healthy" | "up" => Color::Rgb(184, 187, 38),
        "starting" | "restarting" => Color::Rgb(250, 189, 47),
        "exited" | "dead" | "failed" => Color::Rgb(214, 93, 14),
        _ => MUTED,
    }
}

pub fn level_style(level: Level) -> Style {
    let color = match level {
        Level::Info => Color::Rgb(131, 165, 152),
        Level::Success => Color::Rgb(184, 187, 38),
        Level::Warn => Color::Rgb(250, 189, 47),
        Level::Error => Color::Rgb(251, 73, 52),
    };
    Style::new().fg(color)
}

use crate::config::config_path;
use crate::ui::{self, keycap};
use anyhow::Result;
use crossterm::event::{self, Event, KeyEventKind};
use ratatui::{
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Page {
    Keys,
    Config,
}

const KEYS: &[(&str, &str)] = &[
    ("Tab", "next panel"),
    ("Esc", "back"),
    ("j/k", "move"),
    ("Enter", "shell / show tab / actions"),
    ("t", "another shell tab"),
    ("l", "open logs tab"),
    ("s", "start environment"),
    ("S", "stop environment"),
    ("R", "restart environment"),
    ("n", "new environment"),
    ("d", "delete environment"),
    ("c", "reload credentials"),
    ("p", "toggle log preview"),
    ("[ ]", "previous / next tab"),
    ("x", "close tab or preview"),
    ("X", "close dead log tabs"),
    ("F5", "rerun finished tab"),
    ("z", "zoom viewport"),
    ("f", "focus viewport"),
    ("C-g", "back to dashboard"),
    ("r", "refresh now"),
    ("q", "quit"),
];

pub fn key_lines() -> Vec<Line<'static>> {
    let mut lines = vec![Line::from("Keys:")];
    for (key, what) in KEYS {
        lines.push(Line::from(vec![
            Span::raw("  "),
            keycap(key),
            Span::raw(format!(" {what}")),
        ]));
    }
    lines.push(Line::from(""));
    lines.push(Line::from("Press Esc or ? to close this help."));
    lines
}

pub fn config_lines() -> Vec<Line<'static>> {
    let path = config_path();
    let mut lines = vec![
        Line::from(format!("Config file: {}", path.display())),
        Line::from("(override with ENVDECK_CONFIG_PATH)"),
        Line::from(""),
    ];
    let sample = [
        "shell = \"/bin/zsh\"",
        "left_pct = 28",
        "health_timeout_secs = 60",
        "",
        "[commands]",
        "discover = \"envctl ls --json\"",
        "stats = \"envctl stats --json\"",
        "services = \"envctl services {name} --json\"",
        "start = \"envctl up {name}\"",
        "stop = \"envctl down {name}\"",
        "restart = \"envctl restart {name}\"",
        "service_action = \"envctl {action} {name} {service}\"",
        "logs = \"envctl logs -f {name}\"",
        "service_logs = \"envctl logs -f {name} {service}\"",
        "create = \"envctl create {name}\"",
        "delete = \"envctl rm {name}\"",
        "credentials = \"envctl login\"",
        "",
        "[features]",
        "services = true",
        "stats = true",
        "credentials = true",
        "preview = true",
        "",
        "[labels]",
        "shell = \"Shell — {name}\"",
        "create = \"Create — {name}\"",
        "delete = \"Delete — {name}\"",
        "credentials = \"Credentials\"",
    ];
    lines.extend(sample.iter().map(|line| Line::from(format!("  {line}"))));
    lines.push(Line::from(""));
    lines.push(Line::from(
        "Templates accept {name} {alias} {branch} {service} {action}.",
    ));
    lines.push(Line::from(
        "Scripts for create/delete/credentials may write their result to $ENVDECK_SENTINEL.",
    ));
    lines
}

/// Shows one help page full screen until any key is pressed.
pub fn run_static(page: Page) -> Result<()> {
    let (title, lines) = match page {
        Page::Keys => ("envdeck keys", key_lines()),
        Page::Config => ("envdeck config", config_lines()),
    };
    let mut terminal = ui::setup_terminal()?;
    let result = (|| -> Result<()> {
        loop {
            terminal.draw(|frame| {
                let paragraph = Paragraph::new(lines.clone())
                    .block(Block::default().borders(Borders::ALL).title(title))
                    .wrap(Wrap { trim: false });
                frame.render_widget(paragraph, frame.size());
            })?;
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(());
                }
            }
        }
    })();
    ui::restore_terminal(&mut terminal)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(lines: &[Line<'_>]) -> String {
        lines
            .iter()
            .map(|line| {
                line.spans
                    .iter()
                    .map(|span| span.content.as_ref())
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn key_page_lists_every_binding() {
        let page = text(&key_lines());
        for (key, _) in KEYS {
            assert!(page.contains(&format!("[{key}]")), "missing {key}");
        }
    }

    #[test]
    fn config_page_mentions_sentinel_variable() {
        let page = text(&config_lines());
        assert!(page.contains("$ENVDECK_SENTINEL"));
        assert!(page.contains("[commands]"));
    }
}

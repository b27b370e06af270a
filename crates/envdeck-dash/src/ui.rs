use crate::app::{App, Panel};
use crate::help;
use crate::theme::{self, icons, FOCUS_COLOR, HEADER_STYLE, MUTED, SELECTED_STYLE};
use anyhow::Result;
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;

pub type Term = Terminal<CrosstermBackend<io::Stdout>>;

pub fn setup_terminal() -> Result<Term> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;
    Ok(terminal)
}

pub fn restore_terminal(terminal: &mut Term) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

pub fn draw(frame: &mut Frame, app: &App) {
    let area = frame.size();
    let tabs = app.tabs();
    let tabs_height = (tabs.len().max(1) as u16 + 2).min(8);

    let mut constraints = vec![Constraint::Length(tabs_height), Constraint::Min(5)];
    if app.config.features.services {
        constraints.push(Constraint::Length(8));
    }
    constraints.push(Constraint::Length(9));
    constraints.push(Constraint::Length(3));
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(area);

    let mut index = 0;
    render_tabs(frame, app, chunks[index]);
    index += 1;
    render_environments(frame, app, chunks[index]);
    index += 1;
    if app.config.features.services {
        render_services(frame, app, chunks[index]);
        index += 1;
    }
    render_details(frame, app, chunks[index]);
    index += 1;
    let footer = Paragraph::new(footer_lines(app));
    frame.render_widget(footer, chunks[index]);

    if app.help {
        render_help(frame, area);
    } else if let Some(confirm) = &app.confirm {
        render_confirm(frame, area, &confirm.prompt);
    } else if let Some(input) = &app.input {
        render_input(frame, area, &input.title, &input.buffer);
    } else if app.picker.is_some() {
        render_picker(frame, app, area);
    }
}

fn render_tabs(frame: &mut Frame, app: &App, area: Rect) {
    let focused = app.panel == Panel::Tabs;
    let tabs = app.tabs();
    let block = titled_block(Panel::Tabs.title(), focused);
    if tabs.is_empty() {
        let empty = Paragraph::new(Line::from(Span::styled(
            "no open tabs",
            Style::default().fg(MUTED),
        )))
        .block(block);
        frame.render_widget(empty, area);
        return;
    }
    let items: Vec<ListItem> = tabs
        .iter()
        .map(|tab| {
            let marker = if tab.active { icons::ACTIVE_TAB } else { " " };
            let mut spans = vec![Span::raw(format!("{marker} {} ", tab.position + 1))];
            if tab.alive {
                spans.push(Span::raw(tab.label.clone()));
            } else {
                spans.push(Span::styled(
                    format!("{} {}", icons::DEAD, tab.label),
                    Style::default().fg(MUTED),
                ));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();
    let list = List::new(items)
        .block(block)
        .highlight_style(nav_highlight_style(focused));
    let mut state = app.tab_state.clone();
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_environments(frame: &mut Frame, app: &App, area: Rect) {
    let focused = app.panel == Panel::Environments;
    let block = titled_block(Panel::Environments.title(), focused);
    if app.envs.is_empty() {
        let text = if app.loaded {
            "no environments"
        } else {
            "discovering…"
        };
        let empty =
            Paragraph::new(Line::from(Span::styled(text, Style::default().fg(MUTED)))).block(block);
        frame.render_widget(empty, area);
        return;
    }
    let items: Vec<ListItem> = app
        .envs
        .iter()
        .map(|env| {
            let icon = if env.running {
                icons::RUNNING
            } else {
                icons::STOPPED
            };
            let mut spans = vec![
                Span::styled(
                    format!("{icon} "),
                    Style::default().fg(theme::health_color(env.running, &env.health)),
                ),
                Span::raw(env.name.clone()),
            ];
            if let Some(pending) = app.pending.get(&env.name) {
                spans.push(Span::styled(
                    format!(" {} {}", app.spinner_frame(), pending.label),
                    Style::default().fg(Color::Yellow),
                ));
            } else if let Some(usage) = app.usage.get(&env.name) {
                spans.push(Span::styled(
                    format!("  {} {}", usage.cpu, usage.memory),
                    Style::default().fg(MUTED),
                ));
            }
            if app.preview_target() == Some(env.name.as_str()) {
                spans.push(Span::styled(" [preview]", Style::default().fg(FOCUS_COLOR)));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();
    let list = List::new(items)
        .block(block)
        .highlight_style(nav_highlight_style(focused));
    let mut state = app.env_state.clone();
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_services(frame: &mut Frame, app: &App, area: Rect) {
    let focused = app.panel == Panel::Services;
    let block = titled_block(Panel::Services.title(), focused);
    if app.services.is_empty() {
        let text = match app.selected_env() {
            Some(env) if env.running => "no services",
            Some(_) => "environment stopped",
            None => "",
        };
        let empty =
            Paragraph::new(Line::from(Span::styled(text, Style::default().fg(MUTED)))).block(block);
        frame.render_widget(empty, area);
        return;
    }
    let items: Vec<ListItem> = app
        .services
        .iter()
        .map(|service| {
            let mut spans = vec![Span::raw(service.title().to_string())];
            let key = app
                .selected_env()
                .map(|env| format!("{}/{}", env.name, service.name));
            if let Some(pending) = key.and_then(|k| app.pending.get(&k)) {
                spans.push(Span::styled(
                    format!(" {} {}", app.spinner_frame(), pending.label),
                    Style::default().fg(Color::Yellow),
                ));
            } else {
                spans.push(Span::styled(
                    format!("  {}", service.status),
                    Style::default().fg(theme::service_color(&service.status)),
                ));
            }
            ListItem::new(Line::from(spans))
        })
        .collect();
    let list = List::new(items)
        .block(block)
        .highlight_style(nav_highlight_style(focused));
    let mut state = app.service_state.clone();
    frame.render_stateful_widget(list, area, &mut state);
}

fn render_details(frame: &mut Frame, app: &App, area: Rect) {
    let focused = app.panel == Panel::Details;
    let block = titled_block(Panel::Details.title(), focused);
    let lines = match app.selected_env() {
        Some(env) => {
            let usage = app.usage.get(&env.name);
            let cpu = usage.map(|u| u.cpu.as_str()).unwrap_or(&env.cpu);
            let memory = usage.map(|u| u.memory.as_str()).unwrap_or(&env.memory);
            let state = if env.running { "running" } else { "stopped" };
            let mut lines = vec![
                Line::from(Span::styled(env.name.clone(), HEADER_STYLE)),
                detail_line("state", state),
                detail_line("health", &env.health),
                detail_line("branch", &env.branch),
                detail_line("alias", &env.alias),
                detail_line("type", &env.kind),
                detail_line("usage", &format!("{cpu} {memory}")),
                detail_line("path", env.path.as_deref().unwrap_or("")),
            ];
            if let Some(pending) = app.pending.get(&env.name) {
                let busy = format!("{} for {}s", pending.label, pending.since.elapsed().as_secs());
                lines.push(detail_line("busy", &busy));
            }
            if let Some(at) = app.refreshed_at {
                lines.push(detail_line("updated", &at.format("%H:%M:%S").to_string()));
            }
            lines
        }
        None => vec![Line::from(Span::styled(
            "nothing selected",
            Style::default().fg(MUTED),
        ))],
    };
    let paragraph = Paragraph::new(lines)
        .block(block)
        .wrap(Wrap { trim: true })
        .scroll((app.details_scroll, 0));
    frame.render_widget(paragraph, area);
}

fn detail_line<'a>(key: &'a str, value: &str) -> Line<'a> {
    Line::from(vec![
        Span::styled(format!("{key:>7} "), Style::default().fg(MUTED)),
        Span::raw(value.to_string()),
    ])
}

fn render_help(frame: &mut Frame, area: Rect) {
    let popup = centered_rect(90, 90, area);
    frame.render_widget(Clear, popup);
    let paragraph = Paragraph::new(help::key_lines())
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, popup);
}

fn render_confirm(frame: &mut Frame, area: Rect, prompt: &str) {
    let popup = centered_rect(80, 30, area);
    frame.render_widget(Clear, popup);
    let lines = vec![
        Line::from(prompt.to_string()),
        Line::from(""),
        Line::from(vec![
            keycap("y"),
            Span::raw(" yes  "),
            keycap("n"),
            Span::raw(" no"),
        ]),
    ];
    let paragraph = Paragraph::new(lines)
        .block(titled_block("Confirm", true))
        .wrap(Wrap { trim: false });
    frame.render_widget(paragraph, popup);
}

fn render_input(frame: &mut Frame, area: Rect, title: &str, buffer: &str) {
    let popup = centered_rect(80, 20, area);
    frame.render_widget(Clear, popup);
    let paragraph = Paragraph::new(Line::from(vec![
        Span::raw(buffer.to_string()),
        Span::styled("_", Style::default().add_modifier(Modifier::SLOW_BLINK)),
    ]))
    .block(titled_block(title, true));
    frame.render_widget(paragraph, popup);
}

fn render_picker(frame: &mut Frame, app: &App, area: Rect) {
    let Some(picker) = &app.picker else {
        return;
    };
    let popup = centered_rect(70, 40, area);
    frame.render_widget(Clear, popup);
    let items: Vec<ListItem> = picker
        .options
        .iter()
        .map(|option| ListItem::new(option.clone()))
        .collect();
    let list = List::new(items)
        .block(titled_block(&picker.title, true))
        .highlight_style(SELECTED_STYLE);
    let mut state = picker.state.clone();
    frame.render_stateful_widget(list, popup, &mut state);
}

pub fn centered_rect(percent_x: u16, percent_y: u16, rect: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(rect);
    let horizontal = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1]);
    horizontal[1]
}

fn footer_lines(app: &App) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    match &app.status {
        Some(status) => {
            let mut spans = Vec::new();
            if status.activity {
                spans.push(Span::styled(
                    format!("{} ", app.spinner_frame()),
                    Style::default().fg(Color::Yellow),
                ));
            }
            spans.push(Span::styled(status.text.clone(), theme::level_style(status.level)));
            lines.push(Line::from(spans));
        }
        None => lines.push(Line::from(Span::styled(
            "Ready",
            Style::default().fg(Color::DarkGray),
        ))),
    }

    let actions = match app.panel {
        Panel::Tabs => vec![
            keycap("Enter"),
            Span::raw(" show "),
            keycap("x"),
            Span::raw(" close "),
            keycap("F5"),
            Span::raw(" rerun"),
        ],
        Panel::Environments => vec![
            keycap("Enter"),
            Span::raw(" shell "),
            keycap("l"),
            Span::raw(" logs "),
            keycap("s/S"),
            Span::raw(" start/stop"),
        ],
        Panel::Services => vec![
            keycap("Enter"),
            Span::raw(" actions "),
            keycap("l"),
            Span::raw(" logs"),
        ],
        Panel::Details => vec![
            keycap("Enter"),
            Span::raw(" keep preview "),
            keycap("p"),
            Span::raw(" preview"),
        ],
    };
    lines.push(Line::from(actions));
    lines.push(Line::from(vec![
        keycap("Tab"),
        Span::raw(" panel "),
        keycap("[ ]"),
        Span::raw(" tabs "),
        keycap("q"),
        Span::raw(" quit "),
        keycap("?"),
        Span::raw(" help"),
    ]));
    lines
}

pub fn keycap(label: &str) -> Span<'_> {
    Span::styled(
        format!("[{label}]"),
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    )
}

fn titled_block(title: &str, focused: bool) -> Block<'_> {
    let title_style = if focused {
        Style::default()
            .fg(FOCUS_COLOR)
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    let title = if focused {
        format!("{title} *")
    } else {
        title.to_string()
    };
    let mut block = Block::default()
        .title(Span::styled(title, title_style))
        .borders(Borders::ALL);
    if focused {
        block = block.border_style(Style::default().fg(FOCUS_COLOR));
    }
    block
}

fn nav_highlight_style(focused: bool) -> Style {
    if focused {
        SELECTED_STYLE
    } else {
        Style::default().add_modifier(Modifier::BOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Environment;
    use crate::config::Config;
    use crate::msg::Msg;
    use crate::sentinel::Sentinels;
    use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
    use envdeck_mux::fake::FakeMux;
    use envdeck_mux::{MuxServer, SessionRegistry};
    use ratatui::backend::TestBackend;
    use std::sync::Arc;

    fn app() -> App {
        let fake = Arc::new(FakeMux::new());
        let server = Arc::new(MuxServer::adopt(fake, "envdeck-ui"));
        let registry = Arc::new(SessionRegistry::new(server, None));
        App::new(Config::default(), registry, Sentinels::new(std::env::temp_dir()))
    }

    #[allow(deprecated)]
    fn render_to_string(app: &App, width: u16, height: u16) -> String {
        let backend = TestBackend::new(width, height);
        let mut terminal = Terminal::new(backend).expect("terminal");
        terminal.draw(|frame| draw(frame, app)).expect("draw");

        let buf = terminal.backend().buffer();
        let area = buf.area;
        let mut lines = Vec::new();
        for y in area.y..area.y + area.height {
            let mut line = String::new();
            for x in area.x..area.x + area.width {
                line.push_str(buf.get(x, y).symbol());
            }
            lines.push(line.trim_end().to_string());
        }
        lines.join("\n")
    }

    #[test]
    fn renders_environments_and_details() {
        let mut app = app();
        app.update(Msg::Discovered(Ok(vec![Environment {
            name: "api".into(),
            running: true,
            health: "healthy".into(),
            branch: "main".into(),
            ..Environment::default()
        }])));

        let screen = render_to_string(&app, 60, 40);

        assert!(screen.contains("Environments *"));
        assert!(screen.contains("● api"));
        assert!(screen.contains("branch main"));
        assert!(screen.contains("no open tabs"));
    }

    #[test]
    fn shows_discovering_before_first_result() {
        let screen = render_to_string(&app(), 60, 40);
        assert!(screen.contains("discovering"));
        assert!(screen.contains("Ready"));
    }

    #[test]
    fn help_overlay_covers_panels() {
        let mut app = app();
        app.update(Msg::Key(KeyEvent::new(KeyCode::Char('?'), KeyModifiers::NONE)));
        let screen = render_to_string(&app, 60, 50);
        assert!(screen.contains("Help"));
        assert!(screen.contains("close dead log tabs"));
    }

    #[test]
    fn services_panel_hidden_when_disabled() {
        let mut app = app();
        app.config.features.services = false;
        let screen = render_to_string(&app, 60, 40);
        assert!(!screen.contains("Services"));
    }
}

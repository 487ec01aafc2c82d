use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Row, Table, Wrap},
    Frame,
};

use cadence_core::engine::{EngineStatus, RunState};
use cadence_core::platform::hotkey::HOTKEY_LABEL;
use cadence_core::store::events::EngineEvent;
use cadence_core::store::SkillSnapshot;

use crate::App;

pub fn draw(f: &mut Frame, app: &App) {
    let chunks = if app.log_visible {
        Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(f.area())
    } else {
        Layout::default()
            .constraints([Constraint::Percentage(100)])
            .split(f.area())
    };

    let status = app.engine.status();
    let skills = app.engine.skills();

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(6),
            Constraint::Length(skills.len().min(12) as u16 + 3),
            Constraint::Length(10),
        ])
        .split(chunks[0]);

    draw_banner(f, left[0], &status);
    draw_presets(f, left[1], app, &status);
    draw_skills(f, left[2], app, skills);
    draw_feed(f, left[3], app);

    if app.log_visible && chunks.len() > 1 {
        draw_logs(f, chunks[1], app);
    }

    if let Some(dialog) = &app.confirm {
        dialog.render(f);
    }
}

fn banner_text(status: &EngineStatus) -> (String, Color) {
    let preset = status.preset_id.as_deref().unwrap_or("-");
    let mode = match (&status.mode_id, status.step) {
        (Some(m), Some(s)) => format!("  mode {} step {}", m, s),
        (Some(m), None) => format!("  mode {}", m),
        _ => String::new(),
    };
    match status.state {
        RunState::Running => (format!("RUNNING {}{} (S to stop, P to pause)", preset, mode), Color::Green),
        RunState::Paused => (format!("PAUSED {}{} (P to resume, N to step)", preset, mode), Color::Yellow),
        RunState::Idle => match &status.last_stop {
            Some(reason) => (format!("IDLE: {} (Enter to start)", reason), Color::Red),
            None => ("IDLE (Enter to start)".to_string(), Color::Red),
        },
    }
}

fn draw_banner(f: &mut Frame, area: Rect, status: &EngineStatus) {
    let (label, bg) = banner_text(status);
    let width = area.width as usize;
    let pad_total = width.saturating_sub(label.chars().count());
    let pad_left = pad_total / 2;
    let centered = format!("{}{}{}", " ".repeat(pad_left), label, " ".repeat(pad_total - pad_left));
    let banner = Paragraph::new(Line::from(Span::styled(
        centered,
        Style::default().fg(Color::Black).bg(bg).add_modifier(Modifier::BOLD),
    )));
    f.render_widget(banner, area);
}

fn key(k: &str) -> Span<'_> {
    Span::styled(k, Style::default().fg(Color::Yellow))
}

fn draw_presets(f: &mut Frame, area: Rect, app: &App, status: &EngineStatus) {
    let mut lines: Vec<Line> = vec![
        Line::from(vec![
            key(" j"),
            Span::raw("/"),
            key("k"),
            Span::raw(" select, "),
            key("enter"),
            Span::raw(" start/stop, "),
            key("v"),
            Span::raw(" validate, "),
            key(HOTKEY_LABEL),
            Span::raw(" pause"),
        ]),
        Line::from(""),
    ];

    for (i, entry) in app.presets.iter().enumerate() {
        let prefix = if i == app.selected { "> " } else { "  " };
        let running = status.state != RunState::Idle && entry.id().is_some() && entry.id() == status.preset_id.as_deref();
        let marker = if running { "[●]" } else { "[ ]" };
        let mut spans = vec![
            Span::raw(prefix),
            Span::styled(marker, Style::default().fg(if running { Color::Green } else { Color::DarkGray })),
            Span::raw(" "),
            Span::styled(entry.name.clone(), Style::default().fg(Color::White).add_modifier(Modifier::BOLD)),
        ];
        match &entry.doc {
            Ok(doc) if !doc.name.is_empty() => {
                spans.push(Span::styled(format!("  {}", doc.name), Style::default().fg(Color::DarkGray)));
            }
            Ok(_) => {}
            Err(e) => spans.push(Span::styled(format!("  err: {}", e), Style::default().fg(Color::Red))),
        }
        lines.push(Line::from(spans));
    }
    if app.presets.is_empty() {
        lines.push(Line::from(Span::styled("  no presets found", Style::default().fg(Color::DarkGray))));
    }

    if let Some(cap) = &status.capture {
        let color = if cap.failures > 0 { Color::Red } else { Color::DarkGray };
        let mut text = format!(
            "  capture v{}: {} region(s), {} grab(s)",
            cap.plan_version, cap.regions, cap.captures
        );
        if cap.failures > 0 {
            text.push_str(&format!(", {} failure(s), backoff {}ms", cap.failures, cap.backoff_ms));
        }
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(text, Style::default().fg(color))));
    }

    let list = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::LEFT | Borders::RIGHT | Borders::BOTTOM)
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(list, area);
}

fn draw_skills(f: &mut Frame, area: Rect, app: &App, skills: Vec<SkillSnapshot>) {
    let header = Row::new(vec!["skill", "started", "keys", "cast", "ok", "fail", "last"])
        .style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = skills
        .into_iter()
        .map(|s| {
            let c = &s.counters;
            let label = app
                .engine
                .catalogue()
                .skill(&s.skill_id)
                .map(|d| d.label().to_string())
                .unwrap_or_else(|| s.skill_id.clone());
            let last = match (&c.in_flight, c.last_stage) {
                (Some(_), _) => "in flight".to_string(),
                (None, Some(stage)) => stage.to_string(),
                (None, None) => "-".to_string(),
            };
            Row::new(vec![
                label,
                c.attempt_started.to_string(),
                c.key_sent_ok.to_string(),
                c.cast_started.to_string(),
                c.success.to_string(),
                c.fail.to_string(),
                last,
            ])
        })
        .collect();

    let widths = [
        Constraint::Min(12),
        Constraint::Length(8),
        Constraint::Length(6),
        Constraint::Length(6),
        Constraint::Length(6),
        Constraint::Length(6),
        Constraint::Length(14),
    ];
    let table = Table::new(rows, widths).header(header).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Skills ")
            .border_style(Style::default().fg(Color::Cyan)),
    );
    f.render_widget(table, area);
}

/// One-line summary of an engine event, or `None` for chatty ones.
pub fn describe(ev: &EngineEvent) -> Option<(String, Color)> {
    let line = match ev {
        EngineEvent::EngineStarted { preset_id, .. } => (format!("started {}", preset_id), Color::Green),
        EngineEvent::EngineStopped { reason, .. } => (format!("stopped: {}", reason), Color::Red),
        EngineEvent::EnginePaused { .. } => ("paused".into(), Color::Yellow),
        EngineEvent::EngineResumed { .. } => ("resumed".into(), Color::Green),
        EngineEvent::AttemptFinished { attempt_id, stage, reason, at_ms, .. } => {
            let color = if stage.as_str() == "SUCCESS" { Color::White } else { Color::Red };
            let why = reason.as_deref().map(|r| format!(" ({})", r)).unwrap_or_default();
            (format!("{:>7}ms {} {}{}", at_ms, attempt_id, stage, why), color)
        }
        EngineEvent::SkillSkipped { skill_id, reason, at_ms, .. } => {
            (format!("{:>7}ms skip {} ({})", at_ms, skill_id, reason), Color::DarkGray)
        }
        EngineEvent::Gateway { node_id, action, fired: true, at_ms, .. } => {
            (format!("{:>7}ms gateway {} -> {}", at_ms, node_id, action), Color::LightBlue)
        }
        EngineEvent::ModeSwitched { from, to, at_ms } => {
            (format!("{:>7}ms mode {} -> {}", at_ms, from.as_deref().unwrap_or("-"), to), Color::LightBlue)
        }
        EngineEvent::CaptureFailed { code, backoff_ms, .. } => {
            (format!("capture failed: {} (backoff {}ms)", code, backoff_ms), Color::Red)
        }
        _ => return None,
    };
    Some(line)
}

fn draw_feed(f: &mut Frame, area: Rect, app: &App) {
    let height = area.height.saturating_sub(2) as usize;
    let (title, lines): (&str, Vec<Line>) = if app.diagnostics.is_empty() {
        let described: Vec<(String, Color)> = app.events.iter().filter_map(describe).collect();
        let start = described.len().saturating_sub(height);
        let lines = described[start..]
            .iter()
            .map(|(text, color)| Line::from(Span::styled(text.clone(), Style::default().fg(*color))))
            .collect();
        (" Events ", lines)
    } else {
        let lines = app
            .diagnostics
            .iter()
            .map(|d| {
                let color = if d.starts_with("error") { Color::Red } else { Color::Yellow };
                Line::from(Span::styled(d.clone(), Style::default().fg(color)))
            })
            .collect();
        (" Diagnostics ", lines)
    };
    let panel = Paragraph::new(lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(title)
                .border_style(Style::default().fg(Color::Cyan)),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(panel, area);
}

fn draw_logs(f: &mut Frame, area: Rect, app: &App) {
    let visible_height = area.height.saturating_sub(2) as usize;
    let total = app.log_messages.len();
    let max_scroll = total.saturating_sub(visible_height);
    let scroll = app.log_scroll.min(max_scroll);
    let start = total.saturating_sub(visible_height + scroll);
    let end = total.saturating_sub(scroll);
    let log_lines: Vec<Line> = app.log_messages[start..end].iter().map(|m| parse_log_line(m)).collect();

    let log_panel = Paragraph::new(log_lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(" Logs ")
                .border_style(Style::default().fg(Color::Yellow)),
        )
        .wrap(Wrap { trim: false });
    f.render_widget(log_panel, area);
}

/// Parse a structured log line (level\x1fprefix\x1fcolor\x1ftimestamp\x1fmessage)
/// into a colored Line for TUI rendering.
fn parse_log_line(raw: &str) -> Line<'_> {
    let parts: Vec<&str> = raw.splitn(5, '\x1f').collect();
    if parts.len() < 5 {
        return Line::from(raw);
    }

    let level = parts[0];
    let prefix = parts[1];
    let color_idx: u8 = parts[2].parse().unwrap_or(0);
    let timestamp = parts[3];
    let message = parts[4];

    let line_color = match color_idx {
        1 => Color::DarkGray,  // COLOR_GRAY
        2 => Color::LightBlue, // COLOR_BLUE
        _ => Color::White,
    };

    let mut spans = vec![Span::styled(timestamp, Style::default().fg(Color::DarkGray)), Span::raw(" ")];

    // Only warn/error get a level tag
    match level {
        "ERROR" => spans.push(Span::styled("error ", Style::default().fg(Color::Red))),
        "WARN" => spans.push(Span::styled("warn ", Style::default().fg(Color::Yellow))),
        "DEBUG" | "TRACE" => spans.push(Span::styled("debug ", Style::default().fg(Color::DarkGray))),
        _ => {}
    }

    if !prefix.is_empty() {
        spans.push(Span::styled(prefix, Style::default().fg(line_color).add_modifier(Modifier::BOLD)));
        spans.push(Span::raw(" "));
    }
    spans.push(Span::styled(message, Style::default().fg(line_color)));

    Line::from(spans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_log_lines_are_split() {
        let line = parse_log_line("WARN\x1fstub\x1f1\x1f12:00:00\x1fkey 1 sent");
        let text: Vec<&str> = line.spans.iter().map(|s| s.content.as_ref()).collect();
        assert_eq!(text, vec!["12:00:00", " ", "warn ", "stub", " ", "key 1 sent"]);
        assert_eq!(line.spans[3].style.fg, Some(Color::DarkGray));

        let raw = parse_log_line("plain");
        assert_eq!(raw.spans.len(), 1);
    }

    #[test]
    fn banner_reflects_run_state() {
        let mut st = EngineStatus::default();
        assert_eq!(banner_text(&st).1, Color::Red);
        st.state = RunState::Paused;
        st.preset_id = Some("fire".into());
        st.mode_id = Some("single".into());
        st.step = Some(2);
        let (text, color) = banner_text(&st);
        assert_eq!(color, Color::Yellow);
        assert!(text.starts_with("PAUSED fire  mode single step 2"));
    }

    #[test]
    fn chatty_events_are_hidden() {
        let ev = EngineEvent::Gateway {
            node_id: "gw".into(),
            track_id: "g".into(),
            action: "end".into(),
            fired: false,
            reason: None,
            at_ms: 5,
        };
        assert!(describe(&ev).is_none());
        let ev = EngineEvent::EnginePaused { at_ms: 1 };
        assert_eq!(describe(&ev).map(|d| d.0), Some("paused".to_string()));
    }
}

use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

/// Yes/No modal. Starts on "No".
pub struct ConfirmDialog {
    pub message: String,
    pub selected: bool, // true = Yes
}

impl ConfirmDialog {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), selected: false }
    }

    pub fn toggle(&mut self) {
        self.selected = !self.selected;
    }

    pub fn render(&self, f: &mut Frame) {
        let width = (self.message.chars().count() as u16 + 6).max(36);
        let area = centered_rect(width, 8, f.area());
        f.render_widget(Clear, area);

        let block = Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow))
            .title(" Confirm ");
        let inner = block.inner(area);
        f.render_widget(block, area);

        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(1),
                Constraint::Length(1), // message
                Constraint::Length(1),
                Constraint::Length(1), // buttons
                Constraint::Length(1),
                Constraint::Length(1), // hint
            ])
            .split(inner);

        let msg = Paragraph::new(Line::from(Span::styled(&self.message, Style::default().fg(Color::White))))
            .alignment(Alignment::Center);
        f.render_widget(msg, rows[1]);

        let (yes_style, no_style) = button_styles(self.selected);
        let buttons = Line::from(vec![
            Span::styled("  [Yes]  ", yes_style),
            Span::raw("   "),
            Span::styled("  [No]  ", no_style),
        ]);
        f.render_widget(Paragraph::new(buttons).alignment(Alignment::Center), rows[3]);

        let hint = Paragraph::new(Line::from(Span::styled(
            "y/n, tab to switch, enter to choose",
            Style::default().fg(Color::DarkGray),
        )))
        .alignment(Alignment::Center);
        f.render_widget(hint, rows[5]);
    }
}

fn button_styles(yes: bool) -> (Style, Style) {
    let dim = Style::default().fg(Color::DarkGray);
    if yes {
        (Style::default().fg(Color::Black).bg(Color::Green).add_modifier(Modifier::BOLD), dim)
    } else {
        (dim, Style::default().fg(Color::Black).bg(Color::Red).add_modifier(Modifier::BOLD))
    }
}

/// Return a centered `Rect` of `width` columns and `height` rows inside `area`.
pub(crate) fn centered_rect(width: u16, height: u16, area: Rect) -> Rect {
    let x = area.x + area.width.saturating_sub(width) / 2;
    let y = area.y + area.height.saturating_sub(height) / 2;
    Rect::new(x, y, width.min(area.width), height.min(area.height))
}

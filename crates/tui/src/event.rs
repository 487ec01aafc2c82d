use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use cadence_core::platform::hotkey;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, MouseEventKind};
use ratatui::{backend::CrosstermBackend, Terminal};

use crate::ui;
use crate::App;

pub fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
    hotkey_flag: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    loop {
        if app.should_quit {
            return Ok(());
        }

        app.drain_logs();

        if hotkey::take_press(&hotkey_flag) {
            app.toggle_pause();
        }

        terminal.draw(|f| ui::draw(f, app))?;

        // 100ms poll keeps the banner and counters fresh
        if event::poll(Duration::from_millis(100))? {
            match event::read()? {
                Event::Key(key) => {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    if app.confirm.is_some() {
                        confirm_key(app, key);
                    } else {
                        main_key(app, key);
                    }
                }
                Event::Mouse(mouse) => match mouse.kind {
                    MouseEventKind::ScrollUp => app.scroll_log_up(3),
                    MouseEventKind::ScrollDown => app.scroll_log_down(3),
                    _ => {}
                },
                _ => {}
            }
        }
    }
}

fn main_key(app: &mut App, key: KeyEvent) {
    match key.code {
        KeyCode::Char('q') | KeyCode::Char('Q') => app.request_quit(),
        KeyCode::Up | KeyCode::Char('k') | KeyCode::Char('K') => app.move_up(),
        KeyCode::Down | KeyCode::Char('j') | KeyCode::Char('J') => app.move_down(),
        KeyCode::Enter | KeyCode::Char('s') | KeyCode::Char('S') => app.start_stop(),
        KeyCode::Char('p') | KeyCode::Char('P') | KeyCode::Char(' ') => app.toggle_pause(),
        KeyCode::Char('n') | KeyCode::Char('N') => app.step(),
        KeyCode::Char('v') | KeyCode::Char('V') => app.validate_selected(),
        KeyCode::Char('l') | KeyCode::Char('L') => app.toggle_log(),
        _ => {}
    }
}

fn confirm_key(app: &mut App, key: KeyEvent) {
    let Some(dialog) = app.confirm.as_mut() else { return };
    match key.code {
        KeyCode::Left | KeyCode::Right | KeyCode::Tab => dialog.toggle(),
        KeyCode::Char('y') | KeyCode::Char('Y') => {
            app.confirm = None;
            app.quit();
        }
        KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => app.confirm = None,
        KeyCode::Enter => {
            let yes = dialog.selected;
            app.confirm = None;
            if yes {
                app.quit();
            }
        }
        _ => {}
    }
}

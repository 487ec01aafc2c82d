use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use cadence_core::engine::{Engine, RunState};
use cadence_core::error::EngineError;
use cadence_core::loader::PresetEntry;
use cadence_core::settings::Settings;
use cadence_core::store::events::EngineEvent;

use crate::confirm::ConfirmDialog;

const EVENT_HISTORY: usize = 200;

pub struct App {
    pub engine: Arc<Engine>,
    pub presets: Vec<PresetEntry>,
    pub selected: usize,
    pub log_visible: bool,
    pub log_messages: Vec<String>,
    pub log_scroll: usize, // scroll offset from bottom (0 = latest)
    pub log_rx: mpsc::Receiver<String>,
    pub event_rx: mpsc::Receiver<EngineEvent>,
    /// Recent engine events, newest last.
    pub events: VecDeque<EngineEvent>,
    /// Findings of the last validation or failed start.
    pub diagnostics: Vec<String>,
    pub confirm: Option<ConfirmDialog>,
    pub should_quit: bool,
    settings: Settings,
    settings_path: PathBuf,
}

impl App {
    pub fn new(
        engine: Arc<Engine>,
        presets: Vec<PresetEntry>,
        log_rx: mpsc::Receiver<String>,
        settings: Settings,
        settings_path: PathBuf,
    ) -> Self {
        let selected = settings
            .last_preset
            .as_deref()
            .and_then(|name| presets.iter().position(|p| p.name == name))
            .unwrap_or(0);
        let event_rx = engine.subscribe();
        Self {
            engine,
            presets,
            selected,
            log_visible: true,
            log_messages: Vec::new(),
            log_scroll: 0,
            log_rx,
            event_rx,
            events: VecDeque::new(),
            diagnostics: Vec::new(),
            confirm: None,
            should_quit: false,
            settings,
            settings_path,
        }
    }

    pub fn drain_logs(&mut self) {
        while let Ok(msg) = self.log_rx.try_recv() {
            self.log_messages.push(msg);
        }
        while let Ok(ev) = self.event_rx.try_recv() {
            if self.events.len() >= EVENT_HISTORY {
                self.events.pop_front();
            }
            self.events.push_back(ev);
        }
    }

    pub fn scroll_log_up(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_add(n);
    }

    pub fn scroll_log_down(&mut self, n: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(n);
    }

    pub fn move_up(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
        }
    }

    pub fn move_down(&mut self) {
        if self.selected + 1 < self.presets.len() {
            self.selected += 1;
        }
    }

    pub fn selected_entry(&self) -> Option<&PresetEntry> {
        self.presets.get(self.selected)
    }

    pub fn toggle_log(&mut self) {
        self.log_visible = !self.log_visible;
    }

    /// Validate the selected preset without starting it.
    pub fn validate_selected(&mut self) {
        let Some(entry) = self.presets.get(self.selected) else { return };
        self.diagnostics.clear();
        match &entry.doc {
            Ok(doc) => {
                let report = self.engine.validate(doc);
                self.diagnostics = report.diagnostics.iter().map(|d| d.to_string()).collect();
                if report.is_ok() {
                    tracing::info!("{}: valid ({} finding(s))", entry.name, report.diagnostics.len());
                } else {
                    tracing::warn!("{}: {} error(s)", entry.name, report.diagnostics.errors().count());
                }
            }
            Err(e) => self.diagnostics.push(e.to_string()),
        }
    }

    /// Start the selected preset, or stop the running one.
    pub fn start_stop(&mut self) {
        if self.engine.is_running() {
            if let Err(e) = self.engine.stop("stopped from TUI") {
                tracing::warn!("stop: {}", e);
            }
            return;
        }

        let Some(entry) = self.presets.get(self.selected) else { return };
        self.diagnostics.clear();
        let doc = match &entry.doc {
            Ok(doc) => doc,
            Err(e) => {
                self.diagnostics.push(e.to_string());
                return;
            }
        };
        match self.engine.start(doc) {
            Ok(report) => {
                self.diagnostics = report.diagnostics.iter().map(|d| d.to_string()).collect();
                self.events.clear();
                self.settings.last_preset = Some(entry.name.clone());
                if let Err(e) = self.settings.save(&self.settings_path) {
                    tracing::warn!("failed to save settings: {}", e);
                }
            }
            Err(EngineError::Invalid(diags)) => {
                self.diagnostics = diags.iter().map(|d| d.to_string()).collect();
                tracing::error!("{} did not pass validation", entry.name);
            }
            Err(e) => tracing::error!("start {}: {}", entry.name, e),
        }
    }

    pub fn toggle_pause(&mut self) {
        match self.engine.toggle_pause() {
            Ok(RunState::Paused) => tracing::info!("paused"),
            Ok(_) => tracing::info!("resumed"),
            Err(e) => tracing::debug!("pause: {}", e),
        }
    }

    pub fn step(&mut self) {
        if let Err(e) = self.engine.step() {
            tracing::debug!("step: {}", e);
        }
    }

    /// Ask before quitting while a preset is running.
    pub fn request_quit(&mut self) {
        if self.engine.is_running() {
            self.confirm = Some(ConfirmDialog::new("Stop the engine and quit?"));
        } else {
            self.quit();
        }
    }

    pub fn quit(&mut self) {
        if self.engine.is_running() {
            let _ = self.engine.stop("quit");
        }
        self.should_quit = true;
    }
}

use std::sync::Arc;

use chrono_tz::Tz;
use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

use crate::{config::Config, models::Metric, store::HistoryStore};

/// Requests the user can make from the keyboard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Quit,
    ToggleRawLog,
    TogglePlot(Metric),
}

pub fn action_for_key(key: KeyEvent) -> Option<Action> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => Some(Action::Quit),
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Char('l') | KeyCode::Char('L') => Some(Action::ToggleRawLog),
        KeyCode::Char('1') => Some(Action::TogglePlot(Metric::Utilization)),
        KeyCode::Char('2') => Some(Action::TogglePlot(Metric::Memory)),
        KeyCode::Char('3') => Some(Action::TogglePlot(Metric::Power)),
        KeyCode::Char('4') => Some(Action::TogglePlot(Metric::Temperature)),
        KeyCode::Char('5') => Some(Action::TogglePlot(Metric::Cpu)),
        KeyCode::Char('6') => Some(Action::TogglePlot(Metric::SystemMemory)),
        _ => None,
    }
}

/// Presentation state. Reads the store, never writes sampled data.
pub struct App {
    store: Arc<HistoryStore>,
    pub gpu_index: u32,
    pub timezone: Tz,
    pub show_raw_log: bool,
    hidden: Vec<Metric>,
    pub frame_count: u64,
    pub should_quit: bool,
}

impl App {
    pub fn new(store: Arc<HistoryStore>, config: &Config) -> Self {
        App {
            store,
            gpu_index: config.gpu_index,
            timezone: config.timezone,
            show_raw_log: true,
            hidden: Vec::new(),
            frame_count: 0,
            should_quit: false,
        }
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn apply(&mut self, action: Action) {
        match action {
            Action::Quit => self.should_quit = true,
            Action::ToggleRawLog => self.show_raw_log = !self.show_raw_log,
            Action::TogglePlot(metric) => {
                if let Some(i) = self.hidden.iter().position(|m| *m == metric) {
                    self.hidden.remove(i);
                } else {
                    self.hidden.push(metric);
                }
            }
        }
    }

    pub fn handle_key(&mut self, key: KeyEvent) {
        if let Some(action) = action_for_key(key) {
            self.apply(action);
        }
    }

    /// Visible charts in display order.
    pub fn visible_metrics(&self) -> Vec<Metric> {
        Metric::ALL
            .into_iter()
            .filter(|m| !self.hidden.contains(m))
            .collect()
    }

    /// Increment frame counter
    pub fn tick(&mut self) {
        self.frame_count += 1;
    }
}

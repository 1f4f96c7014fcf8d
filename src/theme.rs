use ratatui::style::{Color, Modifier, Style};

use crate::models::{LogSource, Metric};

// Muted terminal palette
pub const NEON_GREEN: Color = Color::Rgb(0, 160, 50);
pub const NEON_CYAN: Color = Color::Rgb(0, 150, 160);
pub const NEON_MAGENTA: Color = Color::Rgb(160, 60, 160);
pub const NEON_YELLOW: Color = Color::Rgb(180, 160, 60);
pub const NEON_RED: Color = Color::Rgb(180, 60, 60);
pub const DARK_BG: Color = Color::Rgb(15, 15, 25);
pub const MATRIX_GREEN: Color = Color::Rgb(30, 130, 30);
pub const CYBER_BLUE: Color = Color::Rgb(60, 130, 180);

pub fn metric_color(metric: Metric) -> Color {
    match metric {
        Metric::Utilization => NEON_GREEN,
        Metric::Memory => NEON_MAGENTA,
        Metric::Power => NEON_YELLOW,
        Metric::Temperature => NEON_RED,
        Metric::Cpu => NEON_CYAN,
        Metric::SystemMemory => CYBER_BLUE,
    }
}

pub fn log_style(source: LogSource) -> Style {
    match source {
        LogSource::Stdout => Style::default().fg(Color::Gray),
        LogSource::Stderr => Style::default().fg(NEON_RED).add_modifier(Modifier::BOLD),
        LogSource::Monitor => Style::default().fg(NEON_YELLOW),
    }
}

pub fn border() -> Style {
    Style::default().fg(MATRIX_GREEN)
}

pub fn title(color: Color) -> Style {
    Style::default().fg(color).add_modifier(Modifier::BOLD)
}

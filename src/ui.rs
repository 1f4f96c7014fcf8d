use chrono_tz::Tz;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols::Marker,
    text::{Line, Span},
    widgets::{Axis, Block, BorderType, Borders, Cell, Chart, Dataset, GraphType, Paragraph, Row, Table},
    Frame,
};

use crate::app::App;
use crate::host::HostInfo;
use crate::models::{GpuIdentity, Metric, Sample, TelemetryStatus, NOT_AVAILABLE};
use crate::theme::*;

/// Renders the main UI: info panel, charts, raw log and process table
pub fn render(frame: &mut Frame, app: &App) {
    let main_block = Block::default().style(Style::default().bg(DARK_BG));
    frame.render_widget(main_block, frame.area());

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5),      // Info panel
            Constraint::Min(8),         // Charts
            Constraint::Percentage(30), // Raw log + processes
            Constraint::Length(1),      // Key help
        ])
        .split(frame.area());

    render_header(frame, chunks[0], app);
    render_charts(frame, chunks[1], app);
    render_bottom_row(frame, chunks[2], app);
    render_footer(frame, chunks[3]);
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let store = app.store();
    let identity_line = match store.identity() {
        Some(identity) => Line::from(Span::styled(identity.to_string(), title(CYBER_BLUE))),
        None => Line::from(Span::styled(
            "Querying GPU info...",
            Style::default().fg(Color::DarkGray),
        )),
    };

    let host_line = match store.host() {
        Some(host) => Line::from(Span::styled(host.to_string(), Style::default().fg(Color::Gray))),
        None => Line::from(Span::styled(
            "Querying system info...",
            Style::default().fg(Color::DarkGray),
        )),
    };

    let status_line = match store.status() {
        TelemetryStatus::Starting => Line::from(Span::styled(
            "Waiting for telemetry...",
            Style::default().fg(NEON_CYAN),
        )),
        TelemetryStatus::Streaming => Line::from(vec![
            Span::styled("● streaming", Style::default().fg(NEON_GREEN)),
            Span::styled(
                format!("  │ parse errors: {}", store.parse_errors()),
                Style::default().fg(Color::DarkGray),
            ),
        ]),
        TelemetryStatus::Restarting { attempt, max } => Line::from(Span::styled(
            format!("dmon restarting (failure {attempt}/{max})..."),
            title(NEON_YELLOW),
        )),
        TelemetryStatus::Failed { reason } => Line::from(Span::styled(
            format!("TELEMETRY STOPPED: {reason}"),
            Style::default()
                .fg(Color::White)
                .bg(NEON_RED)
                .add_modifier(Modifier::BOLD),
        )),
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(border())
        .title(Span::styled(format!(" GPU-{} ", app.gpu_index), title(NEON_GREEN)));

    let panel = Paragraph::new(vec![identity_line, host_line, status_line])
        .block(block)
        .alignment(Alignment::Center)
        .style(Style::default().bg(DARK_BG));
    frame.render_widget(panel, area);
}

fn render_charts(frame: &mut Frame, area: Rect, app: &App) {
    let metrics = app.visible_metrics();
    if metrics.is_empty() {
        return;
    }

    let (rows, cols) = grid_shape(metrics.len());
    let row_areas = Layout::default()
        .direction(Direction::Vertical)
        .constraints(vec![Constraint::Ratio(1, rows as u32); rows])
        .split(area);

    for (row_area, row_metrics) in row_areas.iter().zip(metrics.chunks(cols)) {
        let cells = Layout::default()
            .direction(Direction::Horizontal)
            .constraints(vec![Constraint::Ratio(1, cols as u32); cols])
            .split(*row_area);

        for (metric, cell) in row_metrics.iter().zip(cells.iter()) {
            render_chart(frame, *cell, app, *metric);
        }
    }
}

/// Rows and columns for `count` charts: one row up to three, 2x2 for four,
/// then rows of three.
fn grid_shape(count: usize) -> (usize, usize) {
    match count {
        0 => (0, 0),
        1..=3 => (1, count),
        4 => (2, 2),
        _ => (count.div_ceil(3), 3),
    }
}

fn render_chart(frame: &mut Frame, area: Rect, app: &App, metric: Metric) {
    let store = app.store();
    let samples = store.history(metric);
    let identity = store.identity();
    let color = metric_color(metric);
    let chart_title = if metric.is_gpu() {
        format!(" GPU-{} {} ", app.gpu_index, metric.title())
    } else {
        format!(" {} ", metric.title())
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(border())
        .title(Span::styled(chart_title, title(color)))
        .style(Style::default().bg(DARK_BG));

    if samples.is_empty() {
        let waiting = Paragraph::new("Waiting for data...")
            .alignment(Alignment::Center)
            .style(Style::default().fg(Color::DarkGray))
            .block(block);
        frame.render_widget(waiting, area);
        return;
    }

    let points = chart_points(&samples);
    let label = samples
        .last()
        .and_then(|s| s.value)
        .map(|v| format_value(metric, v, identity, store.host()))
        .unwrap_or_else(|| NOT_AVAILABLE.to_string());
    let upper = y_upper_bound(metric, &samples, identity);
    let x_max = (samples.len().saturating_sub(1)).max(1) as f64;

    let dataset = Dataset::default()
        .name(label)
        .marker(Marker::Braille)
        .graph_type(GraphType::Line)
        .style(Style::default().fg(color))
        .data(&points);

    let chart = Chart::new(vec![dataset])
        .block(block)
        .x_axis(
            Axis::default()
                .style(Style::default().fg(Color::DarkGray))
                .bounds([0.0, x_max])
                .labels(time_labels(&samples, app.timezone)),
        )
        .y_axis(
            Axis::default()
                .style(Style::default().fg(Color::DarkGray))
                .bounds([0.0, upper])
                .labels(vec![Span::raw("0"), Span::raw(format!("{upper:.0}"))]),
        );
    frame.render_widget(chart, area);
}

fn render_bottom_row(frame: &mut Frame, area: Rect, app: &App) {
    let constraints = if app.show_raw_log {
        vec![Constraint::Percentage(50), Constraint::Percentage(50)]
    } else {
        vec![Constraint::Percentage(100)]
    };
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(constraints)
        .split(area);

    if app.show_raw_log {
        render_raw_log(frame, chunks[0], app);
        render_processes(frame, chunks[1], app);
    } else {
        render_processes(frame, chunks[0], app);
    }
}

fn render_raw_log(frame: &mut Frame, area: Rect, app: &App) {
    let entries = app.store().raw_log();
    let visible = area.height.saturating_sub(2) as usize;
    let lines: Vec<Line> = entries
        .iter()
        .skip(entries.len().saturating_sub(visible))
        .map(|entry| {
            Line::from(vec![
                Span::styled(
                    format!("{} ", entry.at.with_timezone(&app.timezone).format("%H:%M:%S")),
                    Style::default().fg(Color::DarkGray),
                ),
                Span::styled(entry.text.clone(), log_style(entry.source)),
            ])
        })
        .collect();

    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(border())
        .title(Span::styled(
            format!(" GPU-{} Raw dmon Output (L to Toggle) ", app.gpu_index),
            title(NEON_CYAN),
        ));
    frame.render_widget(Paragraph::new(lines).block(block), area);
}

fn render_processes(frame: &mut Frame, area: Rect, app: &App) {
    let store = app.store();
    let processes = store.processes();

    let block = Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(border())
        .title(Span::styled(" Processes ", title(NEON_MAGENTA)));

    if processes.is_empty() {
        let text = match store.last_process_error() {
            Some(err) if !store.processes_polled() => format!("Process query failed: {err}"),
            _ => "No running processes".to_string(),
        };
        let empty = Paragraph::new(Span::styled(
            text,
            Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
        ))
        .block(block);
        frame.render_widget(empty, area);
        return;
    }

    let rows = processes.iter().map(|p| {
        Row::new(vec![
            Cell::from(p.pid.to_string()),
            Cell::from(p.name.clone()),
            Cell::from(
                p.used_memory_mib
                    .map(|mib| format!("{mib} MiB"))
                    .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            ),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Length(8),
            Constraint::Min(10),
            Constraint::Length(12),
        ],
    )
    .header(Row::new(vec!["PID", "Name", "VRAM"]).style(title(NEON_CYAN)))
    .block(block);
    frame.render_widget(table, area);
}

fn render_footer(frame: &mut Frame, area: Rect) {
    let help = Line::from(vec![
        Span::styled(" q ", title(NEON_GREEN)),
        Span::raw("Quit  "),
        Span::styled(" l ", title(NEON_GREEN)),
        Span::raw("Toggle Log  "),
        Span::styled(" 1-6 ", title(NEON_GREEN)),
        Span::raw("Util / Mem / Power / Temp / CPU / Sys Mem"),
    ]);
    frame.render_widget(
        Paragraph::new(help).style(Style::default().fg(Color::DarkGray).bg(DARK_BG)),
        area,
    );
}

/// Chart coordinates; unavailable samples leave a gap.
fn chart_points(samples: &[Sample]) -> Vec<(f64, f64)> {
    samples
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.value.map(|v| (i as f64, v)))
        .collect()
}

/// First and last sample time in the display zone.
fn time_labels(samples: &[Sample], tz: Tz) -> Vec<Span<'static>> {
    let fmt = |s: &Sample| Span::raw(s.at.with_timezone(&tz).format("%H:%M:%S").to_string());
    match (samples.first(), samples.last()) {
        (Some(first), Some(last)) if samples.len() > 1 => vec![fmt(first), fmt(last)],
        (Some(only), _) => vec![fmt(only)],
        _ => Vec::new(),
    }
}

fn y_upper_bound(metric: Metric, samples: &[Sample], identity: Option<&GpuIdentity>) -> f64 {
    match metric {
        Metric::Utilization | Metric::Memory | Metric::Cpu | Metric::SystemMemory => 100.0,
        Metric::Temperature => (peak(samples) * 1.1).max(100.0),
        Metric::Power => {
            if let Some(limit) = identity.and_then(|i| i.max_power_watts) {
                return limit * 1.1;
            }
            let highest = peak(samples);
            if highest > 0.0 {
                highest * 1.1
            } else {
                100.0
            }
        }
    }
}

fn peak(samples: &[Sample]) -> f64 {
    samples
        .iter()
        .filter_map(|s| s.value)
        .fold(0.0_f64, f64::max)
}

/// Human readable amount of memory given in MiB.
fn format_mib(mib: f64) -> String {
    if mib >= 1024.0 {
        format!("{:.2} GiB", mib / 1024.0)
    } else {
        format!("{mib:.2} MiB")
    }
}

/// Label for the latest value of a chart.
pub fn format_value(
    metric: Metric,
    value: f64,
    identity: Option<&GpuIdentity>,
    host: Option<&HostInfo>,
) -> String {
    match metric {
        Metric::Utilization | Metric::Cpu => format!("{value:.1}%"),
        Metric::Memory => match identity.and_then(|i| i.total_memory_mib) {
            Some(total) => format!("{value:.1}% - {}", format_mib(total as f64 * value / 100.0)),
            None => format!("{value:.1}%"),
        },
        Metric::Power => format!("{value:.1} W"),
        Metric::Temperature => format!("{value:.0} °C"),
        Metric::SystemMemory => match host.map(|h| h.total_memory_bytes).filter(|t| *t > 0) {
            Some(total) => format!("{value:.1}% - {:.2} GB", total as f64 * value / 100.0 / 1e9),
            None => format!("{value:.1}%"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample(secs: i64, value: Option<f64>) -> Sample {
        Sample {
            at: Utc.timestamp_opt(secs, 0).unwrap(),
            value,
        }
    }

    #[test]
    fn gaps_are_skipped_in_points() {
        let samples = [sample(0, Some(1.0)), sample(1, None), sample(2, Some(3.0))];
        assert_eq!(chart_points(&samples), vec![(0.0, 1.0), (2.0, 3.0)]);
    }

    #[test]
    fn labels_use_display_zone() {
        let samples = [sample(0, Some(1.0)), sample(3600, Some(2.0))];
        let labels = time_labels(&samples, chrono_tz::Asia::Tokyo);
        assert_eq!(labels[0].content, "09:00:00");
        assert_eq!(labels[1].content, "10:00:00");
    }

    #[test]
    fn memory_label_includes_absolute_amount() {
        let identity = GpuIdentity {
            total_memory_mib: Some(24576),
            ..GpuIdentity::default()
        };
        assert_eq!(
            format_value(Metric::Memory, 50.0, Some(&identity), None),
            "50.0% - 12.00 GiB"
        );
        assert_eq!(format_value(Metric::Memory, 50.0, None, None), "50.0%");
        assert_eq!(format_value(Metric::Power, 120.5, None, None), "120.5 W");
    }

    #[test]
    fn host_and_temperature_labels() {
        let host = HostInfo {
            total_memory_bytes: 32_000_000_000,
            ..HostInfo::default()
        };
        assert_eq!(format_value(Metric::Temperature, 61.4, None, None), "61 °C");
        assert_eq!(format_value(Metric::Cpu, 12.34, None, None), "12.3%");
        assert_eq!(
            format_value(Metric::SystemMemory, 25.0, None, Some(&host)),
            "25.0% - 8.00 GB"
        );
        assert_eq!(format_value(Metric::SystemMemory, 25.0, None, None), "25.0%");
    }

    #[test]
    fn temperature_axis_grows_past_hot_readings() {
        let cool = [sample(0, Some(60.0))];
        let hot = [sample(0, Some(100.0))];
        assert_eq!(y_upper_bound(Metric::Temperature, &cool, None), 100.0);
        assert!((y_upper_bound(Metric::Temperature, &hot, None) - 110.0).abs() < 1e-9);
    }

    #[test]
    fn grid_matches_visible_chart_count() {
        assert_eq!(grid_shape(1), (1, 1));
        assert_eq!(grid_shape(3), (1, 3));
        assert_eq!(grid_shape(4), (2, 2));
        assert_eq!(grid_shape(5), (2, 3));
        assert_eq!(grid_shape(6), (2, 3));
    }

    #[test]
    fn power_axis_scales_from_limit_or_peak() {
        let samples = [sample(0, Some(200.0)), sample(1, None)];
        let identity = GpuIdentity {
            max_power_watts: Some(450.0),
            ..GpuIdentity::default()
        };
        assert!((y_upper_bound(Metric::Power, &samples, Some(&identity)) - 495.0).abs() < 1e-9);
        assert!((y_upper_bound(Metric::Power, &samples, None) - 220.0).abs() < 1e-9);
        assert_eq!(y_upper_bound(Metric::Utilization, &samples, None), 100.0);
    }
}

use crate::app::AppState;
use crate::model::State;
use crate::rows::{BuildRow, Column, TabularRow};
use crate::text;
use chrono::{DateTime, Utc};
use ratatui::layout::{Constraint, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Span;
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Frame;
use std::collections::BTreeMap;
use unicode_width::UnicodeWidthStr;

const WIDE_COLUMNS: &[Column] = &[
    Column::Account,
    Column::State,
    Column::Type,
    Column::Id,
    Column::Name,
    Column::Started,
    Column::Finished,
    Column::Updated,
];
const NARROW_COLUMNS: &[Column] = &[Column::State, Column::Id, Column::Name, Column::Updated];

fn state_color(state: State) -> Color {
    match state {
        State::Passed => Color::Green,
        State::Failed => Color::Red,
        State::Running => Color::Yellow,
        State::Pending => Color::Blue,
        State::Canceled | State::Skipped | State::Manual | State::Unknown => Color::DarkGray,
    }
}

/// Width of each column: the widest of its title and its values. `Column::Name` takes whatever
/// the others leave.
fn column_widths(
    columns: &[Column],
    values: &[BTreeMap<Column, String>],
    total: usize,
) -> Vec<Constraint> {
    let widths: Vec<usize> = columns
        .iter()
        .map(|column| {
            values
                .iter()
                .filter_map(|row| row.get(column))
                .map(|value| UnicodeWidthStr::width(value.as_str()))
                .chain(std::iter::once(column.header().len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let fixed: usize = columns
        .iter()
        .zip(&widths)
        .filter(|(column, _)| **column != Column::Name)
        .map(|(_, width)| width + 1)
        .sum();
    let name_width = total.saturating_sub(fixed).max(Column::Name.header().len());

    columns
        .iter()
        .zip(widths)
        .map(|(column, width)| {
            let width = if *column == Column::Name {
                width.min(name_width)
            } else {
                width
            };
            Constraint::Length(u16::try_from(width).unwrap_or(u16::MAX))
        })
        .collect()
}

fn build_row(row: &BuildRow, columns: &[Column], now: DateTime<Utc>, name_width: usize) -> Row<'static> {
    let values = row.tabular(now);
    let cells = columns.iter().map(|column| {
        let value = values.get(column).cloned().unwrap_or_default();
        match column {
            Column::State => Cell::from(Span::styled(
                value,
                Style::default().fg(state_color(row.state)),
            )),
            Column::Name => Cell::from(text::truncate(&value, name_width)),
            Column::Type | Column::Account | Column::Started | Column::Finished | Column::Updated => {
                Cell::from(Span::styled(value, Style::default().fg(Color::DarkGray)))
            }
            _ => Cell::from(value),
        }
    });
    Row::new(cells)
}

pub fn render(f: &mut Frame, area: Rect, state: &AppState) {
    if state.rows.is_empty() {
        let msg = if state.loading {
            "Loading builds…"
        } else {
            "No builds found"
        };
        let para = Paragraph::new(msg)
            .style(Style::default().fg(Color::DarkGray))
            .block(Block::default().borders(Borders::NONE));
        f.render_widget(para, area);
        return;
    }

    let narrow = area.width < crate::app::NARROW_WIDTH_THRESHOLD;
    let columns = if narrow { NARROW_COLUMNS } else { WIDE_COLUMNS };
    let now = Utc::now();

    let values: Vec<BTreeMap<Column, String>> =
        state.rows.iter().map(|row| row.tabular(now)).collect();
    let widths = column_widths(columns, &values, usize::from(area.width));
    let name_width = columns
        .iter()
        .zip(&widths)
        .find(|(column, _)| **column == Column::Name)
        .map_or(0, |(_, constraint)| match constraint {
            Constraint::Length(w) => usize::from(*w),
            _ => 0,
        });

    let header = Row::new(columns.iter().map(|column| Cell::from(column.header()))).style(
        Style::default()
            .fg(Color::Cyan)
            .add_modifier(Modifier::BOLD),
    );

    let rows = state.rows.iter().enumerate().map(|(i, row)| {
        let line = build_row(row, columns, now, name_width);
        if i == state.cursor {
            line.style(Style::default().add_modifier(Modifier::REVERSED))
        } else {
            line
        }
    });

    let table = Table::new(rows, widths)
        .header(header)
        .column_spacing(1)
        .block(Block::default().borders(Borders::NONE));
    f.render_widget(table, area);
}

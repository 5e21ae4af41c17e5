use std::fmt::Write as _;

use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;

use crate::application::session::ViewSnapshot;
use crate::live::Row;

const TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

const KIND_WIDTH: usize = 11;
const NAMESPACE_WIDTH: usize = 18;
const NAME_WIDTH: usize = 40;
const SIZE_WIDTH: usize = 10;

/// Byte count in IEC units with one decimal above a kibibyte.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

fn timestamp(value: Option<OffsetDateTime>) -> String {
    value
        .and_then(|at| at.format(TIMESTAMP).ok())
        .unwrap_or_else(|| "-".to_string())
}

/// Cut `value` to `width` characters, marking the cut with `~`.
fn fit(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut cut: String = value.chars().take(width.saturating_sub(1)).collect();
    cut.push('~');
    cut
}

fn header() -> String {
    format!(
        "{:<KIND_WIDTH$} {:<NAMESPACE_WIDTH$} {:<NAME_WIDTH$} {:>SIZE_WIDTH$}  LAST EVENT",
        "KIND", "NAMESPACE", "NAME", "SIZE"
    )
}

fn line(row: &Row) -> String {
    let marker = if row.changed { " *" } else { "" };
    format!(
        "{:<KIND_WIDTH$} {:<NAMESPACE_WIDTH$} {:<NAME_WIDTH$} {:>SIZE_WIDTH$}  {}{marker}",
        row.kind.label(),
        fit(&row.namespace, NAMESPACE_WIDTH),
        fit(&row.name, NAME_WIDTH),
        human_size(row.total_size),
        timestamp(row.last_event),
    )
}

/// One-line summary of the session state.
pub fn status_line(snapshot: &ViewSnapshot) -> String {
    let namespace = if snapshot.namespace.is_empty() {
        "all"
    } else {
        snapshot.namespace.as_str()
    };
    let mut status = format!(
        "[{}] namespace={namespace} sort={} rows={}/{} generation={}",
        snapshot.status.as_str(),
        snapshot.sort,
        snapshot.rows.len(),
        snapshot.visible,
        snapshot.generation,
    );
    if snapshot.loading {
        status.push_str(" loading");
    }
    if let Some(error) = &snapshot.last_error {
        let _ = write!(status, " error=\"{error}\"");
    }
    status
}

/// Status line, header and one line per row.
pub fn render(snapshot: &ViewSnapshot) -> String {
    let mut out = status_line(snapshot);
    out.push('\n');
    if snapshot.rows.is_empty() {
        out.push_str(if snapshot.loading {
            "loading...\n"
        } else {
            "no data yet\n"
        });
        return out;
    }

    out.push_str(&header());
    out.push('\n');
    for row in &snapshot.rows {
        out.push_str(&line(row));
        out.push('\n');
    }
    out
}

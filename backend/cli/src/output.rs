//! Terminal output: status notes and the module table.

use modhost_plugins::{ModuleState, ModuleSummary, StartReport};

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";

pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";

/// Check if the terminal supports color output.
pub fn supports_color() -> bool {
    std::env::var("NO_COLOR").is_err()
        && (std::env::var("COLORTERM").is_ok()
            || std::env::var("TERM").map(|t| t != "dumb").unwrap_or(false))
}

/// Strip ANSI escape codes from a string.
pub fn strip_ansi(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn paint(color: &str, text: &str) -> String {
    if supports_color() {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

pub fn note_info(msg: &str) {
    if supports_color() {
        println!("{CYAN}{BOLD}i{RESET} {msg}");
    } else {
        println!("INFO: {msg}");
    }
}

pub fn note_warn(msg: &str) {
    if supports_color() {
        println!("{YELLOW}{BOLD}!{RESET} {msg}");
    } else {
        println!("WARN: {msg}");
    }
}

pub fn note_success(msg: &str) {
    if supports_color() {
        println!("{GREEN}{BOLD}✓{RESET} {msg}");
    } else {
        println!("OK: {msg}");
    }
}

pub enum Align {
    Left,
    Right,
}

pub struct Column {
    pub header: &'static str,
    pub align: Align,
}

impl Column {
    pub fn left(header: &'static str) -> Self {
        Self { header, align: Align::Left }
    }
    pub fn right(header: &'static str) -> Self {
        Self { header, align: Align::Right }
    }
}

pub fn render_table(columns: &[Column], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.header.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(strip_ansi(cell).chars().count());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(col, w)| pad_cell(col.header, *w, &col.align))
        .collect();
    out.push_str(&format!("  {}\n", header.join("  ").trim_end()));
    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&format!("  {}\n", sep.join("  ")));

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .zip(&widths)
            .enumerate()
            .map(|(i, (col, w))| pad_cell(row.get(i).map(String::as_str).unwrap_or(""), *w, &col.align))
            .collect();
        out.push_str(&format!("  {}\n", cells.join("  ").trim_end()));
    }
    out
}

fn pad_cell(s: &str, width: usize, align: &Align) -> String {
    let pad = " ".repeat(width.saturating_sub(strip_ansi(s).chars().count()));
    match align {
        Align::Left => format!("{s}{pad}"),
        Align::Right => format!("{pad}{s}"),
    }
}

fn state_cell(summary: &ModuleSummary) -> String {
    let label = summary.state.to_string();
    match summary.state {
        ModuleState::Started => paint(GREEN, &label),
        ModuleState::Failed => paint(RED, &label),
        ModuleState::Loaded if !summary.enabled => paint(DIM, "disabled"),
        _ => label,
    }
}

/// One row per module, in load order.
pub fn module_table(modules: &[ModuleSummary]) -> String {
    let columns = [
        Column::left("ID"),
        Column::left("VERSION"),
        Column::left("STATE"),
        Column::right("RES"),
        Column::left("REQUIRES"),
        Column::left("DETAIL"),
    ];
    let rows: Vec<Vec<String>> = modules
        .iter()
        .map(|m| {
            vec![
                m.id.clone(),
                m.version.clone().unwrap_or_else(|| "-".into()),
                state_cell(m),
                m.resources.to_string(),
                if m.required.is_empty() { "-".into() } else { m.required.join(",") },
                m.failure.clone().unwrap_or_default(),
            ]
        })
        .collect();
    render_table(&columns, &rows)
}

pub fn print_start_report(report: &StartReport) {
    if report.is_clean() {
        note_success(&format!(
            "{} module(s) started, {} skipped",
            report.started.len(),
            report.skipped.len()
        ));
        return;
    }
    note_warn(&format!(
        "{} started, {} failed, {} skipped",
        report.started.len(),
        report.failed.len(),
        report.skipped.len()
    ));
    for (id, reason) in &report.failed {
        println!("    {id}: {reason}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, state: ModuleState) -> ModuleSummary {
        ModuleSummary {
            id: id.into(),
            name: id.into(),
            version: Some("1.0.0".into()),
            url: None,
            state,
            enabled: true,
            resources: 2,
            required: vec!["core".into()],
            optional: vec![],
            tags: vec![],
            failure: None,
        }
    }

    #[test]
    fn strips_ansi() {
        assert_eq!(strip_ansi(&format!("{GREEN}hello{RESET}")), "hello");
    }

    #[test]
    fn table_aligns_colored_cells() {
        let cols = [Column::left("Name"), Column::right("Count")];
        let rows = vec![
            vec![format!("{RED}Alice{RESET}"), "42".to_string()],
            vec!["Bob".to_string(), "7".to_string()],
        ];
        let table = render_table(&cols, &rows);
        let lines: Vec<String> = table.lines().map(strip_ansi).collect();
        assert_eq!(lines[2], "  Alice     42");
        assert_eq!(lines[3], "  Bob        7");
    }

    #[test]
    fn module_table_lists_every_module() {
        let mut broken = summary("broken", ModuleState::Failed);
        broken.failure = Some("start exploded".into());
        let table = strip_ansi(&module_table(&[summary("greeter", ModuleState::Started), broken]));
        assert!(table.contains("greeter"));
        assert!(table.contains("started"));
        assert!(table.contains("start exploded"));
    }
}

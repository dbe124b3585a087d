use infoseek_core::{AgentRecord, FinalResult, TimelineEntry};
use std::fmt::Write;

const PREVIEW_CHARS: usize = 80;

pub fn timeline_line(entry: &TimelineEntry) -> String {
    format!(
        "[{}] {:<24} {:<12} {}",
        entry.timestamp.format("%H:%M:%S"),
        entry.agent,
        entry.kind.as_str(),
        entry.message
    )
}

pub fn agent_table(agents: &[AgentRecord]) -> String {
    let width = agents
        .iter()
        .map(|record| record.name.len())
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    for record in agents {
        let _ = write!(
            out,
            "{:<width$}  {:<12}  {}",
            record.name,
            record.status.as_str(),
            record.message
        );
        if let Some(result) = &record.result {
            let _ = write!(out, " => {}", truncate(result, PREVIEW_CHARS));
        }
        out.push('\n');
    }
    out
}

pub fn final_result(result: &FinalResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", result.answer.trim());
    if result.sources.is_empty() {
        return out;
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Sources:");
    for (idx, source) in result.sources.iter().enumerate() {
        let title = if source.title.trim().is_empty() {
            "untitled"
        } else {
            source.title.trim()
        };
        match &source.url {
            Some(url) => {
                let _ = writeln!(out, "{:>3}. {title} <{url}>", idx + 1);
            }
            None => {
                let _ = writeln!(out, "{:>3}. {title}", idx + 1);
            }
        }
    }
    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

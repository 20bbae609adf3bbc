//! SubRip subtitle rendering.

use std::fmt::Write;
use std::time::Duration;

/// Maximum characters per subtitle line.
pub const LINE_MAX_CHARS: usize = 45;

/// One timed subtitle, times in seconds relative to the segment.
#[derive(Debug, Clone, Copy)]
pub struct Cue<'a> {
    pub start: f64,
    pub end: f64,
    pub text: &'a str,
}

/// Format a timestamp as `HH:MM:SS,mmm`.
fn timestamp(at: Duration) -> String {
    let total_ms = at.as_millis();
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_ms / 3_600_000,
        (total_ms / 60_000) % 60,
        (total_ms / 1000) % 60,
        total_ms % 1000
    )
}

fn offset_by(offset: Duration, secs: f64) -> Duration {
    offset + Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or_default()
}

/// Split text into lines no longer than [`LINE_MAX_CHARS`] where possible.
///
/// Words longer than a line are kept whole on their own line.
pub fn wrap_words(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > LINE_MAX_CHARS {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Render cues as an SRT document, shifting every cue by `offset`.
///
/// Cues without text are skipped. Returns an empty string when nothing is
/// left to show.
pub fn render(cues: &[Cue<'_>], offset: Duration) -> String {
    let mut out = String::new();
    let mut index = 0;
    for cue in cues {
        let lines = wrap_words(cue.text);
        if lines.is_empty() {
            continue;
        }
        index += 1;
        let _ = writeln!(out, "{}", index);
        let _ = writeln!(
            out,
            "{} --> {}",
            timestamp(offset_by(offset, cue.start)),
            timestamp(offset_by(offset, cue.end))
        );
        for line in lines {
            let _ = writeln!(out, "{}", line);
        }
        out.push('\n');
    }
    out
}

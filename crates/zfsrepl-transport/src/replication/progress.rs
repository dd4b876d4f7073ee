//! Progress reported by `zfs send -P -v` on stderr
//!
//! Units are bytes. A total of 0 means no size estimate has been seen.

/// One parsed stderr line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressLine {
    /// Estimated stream size
    Total(u64),
    /// Bytes sent so far
    Current(u64),
}

/// Parse a line of `zfs send -P -v` stderr
///
/// Recognized forms:
/// - `size\t<bytes>`
/// - `full\t<snapshot>\t<bytes>`
/// - `incremental\t<base>\t<snapshot>\t<bytes>`
/// - `<HH:MM:SS>\t<bytes>\t<snapshot>`
pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let fields: Vec<&str> = line.trim_end().split('\t').collect();

    match fields.as_slice() {
        ["size", bytes] | ["full", _, bytes] | ["incremental", _, _, bytes] => {
            bytes.parse().ok().map(ProgressLine::Total)
        }
        [time, bytes, _] if is_timestamp(time) => bytes.parse().ok().map(ProgressLine::Current),
        _ => None,
    }
}

fn is_timestamp(field: &str) -> bool {
    let parts: Vec<&str> = field.split(':').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
}

/// Running progress of one transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Bytes sent so far
    pub current: u64,
    /// Estimated total, 0 when unknown
    pub total: u64,
}

impl Progress {
    /// Apply a parsed line; returns `true` when `current` changed
    pub fn apply(&mut self, line: ProgressLine) -> bool {
        match line {
            ProgressLine::Total(total) => {
                self.total = total;
                false
            }
            ProgressLine::Current(current) => {
                self.current = current;
                true
            }
        }
    }
}

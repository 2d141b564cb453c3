use std::fmt;

/// IMAP sequence set covered by one work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceRange {
    /// The whole folder, `1:*`
    All,
    /// Inclusive span
    Span { start: u32, end: u32 },
}

impl fmt::Display for SequenceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceRange::All => write!(f, "1:*"),
            SequenceRange::Span { start, end } => write!(f, "{}:{}", start, end),
        }
    }
}

/// One (folder, range) pair handled by a single worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    pub folder: String,
    pub range: SequenceRange,
    pub total_in_folder: u32,
}

/// Split a folder of `total` messages into ranges of at most `chunk`.
/// An empty folder yields nothing; a folder that fits in one chunk yields
/// a single `1:*` unit.
pub fn partition(folder: &str, total: u32, chunk: u32) -> Vec<WorkUnit> {
    let chunk = chunk.max(1);
    if total == 0 {
        return Vec::new();
    }
    let unit = |range| WorkUnit {
        folder: folder.to_string(),
        range,
        total_in_folder: total,
    };
    if total <= chunk {
        return vec![unit(SequenceRange::All)];
    }

    let mut units = Vec::with_capacity(total.div_ceil(chunk) as usize);
    let mut start = 1u32;
    while start <= total {
        let end = start.saturating_add(chunk - 1).min(total);
        units.push(unit(SequenceRange::Span { start, end }));
        start = match end.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }
    units
}

//! # Cursor: Unconsumed Suffix and Rotation Detection
//!
//! A stream's cursor is the number of complete lines already consumed from the
//! current remote file, plus a `generation` counter bumped on every detected
//! rotation. Planning is pure: given the stored cursor and freshly fetched
//! text it decides which line range is new. The store applies the plan only
//! after the batch for that range has committed.
//!
//! Rotation is detected when the fetched file has fewer complete lines than
//! the stored offset, or when discovery picked a different remote path. A file
//! replaced by a *longer* unrelated one is indistinguishable from growth and
//! is consumed from the old offset; this is a known limitation of line-count
//! tracking.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Durable cursor for one stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CursorState {
    pub generation: i64,
    pub offset: i64,
    pub remote_path: Option<String>,
    pub last_fetch: Option<DateTime<Utc>>,
}

/// The line range `[start, end)` to classify in this cycle, and the cursor
/// value to persist once it commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CursorPlan {
    pub generation: i64,
    pub start: i64,
    pub end: i64,
    /// The stored cursor is replaced by `(generation, 0)` semantics.
    pub rotated: bool,
    /// No cursor existed before this cycle.
    pub initial: bool,
}

impl CursorPlan {
    pub fn new_lines(&self) -> i64 {
        self.end - self.start
    }

    /// Nothing to classify and nothing to persist.
    pub fn is_noop(&self) -> bool {
        !self.rotated && !self.initial && self.start == self.end
    }
}

/// Newline-terminated lines of `text`, without their terminators.
///
/// A trailing fragment with no newline is still being written and is left
/// for a later cycle.
pub fn complete_lines(text: &str) -> Vec<&str> {
    let complete = match text.rfind('\n') {
        Some(idx) => &text[..idx],
        None => return Vec::new(),
    };
    complete
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect()
}

/// Decide the unconsumed range for a freshly fetched file.
pub fn plan(
    state: Option<&CursorState>,
    remote_path: &str,
    line_count: i64,
    backfill: bool,
) -> CursorPlan {
    let Some(state) = state else {
        return CursorPlan {
            generation: 0,
            start: if backfill { 0 } else { line_count },
            end: line_count,
            rotated: false,
            initial: true,
        };
    };

    let path_changed = state
        .remote_path
        .as_deref()
        .is_some_and(|previous| previous != remote_path);

    if path_changed || line_count < state.offset {
        CursorPlan {
            generation: state.generation + 1,
            start: 0,
            end: line_count,
            rotated: true,
            initial: false,
        }
    } else {
        CursorPlan {
            generation: state.generation,
            start: state.offset,
            end: line_count,
            rotated: false,
            initial: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(generation: i64, offset: i64, path: &str) -> CursorState {
        CursorState {
            generation,
            offset,
            remote_path: Some(path.to_string()),
            last_fetch: None,
        }
    }

    #[test]
    fn complete_lines_drops_partial_tail() {
        assert_eq!(complete_lines("a\nb\nc"), vec!["a", "b"]);
        assert_eq!(complete_lines("a\r\nb\n"), vec!["a", "b"]);
        assert!(complete_lines("partial").is_empty());
        assert!(complete_lines("").is_empty());
        assert_eq!(complete_lines("\n"), vec![""]);
    }

    #[test]
    fn first_sight_tails_from_end() {
        let p = plan(None, "/logs/a.ADM", 120, false);
        assert_eq!((p.start, p.end, p.generation), (120, 120, 0));
        assert!(p.initial && !p.rotated);
        assert!(!p.is_noop());
    }

    #[test]
    fn first_sight_with_backfill_reads_everything() {
        let p = plan(None, "/logs/a.ADM", 120, true);
        assert_eq!((p.start, p.end), (0, 120));
    }

    #[test]
    fn growth_reads_suffix() {
        let s = state(2, 100, "/logs/a.ADM");
        let p = plan(Some(&s), "/logs/a.ADM", 130, false);
        assert_eq!((p.generation, p.start, p.end), (2, 100, 130));
        assert_eq!(p.new_lines(), 30);
    }

    #[test]
    fn unchanged_file_is_noop() {
        let s = state(0, 50, "/logs/a.ADM");
        assert!(plan(Some(&s), "/logs/a.ADM", 50, false).is_noop());
    }

    #[test]
    fn shrink_is_rotation() {
        let s = state(3, 500, "/logs/a.ADM");
        let p = plan(Some(&s), "/logs/a.ADM", 20, false);
        assert!(p.rotated);
        assert_eq!((p.generation, p.start, p.end), (4, 0, 20));
    }

    #[test]
    fn path_change_is_rotation_even_when_longer() {
        let s = state(0, 10, "/logs/old.ADM");
        let p = plan(Some(&s), "/logs/new.ADM", 900, false);
        assert!(p.rotated);
        assert_eq!((p.generation, p.start), (1, 0));
    }

    #[test]
    fn unknown_previous_path_is_not_rotation() {
        let s = CursorState {
            generation: 0,
            offset: 5,
            remote_path: None,
            last_fetch: None,
        };
        assert!(!plan(Some(&s), "/logs/a.ADM", 8, false).rotated);
    }
}

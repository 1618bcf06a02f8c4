//! The filter chain ("conveyor") and its cursor
//!
//! A conveyor is a bounded, ordered list of stages plus a cursor. The
//! cursor either points at a live stage or sits at the `BeforeFirst`
//! sentinel. The runtime drives it with the primitives here after every
//! filter invocation:
//!
//! ```text
//!   Data/Ok    forward()          i -> i+1   (End when i is last)
//!   More/Back  backward()         i -> i-1   (skipping pass-once stages)
//!   Done       remove_current()   i -> i-1, then forward() lands on i again
//!   LastOut    remove_upstream()  [0, i) removed, cursor -> 0
//! ```
//!
//! Removed stages leave the chain but not the conveyor: they are kept aside
//! with their creation sequence number until `drain_close_order`, so
//! instances are always closed newest first, whenever they left the chain.
//!
//! The conveyor is generic over the stage payload so the cursor arithmetic
//! can be tested without filters or workers.

use crate::constants::MAX_FILTERS;
use crate::error::ChainError;
use crate::filter::Position;

/// Cursor position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Nothing has run yet, or the head stage was just removed
    BeforeFirst,
    /// Index of the active stage
    At(usize),
}

/// Result of moving the cursor forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Cursor now points at this index
    Moved(usize),
    /// There is no stage after the cursor; the cursor did not move
    End,
}

struct Stage<S> {
    item: S,
    /// Creation sequence number once the stage's instance exists
    opened: Option<u32>,
    /// Skip this stage once on the next backward walk
    pass_once: bool,
}

/// An ordered, bounded chain of stages with a movable cursor
pub struct Conveyor<S> {
    stages: Vec<Stage<S>>,
    /// Stages removed from the chain, waiting for teardown
    retired: Vec<Stage<S>>,
    cursor: Cursor,
    next_seq: u32,
    max: usize,
}

impl<S> Default for Conveyor<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Conveyor<S> {
    /// Create an empty conveyor limited to `MAX_FILTERS` stages
    pub fn new() -> Self {
        Self::with_limit(MAX_FILTERS)
    }

    /// Create an empty conveyor limited to `max` stages
    pub fn with_limit(max: usize) -> Self {
        Self {
            stages: Vec::with_capacity(max.min(MAX_FILTERS)),
            retired: Vec::new(),
            cursor: Cursor::BeforeFirst,
            next_seq: 0,
            max,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages removed from the chain and not yet drained
    #[inline]
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    #[inline]
    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Index under the cursor, if any
    #[inline]
    pub fn position(&self) -> Option<usize> {
        match self.cursor {
            Cursor::At(i) => Some(i),
            Cursor::BeforeFirst => None,
        }
    }

    /// The cursor is on the head stage
    #[inline]
    pub fn is_first(&self) -> bool {
        self.cursor == Cursor::At(0)
    }

    /// The cursor is on the tail stage
    #[inline]
    pub fn is_last(&self) -> bool {
        matches!(self.cursor, Cursor::At(i) if i + 1 == self.stages.len())
    }

    pub fn current(&self) -> Option<&S> {
        self.position().map(|i| &self.stages[i].item)
    }

    pub fn current_mut(&mut self) -> Option<&mut S> {
        match self.cursor {
            Cursor::At(i) => Some(&mut self.stages[i].item),
            Cursor::BeforeFirst => None,
        }
    }

    pub fn get(&self, index: usize) -> Option<&S> {
        self.stages.get(index).map(|s| &s.item)
    }

    pub fn iter(&self) -> impl Iterator<Item = &S> {
        self.stages.iter().map(|s| &s.item)
    }

    /// Insert a stage. Cursor-relative positions keep the cursor on the
    /// same stage, so "forward" still means toward track completion.
    ///
    /// Returns the index the stage landed at.
    pub fn insert(&mut self, item: S, pos: Position) -> Result<usize, ChainError> {
        if self.stages.len() >= self.max {
            return Err(ChainError::Full(self.max));
        }
        let stage = Stage { item, opened: None, pass_once: false };

        let index = match (pos, self.cursor) {
            (Position::Last, _) => self.stages.len(),
            (Position::First, _) => 0,
            (Position::BeforeCurrent, Cursor::At(i)) => i,
            (Position::AfterCurrent, Cursor::At(i)) => i + 1,
            (Position::BeforeCurrent | Position::AfterCurrent, Cursor::BeforeFirst) => 0,
        };

        self.stages.insert(index, stage);
        if let Cursor::At(i) = self.cursor {
            if index <= i {
                self.cursor = Cursor::At(i + 1);
            }
        }
        Ok(index)
    }

    /// Move the cursor one stage toward the tail
    pub fn forward(&mut self) -> Step {
        let next = match self.cursor {
            Cursor::BeforeFirst => 0,
            Cursor::At(i) => i + 1,
        };
        if next < self.stages.len() {
            self.cursor = Cursor::At(next);
            Step::Moved(next)
        } else {
            Step::End
        }
    }

    /// Move the cursor one stage toward the head.
    ///
    /// A stage carrying the pass-once mark is skipped (and unmarked), unless
    /// it is the head stage. Returns `None` if the cursor is already on the
    /// head stage or before it; the cursor does not move in that case.
    pub fn backward(&mut self) -> Option<usize> {
        let mut j = match self.cursor {
            Cursor::At(i) if i > 0 => i - 1,
            _ => return None,
        };
        while self.stages[j].pass_once {
            self.stages[j].pass_once = false;
            if j == 0 {
                break;
            }
            j -= 1;
        }
        self.cursor = Cursor::At(j);
        Some(j)
    }

    /// Record that the current stage's instance was just created
    pub fn mark_opened(&mut self) {
        if let Cursor::At(i) = self.cursor {
            if self.stages[i].opened.is_none() {
                self.stages[i].opened = Some(self.next_seq);
                self.next_seq = self.next_seq.wrapping_add(1);
            }
        }
    }

    /// Whether the current stage's instance exists
    pub fn is_opened(&self) -> bool {
        match self.cursor {
            Cursor::At(i) => self.stages[i].opened.is_some(),
            Cursor::BeforeFirst => false,
        }
    }

    /// Mark the current stage to be skipped once on the next backward walk
    pub fn set_pass_once(&mut self) {
        if let Cursor::At(i) = self.cursor {
            self.stages[i].pass_once = true;
        }
    }

    /// Remove the stage under the cursor from the chain.
    ///
    /// The cursor steps back by one so the next `forward()` lands on the
    /// removed stage's downstream neighbor. Returns `false` if the cursor
    /// is on the sentinel.
    pub fn remove_current(&mut self) -> bool {
        let Some(i) = self.position() else { return false };
        let stage = self.stages.remove(i);
        self.retired.push(stage);
        self.cursor = if i == 0 { Cursor::BeforeFirst } else { Cursor::At(i - 1) };
        true
    }

    /// Remove every stage before the cursor from the chain.
    ///
    /// Returns how many were removed. The cursor ends up on index 0, still
    /// pointing at the same stage.
    pub fn remove_upstream(&mut self) -> usize {
        let i = match self.cursor {
            Cursor::At(i) => i,
            Cursor::BeforeFirst => return 0,
        };
        self.retired.extend(self.stages.drain(..i));
        self.cursor = Cursor::At(0);
        i
    }

    /// Take every stage, live or removed, out of the conveyor in close
    /// order: opened stages in reverse creation order, then stages that
    /// were never opened.
    pub fn drain_close_order(&mut self) -> Vec<S> {
        self.cursor = Cursor::BeforeFirst;
        let mut all = std::mem::take(&mut self.stages);
        all.append(&mut self.retired);
        close_order(all)
    }
}

fn close_order<S>(mut stages: Vec<Stage<S>>) -> Vec<S> {
    // Unopened stages (None) sort after every opened one.
    stages.sort_by(|a, b| match (a.opened, b.opened) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    stages.into_iter().map(|s| s.item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(names: &[&'static str]) -> Conveyor<&'static str> {
        let mut c = Conveyor::new();
        for n in names {
            c.insert(*n, Position::Last).unwrap();
        }
        c
    }

    #[test]
    fn test_forward_backward() {
        let mut c = chain(&["a", "b", "c"]);
        assert_eq!(c.cursor(), Cursor::BeforeFirst);
        assert_eq!(c.forward(), Step::Moved(0));
        assert!(c.is_first());
        assert_eq!(c.forward(), Step::Moved(1));
        assert_eq!(c.forward(), Step::Moved(2));
        assert!(c.is_last());
        assert_eq!(c.forward(), Step::End);
        assert_eq!(c.position(), Some(2));

        assert_eq!(c.backward(), Some(1));
        assert_eq!(c.backward(), Some(0));
        assert_eq!(c.backward(), None);
        assert_eq!(c.position(), Some(0));
    }

    #[test]
    fn test_remove_current_lands_on_neighbor() {
        let mut c = chain(&["a", "b", "c"]);
        c.forward();
        c.forward();
        assert_eq!(c.current(), Some(&"b"));

        assert!(c.remove_current());
        assert_eq!(c.retired_len(), 1);
        assert_eq!(c.position(), Some(0));
        assert_eq!(c.forward(), Step::Moved(1));
        assert_eq!(c.current(), Some(&"c"));
    }

    #[test]
    fn test_remove_head_goes_to_sentinel() {
        let mut c = chain(&["a", "b"]);
        c.forward();
        assert!(c.remove_current());
        assert_eq!(c.cursor(), Cursor::BeforeFirst);
        assert!(!c.remove_current());
        assert_eq!(c.forward(), Step::Moved(0));
        assert_eq!(c.current(), Some(&"b"));
        assert!(c.is_first());
    }

    #[test]
    fn test_remove_tail_reports_end() {
        let mut c = chain(&["a", "b"]);
        c.forward();
        c.forward();
        assert!(c.is_last());
        c.remove_current();
        assert_eq!(c.forward(), Step::End);
    }

    #[test]
    fn test_remove_upstream() {
        let mut c = chain(&["a", "b", "c", "d"]);
        for _ in 0..3 {
            c.forward();
            c.mark_opened();
        }
        assert_eq!(c.current(), Some(&"c"));

        assert_eq!(c.remove_upstream(), 2);
        assert!(c.is_first());
        assert_eq!(c.current(), Some(&"c"));
        assert_eq!(c.len(), 2);
        assert_eq!(c.retired_len(), 2);
        assert_eq!(c.drain_close_order(), vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn test_removed_stages_close_in_creation_order() {
        // "a" leaves the chain first but was opened first, so closes last
        let mut c = chain(&["a", "b"]);
        c.forward();
        c.mark_opened();
        c.forward();
        c.mark_opened();
        c.backward();
        assert!(c.remove_current());
        assert_eq!(c.forward(), Step::Moved(0));
        assert_eq!(c.current(), Some(&"b"));

        assert_eq!(c.drain_close_order(), vec!["b", "a"]);
        assert_eq!(c.retired_len(), 0);
    }

    #[test]
    fn test_removed_stages_free_chain_slots() {
        let mut c: Conveyor<u32> = Conveyor::with_limit(2);
        c.insert(1, Position::Last).unwrap();
        c.insert(2, Position::Last).unwrap();
        c.forward();
        c.remove_current();
        assert_eq!(c.insert(3, Position::Last), Ok(1));
        assert_eq!(c.drain_close_order().len(), 3);
    }

    #[test]
    fn test_insert_before_current_keeps_cursor() {
        let mut c = chain(&["a", "b"]);
        c.forward();
        c.forward();
        assert_eq!(c.current(), Some(&"b"));

        let at = c.insert("conv", Position::BeforeCurrent).unwrap();
        assert_eq!(at, 1);
        assert_eq!(c.current(), Some(&"b"));
        assert_eq!(c.position(), Some(2));

        // Asking for more input now reaches the inserted stage
        assert_eq!(c.backward(), Some(1));
        assert_eq!(c.current(), Some(&"conv"));
    }

    #[test]
    fn test_insert_after_current() {
        let mut c = chain(&["a", "b"]);
        c.forward();
        let at = c.insert("x", Position::AfterCurrent).unwrap();
        assert_eq!(at, 1);
        assert_eq!(c.current(), Some(&"a"));
        assert_eq!(c.forward(), Step::Moved(1));
        assert_eq!(c.current(), Some(&"x"));
    }

    #[test]
    fn test_insert_first_shifts_cursor() {
        let mut c = chain(&["a"]);
        c.forward();
        c.insert("head", Position::First).unwrap();
        assert_eq!(c.current(), Some(&"a"));
        assert_eq!(c.position(), Some(1));
    }

    #[test]
    fn test_insert_full() {
        let mut c: Conveyor<u32> = Conveyor::with_limit(2);
        c.insert(1, Position::Last).unwrap();
        c.insert(2, Position::Last).unwrap();
        assert_eq!(c.insert(3, Position::Last), Err(ChainError::Full(2)));
    }

    #[test]
    fn test_pass_once_skipped_once() {
        let mut c = chain(&["a", "b", "c"]);
        c.forward();
        c.forward();
        c.set_pass_once();
        c.forward();

        // First backward walk skips "b"
        assert_eq!(c.backward(), Some(0));
        c.forward();
        c.forward();
        // The mark was consumed
        assert_eq!(c.backward(), Some(1));
    }

    #[test]
    fn test_pass_once_head_not_skipped() {
        let mut c = chain(&["a", "b"]);
        c.forward();
        c.set_pass_once();
        c.forward();
        assert_eq!(c.backward(), Some(0));
    }

    #[test]
    fn test_close_order_reverse_creation() {
        let mut c = chain(&["a", "b", "c"]);
        c.forward();
        c.mark_opened();
        c.forward();
        c.mark_opened();
        // "x" is inserted before "b" and opened after it
        c.insert("x", Position::BeforeCurrent).unwrap();
        c.backward();
        c.mark_opened();

        let order = c.drain_close_order();
        assert_eq!(order, vec!["x", "b", "a", "c"]);
        assert!(c.is_empty());
        assert_eq!(c.cursor(), Cursor::BeforeFirst);
    }

    #[test]
    fn test_cursor_stays_in_bounds() {
        // Deterministic pseudo-random walk over forward/backward/remove/insert
        let mut c: Conveyor<u32> = Conveyor::new();
        for i in 0..6 {
            c.insert(i, Position::Last).unwrap();
        }
        c.forward();

        let mut seed: u32 = 0x1234_5678;
        for n in 0..10_000u32 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            match seed >> 29 {
                0..=2 => {
                    c.forward();
                }
                3..=4 => {
                    let first = c.is_first();
                    let moved = c.backward();
                    assert_eq!(moved.is_none(), first);
                }
                5 => c.set_pass_once(),
                6 => {
                    if c.len() > 1 {
                        c.remove_current();
                        c.forward();
                    }
                }
                _ => {
                    if c.len() < MAX_FILTERS {
                        c.insert(100 + n, Position::BeforeCurrent).unwrap();
                    }
                }
            }
            match c.cursor() {
                Cursor::At(i) => assert!(i < c.len()),
                Cursor::BeforeFirst => {}
            }
        }
    }
}

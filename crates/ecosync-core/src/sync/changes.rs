//! Lazy change stream over the change log

use std::collections::VecDeque;

use crate::db::{ChangeLogRepository, Database, SqliteChangeLog};
use crate::error::Result;
use crate::models::{ChangeEntry, Cursor};

/// Commit-ordered stream of changes after a cursor
///
/// Pages are fetched from the database only as the iterator is drained, and
/// the database lock is not held between pages. The stream is restartable:
/// [`ChangeStream::cursor`] after any yielded entry is a valid starting point
/// for a new stream that continues without gaps.
pub struct ChangeStream<'a> {
    db: &'a Database,
    position: Cursor,
    page_size: usize,
    buffer: VecDeque<ChangeEntry>,
    exhausted: bool,
}

impl<'a> ChangeStream<'a> {
    pub(crate) fn new(db: &'a Database, from: Cursor, page_size: usize) -> Self {
        Self {
            db,
            position: from,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Position after the last yielded entry
    pub const fn cursor(&self) -> &Cursor {
        &self.position
    }

    fn fill(&mut self) -> Result<()> {
        let conn = self.db.connection()?;
        let after = self
            .buffer
            .back()
            .map_or(self.position.seq, |entry| entry.seq);
        let page = SqliteChangeLog::new(&conn).scan(&self.position.entity_type, after, self.page_size)?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for ChangeStream<'_> {
    type Item = Result<ChangeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }

        let entry = self.buffer.pop_front()?;
        self.position = entry.cursor(self.position.gc_epoch);
        Some(Ok(entry))
    }
}

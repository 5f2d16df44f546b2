//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Flatmail.
//
// Flatmail is free software: you can redistribute it and/or modify it under
// the terms of  the GNU General Public License as  published by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Flatmail is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY; without even the  implied warranty of MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR  PURPOSE. See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Flatmail. If not, see <http://www.gnu.org/licenses/>.

//! The persistent message index.
//!
//! The index is a sidecar to the mbox file (`<mbox>.fmidx` plus
//! `<mbox>.fmidx.log`) that remembers, per message: the UID, flags, keyword
//! set, From-line offset, and optionally a header MD5 sum. The index header
//! tracks UID validity, the next UID to assign, and the (mtime, size) pair
//! of the mbox as of the last completed sync.
//!
//! All mutation is transactional. Readers take an `IndexView` snapshot and
//! buffer modifications in a `Transaction`; committing applies the buffered
//! operations and appends them to the log. An *index sync* session
//! additionally drains the queue of pending sync records (flag changes,
//! expunges and the like, queued by other parties) and, on commit, rolls the
//! state into a fresh snapshot.

mod file;
mod transaction;
mod types;
mod view;

use std::path::{Path, PathBuf};

use log::warn;

pub use self::transaction::Transaction;
pub use self::types::*;
pub use self::view::IndexView;

use crate::support::error::Error;

/// Extension appended to the mbox path to name the index snapshot.
const INDEX_SUFFIX: &str = ".fmidx";
/// Extension appended to the snapshot path to name the transaction log.
const LOG_SUFFIX: &str = ".log";

pub struct MailIndex {
    path: PathBuf,
    log_path: PathBuf,
    log_prefix: String,
    state: file::IndexState,
}

/// A sync session over the index.
///
/// Holds the pending sync records drained from the index, exposed as a
/// cursor (`next()` / `reset()`). Must be finished with
/// `MailIndex::sync_commit()` or `sync_rollback()`; merely dropping the
/// session loses the pending records for this process's lifetime but not on
/// disk, since the drain is only persisted by a commit.
#[derive(Debug, Default)]
pub struct SyncSession {
    records: Vec<SyncRecord>,
    pos: usize,
}

impl SyncSession {
    /// Return the next pending sync record, advancing the cursor.
    pub fn next(&mut self) -> Option<SyncRecord> {
        let rec = self.records.get(self.pos).cloned();
        if rec.is_some() {
            self.pos += 1;
        }
        rec
    }

    /// Rewind the cursor to the start of the record stream.
    pub fn reset(&mut self) {
        self.pos = 0;
    }
}

impl MailIndex {
    /// Open (or implicitly create) the index beside `mbox_path`.
    pub fn open(mbox_path: &Path, log_prefix: String) -> Self {
        let mut name = mbox_path.as_os_str().to_owned();
        name.push(INDEX_SUFFIX);
        let path = PathBuf::from(name);

        let mut log_name = path.as_os_str().to_owned();
        log_name.push(LOG_SUFFIX);
        let log_path = PathBuf::from(log_name);

        let state = file::load(&path, &log_path, &log_prefix);
        MailIndex {
            path,
            log_path,
            log_prefix,
            state,
        }
    }

    pub fn header(&self) -> &IndexHeader {
        &self.state.header
    }

    /// Take a point-in-time snapshot of the index.
    pub fn view(&self) -> IndexView {
        IndexView {
            header: self.state.header.clone(),
            keywords: self.state.keywords.clone(),
            records: self.state.records.clone(),
        }
    }

    /// Whether any sync records are queued.
    pub fn has_pending(&self) -> bool {
        !self.state.pending.is_empty()
    }

    /// Commit a transaction: apply it to the live state and append it to the
    /// durable log. Returns the number of committed operations.
    pub fn commit(&mut self, tx: Transaction) -> Result<usize, Error> {
        if tx.is_empty() {
            return Ok(0);
        }

        file::append_log(&self.log_path, &tx.ops)?;
        file::apply_ops(&mut self.state, &tx.ops);
        Ok(tx.ops.len())
    }

    /// Begin an index sync, draining the pending record queue into the
    /// session's record stream.
    ///
    /// The records are sorted by `uid1` (stably, so that multiple records
    /// against one message keep their enqueue order).
    pub fn sync_begin(&mut self) -> SyncSession {
        let mut records = std::mem::take(&mut self.state.pending);
        records.sort_by_key(|r| r.uid1);
        SyncSession { records, pos: 0 }
    }

    /// Commit an index sync: roll the current state into a fresh snapshot
    /// and truncate the log. The drained pending records die here.
    pub fn sync_commit(&mut self, session: SyncSession) -> Result<(), Error> {
        drop(session);
        file::rollup(&self.path, &self.log_path, &self.state)
    }

    /// Abort an index sync, restoring the pending record queue.
    pub fn sync_rollback(&mut self, session: SyncSession) {
        let mut records = session.records;
        records.append(&mut self.state.pending);
        self.state.pending = records;
    }

    /// Poison the index. The next open will discard it entirely.
    pub fn mark_corrupted(&mut self) {
        self.state.header.corrupted = true;
        if let Err(e) =
            file::rollup(&self.path, &self.log_path, &self.state)
        {
            warn!(
                "{} Failed to persist index corruption mark: {}",
                self.log_prefix, e
            );
        }
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    pub fn keywords(&self) -> &[String] {
        &self.state.keywords
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_in(dir: &Path) -> MailIndex {
        MailIndex::open(&dir.join("folder"), "test".to_owned())
    }

    #[test]
    fn transactional_updates_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut index = open_in(dir.path());
        let view = index.view();
        let mut tx = Transaction::new(&view);
        let seq = tx.append(1);
        tx.update_flags(seq, UpdateMode::Replace, MailFlags::SEEN);
        tx.update_from_offset(seq, 0);
        tx.set_next_uid(2);
        index.commit(tx).unwrap();

        let reopened = open_in(dir.path());
        assert_eq!(2, reopened.header().next_uid);
        let view = reopened.view();
        assert_eq!(1, view.messages_count());
        assert_eq!(Some(1), view.lookup_uid(1));
        assert_eq!(Some(0), view.lookup_from_offset(1));
    }

    #[test]
    fn rollback_is_a_dropped_transaction() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut index = open_in(dir.path());
        let view = index.view();
        let mut tx = Transaction::new(&view);
        tx.append(1);
        drop(tx);

        assert_eq!(0, index.view().messages_count());
        let _ = index;
        let reopened = open_in(dir.path());
        assert_eq!(0, reopened.view().messages_count());
    }

    #[test]
    fn pending_queue_drain_and_rollback() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut index = open_in(dir.path());
        let view = index.view();
        let mut tx = Transaction::new(&view);
        tx.enqueue(SyncRecord {
            uid1: 5,
            uid2: 5,
            op: SyncOp::Expunge,
        });
        tx.enqueue(SyncRecord {
            uid1: 2,
            uid2: 3,
            op: SyncOp::Flags {
                add: MailFlags::SEEN,
                remove: MailFlags::empty(),
            },
        });
        index.commit(tx).unwrap();
        assert!(index.has_pending());

        let mut session = index.sync_begin();
        assert!(!index.has_pending());
        // Sorted by uid1
        assert_eq!(2, session.next().unwrap().uid1);
        assert_eq!(5, session.next().unwrap().uid1);
        assert_matches!(None, session.next());
        session.reset();
        assert_eq!(2, session.next().unwrap().uid1);

        // Roll back: records are available again, and survive reopen since
        // the enqueue was committed to the log.
        index.sync_rollback(session);
        assert!(index.has_pending());

        let mut reopened = open_in(dir.path());
        assert!(reopened.has_pending());

        // And commit: records are consumed durably.
        let session = reopened.sync_begin();
        reopened.sync_commit(session).unwrap();
        let reopened = open_in(dir.path());
        assert!(!reopened.has_pending());
    }

    #[test]
    fn corruption_mark_discards_index() {
        let dir = tempfile::TempDir::new().unwrap();

        let mut index = open_in(dir.path());
        let view = index.view();
        let mut tx = Transaction::new(&view);
        tx.append(1);
        tx.set_sync_stamp(1234);
        index.commit(tx).unwrap();
        index.mark_corrupted();

        let reopened = open_in(dir.path());
        assert_eq!(0, reopened.view().messages_count());
        assert_eq!(0, reopened.header().sync_stamp);
    }
}

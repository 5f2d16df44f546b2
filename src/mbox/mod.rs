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

//! Support for working with a single mbox folder.
//!
//! An mbox folder is one flat file of messages, each starting with a
//! `From ` delimiter line, with headers separated from the body by an empty
//! line. Flatmail additionally maintains, inside the message headers it
//! manages:
//!
//! - `X-UID`: the message's IMAP-style UID.
//! - `Status`/`X-Status`: the standard one-character flag conventions.
//! - `X-Keywords`: user-defined keywords by name.
//! - `Content-Length`: the body's byte length, written opportunistically so
//!   later passes need not scan for the next delimiter.
//! - `X-IMAP` (on the pseudo first message) or `X-IMAPbase` (on the first
//!   real message): the folder's `uid-validity` and `uid-last` values. The
//!   uid-last is a fixed-width 10-digit field so it can be patched in place
//!   without rewriting the message.
//!
//! Managed headers are written with trailing-space padding so that most
//! future changes can be absorbed without moving any bytes. When padding
//! runs out or messages are expunged, the sync engine (`sync` module)
//! rewrites or slides the affected span of the file.
//!
//! The index (`crate::index`) is a sidecar file remembering what the mbox
//! contained after the last sync, plus a queue of modifications to apply to
//! it during the next one.

pub mod from_line;
pub mod model;
pub mod parse;
pub mod rewrite;
pub mod sync;

use std::fs;
use std::path::{Path, PathBuf};

use crate::index::{
    MailIndex, SyncOp, SyncRecord, Transaction, UpdateMode,
};
use crate::support::error::Error;

pub use self::model::SyncConfig;
pub use self::sync::SyncFlags;

/// A handle on one mbox folder and its sidecar index.
pub struct Mbox {
    pub(crate) path: PathBuf,
    pub(crate) log_prefix: String,
    pub(crate) index: MailIndex,
    pub(crate) read_only: bool,
    pub(crate) config: SyncConfig,
    /// The file is known to contain flag state the index supersedes.
    pub(crate) sync_dirty: bool,
    /// (mtime, size) memo for `has_changed()` in leave-dirty mode.
    pub(crate) dirty_stamp: i64,
    pub(crate) dirty_size: u64,
    /// Set when X-UID headers cannot be trusted/stored and message
    /// identities must be tracked by header MD5 instead.
    pub(crate) save_md5: bool,
}

impl Mbox {
    /// Open the mbox at `path`.
    ///
    /// The file must already exist (possibly empty); the index is created
    /// implicitly beside it.
    pub fn open(
        path: impl AsRef<Path>,
        read_only: bool,
        config: SyncConfig,
    ) -> Result<Self, Error> {
        let path = path.as_ref().to_owned();
        // Fail early and clearly if there is no such file
        let _ = fs::metadata(&path)?;

        let log_prefix = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mbox".to_owned());
        let index = MailIndex::open(&path, log_prefix.clone());
        let save_md5 = config.save_md5;

        Ok(Mbox {
            path,
            log_prefix,
            index,
            read_only,
            config,
            sync_dirty: false,
            dirty_stamp: 0,
            dirty_size: 0,
            save_md5,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn index(&self) -> &MailIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut MailIndex {
        &mut self.index
    }

    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// Open the underlying file with the access the current mode allows.
    pub(crate) fn open_file(&self) -> Result<fs::File, Error> {
        Ok(fs::OpenOptions::new()
            .read(true)
            .write(!self.read_only)
            .open(&self.path)?)
    }

    /// Intern a keyword name in the index, returning its stable id.
    pub fn intern_keyword(&mut self, name: &str) -> Result<u32, Error> {
        let view = self.index.view();
        let mut tx = Transaction::new(&view);
        let id = tx.keyword_id(&view, name);
        self.index.commit(tx)?;
        Ok(id)
    }

    /// Queue sync records for the next sync pass.
    ///
    /// Flag and keyword changes are applied to the index records
    /// immediately, the way a mail store's own commit would be; the queued
    /// records then describe what the mbox *file* still needs. Expunges
    /// only leave the index once the sync removes the message bytes.
    pub fn enqueue(
        &mut self,
        records: Vec<SyncRecord>,
    ) -> Result<(), Error> {
        let view = self.index.view();
        let mut tx = Transaction::new(&view);

        for rec in records {
            if let Some((seq1, seq2)) =
                view.lookup_uid_range(rec.uid1, rec.uid2)
            {
                for seq in seq1..=seq2 {
                    match rec.op {
                        SyncOp::Flags { add, remove } => {
                            if !add.is_empty() {
                                tx.update_flags(seq, UpdateMode::Add, add);
                            }
                            if !remove.is_empty() {
                                tx.update_flags(
                                    seq,
                                    UpdateMode::Remove,
                                    remove,
                                );
                            }
                        },
                        SyncOp::KeywordAdd(id) => {
                            tx.update_keywords(seq, UpdateMode::Add, &[id]);
                        },
                        SyncOp::KeywordRemove(id) => {
                            tx.update_keywords(
                                seq,
                                UpdateMode::Remove,
                                &[id],
                            );
                        },
                        SyncOp::KeywordReset => {
                            tx.update_keywords(
                                seq,
                                UpdateMode::Replace,
                                &[],
                            );
                        },
                        SyncOp::Expunge | SyncOp::Append => (),
                    }
                }
            }

            tx.enqueue(rec);
        }

        self.index.commit(tx)?;
        Ok(())
    }
}

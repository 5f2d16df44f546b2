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

use std::fs;

use bitflags::bitflags;

use crate::index::{IndexView, SyncRecord, SyncSession, Transaction};
use crate::mbox::model::*;

bitflags! {
    /// Caller-selected sync behaviours.
    pub struct SyncFlags: u8 {
        /// Assume the file changed and run a full scan.
        const FORCE_FULL = 1 << 0;
        /// Write out flag state for messages marked dirty in the index.
        const UNDIRTY = 1 << 1;
        /// Write header changes even under a delay-writes policy.
        const REWRITE = 1 << 2;
        /// Hold a read lock over the change pre-check.
        const LOCK_READING = 1 << 3;
        /// Restrict the pass to records committed before the previous
        /// sync's crash point.
        const LAST_COMMIT = 1 << 4;
        /// Only bring the index header up to date.
        const HEADER_ONLY = 1 << 5;
    }
}

/// All state for one sync of one mbox.
///
/// Created by the driver for each attempt and torn down when the attempt
/// ends; `restart()` rebuilds the cursors in place for the full-sync retry
/// path.
pub(super) struct SyncContext {
    pub file: fs::File,
    pub writable: bool,
    pub path: std::path::PathBuf,
    pub log_prefix: String,
    pub config: SyncConfig,
    pub view: IndexView,
    pub tx: Transaction,
    pub session: SyncSession,

    /// From-offset the reader will parse next.
    pub input_offset: u64,
    pub input_eof: bool,
    pub file_size: u64,

    /// mbox message sequence of the last message read (1-based).
    pub seq: u32,
    /// Index sequence the updater will reconcile next (1-based).
    pub idx_seq: u32,
    pub prev_msg_uid: u32,
    pub next_uid: u32,
    /// `next_uid` as the index header recorded it at sync start.
    pub idx_next_uid: u32,
    /// The pass saw (or decided) the pseudo message occupies sequence 1.
    pub saw_pseudo: bool,

    pub base_uid_validity: u32,
    pub base_uid_last: u32,
    /// Absolute offset of the 10-digit uid-last field, 0 when unusable.
    pub base_uid_last_offset: u64,

    /// Saved records of the open rewrite window.
    pub mails: Vec<MailRecord>,
    /// Sync records relevant to the message under inspection.
    pub syncs: Vec<SyncRecord>,
    /// Lookahead into the pending record stream.
    pub sync_rec: Option<SyncRecord>,
    /// First sequence of the open rewrite window, 0 when none.
    pub need_space_seq: u32,
    pub space_diff: i64,
    pub expunged_space: u64,

    pub dest_first_mail: bool,
    pub first_mail_crlf_expunged: bool,
    /// The first message's expunge absorbed the following separator
    /// newline; the next message under the cursor must account for that.
    pub first_mail_sep_pending: bool,
    pub moved_offsets: bool,
    pub renumber_uids: bool,
    pub delay_writes: bool,
    pub sync_dirty: bool,
    pub save_md5: bool,

    pub orig_mtime: i64,
    pub orig_size: u64,
    /// (mtime, size) the pass finished with, for the dirty memo.
    pub dirty_stamp: i64,
    pub dirty_size: u64,
}

impl SyncContext {
    /// Reset all per-pass state for a fresh attempt against the same view.
    pub fn restart(&mut self) {
        self.base_uid_validity = 0;
        self.base_uid_last = 0;
        self.base_uid_last_offset = 0;

        self.mails.clear();
        self.syncs.clear();
        self.sync_rec = None;
        self.session.reset();
        // Dropping the old transaction rolls it back
        self.tx = Transaction::new(&self.view);

        self.prev_msg_uid = 0;
        self.next_uid = self.view.header().next_uid;
        self.idx_next_uid = self.view.header().next_uid;
        self.seq = 0;
        self.idx_seq = 1;
        self.saw_pseudo = false;
        self.need_space_seq = 0;
        self.expunged_space = 0;
        self.space_diff = 0;

        self.dest_first_mail = true;
        self.first_mail_crlf_expunged = false;
        self.first_mail_sep_pending = false;

        if self.renumber_uids {
            // All UIDs are reissued under a fresh validity
            self.next_uid = 1;
        }
    }
}

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

//! The per-message sync-record buffer.
//!
//! Pending index modifications arrive as a UID-ordered stream. As the
//! reader advances, records overlapping the current message are pulled into
//! `syncs` and records whose range is entirely behind the cursor are
//! dropped.

use super::defs::*;
use crate::index::{
    apply_flag_sync, apply_keyword_sync, MailFlags, SyncOp, UpdateMode,
};
use crate::mbox::model::MailRecord;
use crate::support::error::Error;

impl SyncContext {
    /// Drop buffered records that end before `last_uid`.
    pub(super) fn syncs_delete_to(&mut self, last_uid: u32) {
        self.syncs.retain(|rec| {
            debug_assert!(last_uid >= rec.uid1);
            last_uid <= rec.uid2
        });
    }

    pub(super) fn syncs_have_expunge(&self) -> bool {
        self.syncs.iter().any(|rec| rec.is_expunge())
    }

    /// Pull every pending record overlapping `uid` into the buffer.
    ///
    /// Returns whether any of them expunges the message. `uid` 0 means
    /// "nothing applies to this or any future message" and consumes the
    /// whole stream.
    ///
    /// Append records and, under delay-writes, flag records are consumed as
    /// soon as they are seen even when they reference future UIDs; the
    /// lookahead therefore only ever parks on a record that will need real
    /// work later in the pass.
    pub(super) fn read_index_syncs(&mut self, uid: u32) -> Result<bool, Error> {
        let uid = if 0 == uid { u32::MAX } else { uid };

        self.syncs_delete_to(uid);

        if self.sync_rec.is_none() {
            self.sync_rec = self.session.next();
        }

        while let Some(rec) = self.sync_rec.clone() {
            match rec.op {
                SyncOp::Append => {
                    // Delivery already assigned these UIDs
                    if rec.uid2 >= self.next_uid {
                        self.next_uid = rec.uid2 + 1;
                    }
                },
                SyncOp::Expunge => {
                    if uid < rec.uid1 {
                        break;
                    }
                    if uid <= rec.uid2 && self.writable {
                        self.syncs.push(rec.clone());
                    }
                },
                _ => {
                    if self.delay_writes {
                        // Not writing these yet: note the affected
                        // messages as dirty and drop the record.
                        if let Some((seq1, seq2)) =
                            self.view.lookup_uid_range(rec.uid1, rec.uid2)
                        {
                            for seq in seq1..=seq2 {
                                self.tx.update_flags(
                                    seq,
                                    UpdateMode::Add,
                                    MailFlags::DIRTY,
                                );
                            }
                        }
                    } else {
                        if uid < rec.uid1 {
                            break;
                        }
                        if uid <= rec.uid2 {
                            self.syncs.push(rec.clone());
                        }
                    }
                },
            }

            self.sync_rec = self.session.next();
        }

        Ok(self.syncs_have_expunge())
    }

    /// Apply the buffered records to a mail record.
    ///
    /// Returns whether the keyword array changed.
    pub(super) fn apply_index_syncs(&self, mail: &mut MailRecord) -> bool {
        let mut keywords_changed = false;

        for rec in &self.syncs {
            match rec.op {
                SyncOp::Flags { add, remove } => {
                    apply_flag_sync(&mut mail.flags, add, remove);
                },
                SyncOp::KeywordAdd(_)
                | SyncOp::KeywordRemove(_)
                | SyncOp::KeywordReset => {
                    if apply_keyword_sync(&mut mail.keywords, &rec.op) {
                        keywords_changed = true;
                    }
                },
                _ => (),
            }
        }

        keywords_changed
    }
}

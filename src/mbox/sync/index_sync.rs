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

//! Advancing the index in step with the mbox cursor.

use log::error;

use super::defs::*;
use crate::index::{IndexRecord, MailFlags, UpdateMode};
use crate::mbox::model::MailContext;
use crate::support::error::Error;

/// How a message's UID relates to the index.
pub(super) enum RecMatch {
    /// The UID matched this index record.
    Found(IndexRecord),
    /// The UID is new to the index (appended message).
    New,
    /// The UID contradicts the index (reappeared or inserted); it must be
    /// discarded and reassigned.
    Broken,
}

impl SyncContext {
    /// Find the index record for `uid`, expunging index entries for
    /// messages that vanished from the file.
    pub(super) fn read_index_rec(
        &mut self,
        uid: u32,
    ) -> Result<RecMatch, Error> {
        let messages_count = self.view.messages_count();
        let mut rec = None;

        while self.idx_seq <= messages_count {
            let r = self
                .view
                .lookup(self.idx_seq)
                .expect("idx_seq <= messages_count but no record");
            if uid <= r.uid {
                rec = Some(r.clone());
                break;
            }

            // Externally expunged message; remove from index
            self.tx.expunge(self.idx_seq);
            self.idx_seq += 1;
        }

        match rec {
            None if uid < self.idx_next_uid => {
                error!(
                    "{} Expunged message reappeared in mailbox \
                     (UID {} < {}, seq={}, idx_msgs={})",
                    self.log_prefix,
                    uid,
                    self.idx_next_uid,
                    self.seq,
                    messages_count
                );
                Ok(RecMatch::Broken)
            },
            Some(ref r) if r.uid != uid => {
                error!(
                    "{} UID inserted in the middle of mailbox \
                     ({} > {}, seq={}, idx_msgs={})",
                    self.log_prefix, r.uid, uid, self.seq, messages_count
                );
                Ok(RecMatch::Broken)
            },
            Some(r) => Ok(RecMatch::Found(r)),
            None => Ok(RecMatch::New),
        }
    }

    /// Search the remaining index records for one whose stored header MD5
    /// matches, expunging everything skipped over.
    pub(super) fn find_index_md5(
        &mut self,
        hdr_md5: [u8; 16],
    ) -> Result<Option<IndexRecord>, Error> {
        let messages_count = self.view.messages_count();

        while self.idx_seq <= messages_count {
            let rec = self
                .view
                .lookup(self.idx_seq)
                .expect("idx_seq <= messages_count but no record");
            if Some(hdr_md5) == rec.hdr_md5 {
                return Ok(Some(rec.clone()));
            }

            // Externally expunged message; remove from index
            self.tx.expunge(self.idx_seq);
            self.idx_seq += 1;
        }

        Ok(None)
    }

    /// Bring the index record for the reconciled message up to date, or
    /// append one if the message is new.
    pub(super) fn update_index(
        &mut self,
        ctx: &mut MailContext,
        rec: Option<&IndexRecord>,
    ) -> Result<(), Error> {
        let mut mbox_flags = ctx.mail.flags & MailFlags::FLAGS_MASK;
        if ctx.dirty {
            mbox_flags |= MailFlags::DIRTY;
        } else if !self.delay_writes {
            mbox_flags &= !MailFlags::DIRTY;
        }

        match rec {
            None => {
                // New message
                self.idx_seq = self.tx.append(ctx.mail.uid);
                ctx.mail.idx_seq = self.idx_seq;
                self.tx.update_flags(
                    self.idx_seq,
                    UpdateMode::Replace,
                    mbox_flags,
                );
                self.tx.update_keywords(
                    self.idx_seq,
                    UpdateMode::Replace,
                    &ctx.mail.keywords,
                );

                if self.save_md5 || self.config.save_md5 {
                    self.tx.update_hdr_md5(self.idx_seq, ctx.hdr_md5);
                }
            },
            Some(rec) => {
                // Work out what the record's flags should become. When the
                // record is dirty the index is the truth and the mbox's
                // flag bytes are ignored, except for the bookkeeping bits.
                let mut idx_mail = crate::mbox::model::MailRecord {
                    flags: rec.flags,
                    keywords: rec.keywords.clone(),
                    ..Default::default()
                };
                self.apply_index_syncs(&mut idx_mail);

                if idx_mail.flags.contains(MailFlags::DIRTY) {
                    mbox_flags &= MailFlags::SYNC_FLAGS;
                    mbox_flags |= idx_mail.flags & !MailFlags::SYNC_FLAGS;
                    if self.delay_writes {
                        mbox_flags |= MailFlags::DIRTY;
                    }
                } else {
                    mbox_flags &=
                        MailFlags::FLAGS_MASK | MailFlags::SYNC_FLAGS;
                    mbox_flags |= idx_mail.flags
                        & !(MailFlags::FLAGS_MASK | MailFlags::SYNC_FLAGS);
                }

                let stored = rec.flags;
                if (stored ^ mbox_flags) & !MailFlags::SYNC_FLAGS
                    != MailFlags::empty()
                {
                    // Flags other than recent/dirty have changed
                    self.tx.update_flags(
                        self.idx_seq,
                        UpdateMode::Replace,
                        mbox_flags,
                    );
                } else {
                    if (stored ^ mbox_flags) & MailFlags::RECENT
                        != MailFlags::empty()
                    {
                        // The recent flag can only be dropped
                        self.tx.update_flags(
                            self.idx_seq,
                            UpdateMode::Remove,
                            MailFlags::RECENT,
                        );
                    }
                    if (stored ^ mbox_flags) & MailFlags::DIRTY
                        != MailFlags::empty()
                    {
                        let mode =
                            if mbox_flags.contains(MailFlags::DIRTY) {
                                UpdateMode::Add
                            } else {
                                UpdateMode::Remove
                            };
                        self.tx.update_flags(
                            self.idx_seq,
                            mode,
                            MailFlags::DIRTY,
                        );
                    }
                }

                if !idx_mail.flags.contains(MailFlags::DIRTY)
                    && idx_mail.keywords != ctx.mail.keywords
                {
                    self.tx.update_keywords(
                        self.idx_seq,
                        UpdateMode::Replace,
                        &ctx.mail.keywords,
                    );
                }

                if (self.save_md5 || self.config.save_md5)
                    && rec.hdr_md5 != Some(ctx.hdr_md5)
                {
                    self.tx.update_hdr_md5(self.idx_seq, ctx.hdr_md5);
                }
            },
        }

        // Update from_offset, but not if this message is going to be
        // rewritten; rewriting would just move it anyway.
        if 0 == self.need_space_seq {
            let nocheck = rec.is_none() || self.expunged_space > 0;
            self.update_from_offset(ctx, nocheck);
        }
        Ok(())
    }

    /// Store the message's from-offset extension unless it is already
    /// correct.
    fn update_from_offset(&mut self, ctx: &MailContext, nocheck: bool) {
        if !nocheck {
            if Some(ctx.mail.from_offset)
                == self.view.lookup_from_offset(self.idx_seq)
            {
                return;
            }
        }

        self.tx.update_from_offset(self.idx_seq, ctx.mail.from_offset);
    }
}

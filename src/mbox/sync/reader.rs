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

//! Driving the parser forward, and the partial-sync seek coordinator.

use log::{error, warn};

use super::defs::*;
use crate::index::MailFlags;
use crate::mbox::model::MailContext;
use crate::mbox::parse;
use crate::support::error::Error;

impl SyncContext {
    pub(super) fn stat_size(&mut self) -> Result<u64, Error> {
        self.file_size = self.file.metadata()?.len();
        Ok(self.file_size)
    }

    /// Position the reader on the message span starting at `offset`,
    /// verifying a message boundary is actually there.
    pub(super) fn seek(&mut self, offset: u64) -> Result<(), Error> {
        if !parse::boundary_at(&self.file, offset, self.file_size)? {
            error!(
                "{} Unexpectedly lost From-line at offset {} in mbox file",
                self.log_prefix, offset
            );
            return Err(Error::LostFromLine);
        }

        self.input_offset = offset;
        self.input_eof = offset >= self.file_size;
        Ok(())
    }

    /// Read the next message, if any.
    ///
    /// Assigns the mbox sequence, validates UID ordering, captures the
    /// X-IMAP(base) baseline, and works out whether the header will need a
    /// rewrite for reasons visible at parse time.
    pub(super) fn read_next_mail(
        &mut self,
    ) -> Result<Option<MailContext>, Error> {
        if self.input_eof || self.input_offset >= self.file_size {
            self.input_eof = true;
            return Ok(None);
        }

        let mut ctx = parse::parse_mail_at(
            &self.file,
            self.input_offset,
            self.file_size,
            self.seq + 1,
            &self.view,
            &mut self.tx,
        )?;
        self.seq += 1;
        ctx.seq = self.seq;

        if ctx.pseudo {
            self.saw_pseudo = true;
        }

        if self.renumber_uids {
            // Every message is renumbered under a fresh validity; whatever
            // the file claims is void. The pseudo message needs rewriting
            // too so it carries the new validity.
            ctx.mail.uid = 0;
            ctx.imap_base = None;
            ctx.need_rewrite = true;
        }

        if 1 == ctx.seq && !ctx.pseudo && ctx.imap_base.is_none() {
            // No pseudo and no X-IMAPbase: the folder baseline must be
            // written into this message.
            ctx.need_rewrite = true;
        }

        if let Some(base) = ctx.imap_base {
            if 1 == ctx.seq {
                self.base_uid_validity = base.uid_validity;
                self.base_uid_last = base.uid_last;
                self.base_uid_last_offset = base.uid_last_offset;
                if base.uid_last != u32::MAX
                    && base.uid_last + 1 > self.next_uid
                {
                    self.next_uid = base.uid_last + 1;
                }
            }
        }

        // UID ordering validation
        if ctx.mail.uid != 0 && !ctx.pseudo {
            if ctx.mail.uid <= self.prev_msg_uid {
                warn!(
                    "{} UID {} <= previous UID {} in mbox file",
                    self.log_prefix, ctx.mail.uid, self.prev_msg_uid
                );
                ctx.uid_broken = true;
                ctx.mail.uid = 0;
            } else {
                self.prev_msg_uid = ctx.mail.uid;
                if ctx.mail.uid >= self.next_uid {
                    self.next_uid = ctx.mail.uid + 1;
                }
            }
        }

        if ctx.recent && !ctx.pseudo {
            if !self.config.keep_recent {
                // The Status header needs an 'O' added
                ctx.need_rewrite = true;
            }
            ctx.mail.flags |= MailFlags::RECENT;
        }

        Ok(Some(ctx))
    }

    /// Move the cursor past the body of the message just handled.
    pub(super) fn advance_past_body(&mut self, ctx: &MailContext) {
        self.input_offset = ctx.body_offset + ctx.mail.body_size;
        if self.input_offset >= self.file_size {
            self.input_eof = true;
        }
    }

    /// Seek to the beginning of the file to start a pass.
    pub(super) fn seek_to_start(&mut self) -> Result<(), Error> {
        self.stat_size()?;
        if self.file_size > 0
            && !parse::boundary_at(&self.file, 0, self.file_size)?
        {
            error!(
                "{} Mailbox isn't a valid mbox file",
                self.log_prefix
            );
            return Err(Error::NotMbox);
        }

        self.input_offset = 0;
        self.input_eof = 0 == self.file_size;
        self.seq = 0;
        self.idx_seq = 1;
        self.prev_msg_uid = 0;
        self.dest_first_mail = true;
        Ok(())
    }

    /// Seek both cursors to the message holding index sequence `idx_seq`.
    ///
    /// Returns false if the stored offset is stale and the caller must fall
    /// back to sequential reading from its current position.
    pub(super) fn seek_to_idx_seq(
        &mut self,
        idx_seq: u32,
    ) -> Result<bool, Error> {
        let offset = match self.view.lookup_from_offset(idx_seq) {
            Some(o) => o,
            None => return Ok(false),
        };

        if !parse::boundary_at(&self.file, offset, self.file_size)
            .unwrap_or(false)
            || offset >= self.file_size
        {
            warn!(
                "{} Stale from-offset {} for index seq {}; degrading to \
                 sequential sync",
                self.log_prefix, offset, idx_seq
            );
            return Ok(false);
        }

        self.prev_msg_uid = if idx_seq > 1 {
            self.view.lookup_uid(idx_seq - 1).unwrap_or(0)
        } else {
            0
        };

        // The mbox sequence is offset by one when a pseudo message heads
        // the file.
        self.seq = idx_seq - 1 + if self.saw_pseudo { 1 } else { 0 };
        self.idx_seq = idx_seq;
        self.dest_first_mail = false;
        self.input_offset = offset;
        self.input_eof = false;
        Ok(true)
    }

    /// Seek to the message with the given UID, or to the end of the file if
    /// no indexed message has it.
    fn seek_to_uid(&mut self, uid: u32) -> Result<bool, Error> {
        match self.view.lookup_uid_range(uid, u32::MAX) {
            Some((seq1, _)) => self.seek_to_idx_seq(seq1),
            None => {
                // Nothing at or after this UID anymore
                self.stat_size()?;
                self.input_offset = self.file_size;
                self.input_eof = true;
                self.idx_seq = self.view.messages_count() + 1;
                Ok(true)
            },
        }
    }

    /// Decide where a partial pass goes after finishing one message.
    ///
    /// Returns false when the pass can stop early. `partial` is cleared
    /// when the rest of the file must be read sequentially; `skipped` is
    /// set when any message was skipped over.
    pub(super) fn partial_seek_next(
        &mut self,
        next_uid: u32,
        partial: &mut bool,
        skipped: &mut bool,
    ) -> Result<bool, Error> {
        // Drop records for everything before the next message; anything
        // left means the next message itself needs work.
        self.syncs_delete_to(next_uid);
        if !self.syncs.is_empty() {
            return Ok(true);
        }

        let seek_result = if let Some(rec) = self.sync_rec.clone() {
            // Skip forward to the next record needing an update
            let mut target = next_uid;
            if rec.uid1 != next_uid {
                *skipped = true;
                target = rec.uid1;
            }
            self.seek_to_uid(target)?
        } else {
            // No records left: stop, unless the mailbox is dirty and the
            // tail still needs checking for new messages.
            if !self.sync_dirty {
                return Ok(false);
            }

            let messages_count = self.view.messages_count();
            // The just-handled message's mbox sequence is idx_seq - 1,
            // plus one when a pseudo message heads the file. There is
            // nothing to skip over when the next sequential read is
            // already the last indexed message.
            let pseudo_offset = if self.saw_pseudo { 1 } else { 0 };
            let r = if messages_count > 0
                && self.idx_seq + pseudo_offset != messages_count
            {
                *skipped = true;
                self.seek_to_idx_seq(messages_count)?
            } else {
                true
            };
            *partial = false;
            r
        };

        if !seek_result {
            // The offset was stale; read sequentially from here on
            *partial = false;
        }
        Ok(true)
    }
}

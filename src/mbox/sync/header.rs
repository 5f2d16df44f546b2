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

//! Per-message header handling: decide whether a header is rewritten in
//! place, deferred as dirty, moved backward into expunged space, or batched
//! into a rewrite window.

use std::os::unix::fs::FileExt;

use chrono::prelude::*;

use super::defs::*;
use crate::index::MailFlags;
use crate::mbox::model::*;
use crate::mbox::rewrite::{self, RewriteFit};
use crate::support::error::Error;

impl SyncContext {
    /// The `(uid_validity, uid_last)` pair to embed if this message's
    /// rewrite must carry the folder baseline, i.e. when it is the pseudo
    /// message, the first message, or about to become the first message.
    pub(super) fn base_values_for(
        &mut self,
        ctx: &MailContext,
    ) -> Option<(u32, u32)> {
        if !ctx.pseudo && 1 != ctx.seq && !self.dest_first_mail {
            return None;
        }

        Some(self.base_pair())
    }

    /// The baseline values themselves, inventing a UID validity if the
    /// folder never had one.
    pub(super) fn base_pair(&mut self) -> (u32, u32) {
        if 0 == self.base_uid_validity {
            self.base_uid_validity = if self.view.header().uid_validity != 0 {
                self.view.header().uid_validity
            } else {
                Utc::now().timestamp() as u32
            };
        }

        (self.base_uid_validity, self.next_uid.saturating_sub(1))
    }

    /// Fold the index's truth and the pending sync records into the mail
    /// before its header is regenerated.
    ///
    /// When the index record is dirty, the disk flags are stale and the
    /// index's flag and keyword state wins.
    fn update_header(&mut self, ctx: &mut MailContext) {
        if let Some(rec) = self.view.lookup(ctx.mail.idx_seq).cloned() {
            if rec.flags.contains(MailFlags::DIRTY) {
                ctx.mail.flags = (rec.flags & MailFlags::FLAGS_MASK)
                    | (ctx.mail.flags & MailFlags::RECENT);
                ctx.mail.keywords = rec.keywords;
            }
        }

        let _ = self.apply_index_syncs(&mut ctx.mail);
    }

    /// Handle a non-expunged message.
    pub(super) fn handle_header(
        &mut self,
        ctx: &mut MailContext,
    ) -> Result<(), Error> {
        let fitted;

        if self.expunged_space > 0 && 0 == self.need_space_seq {
            // Move the header backwards to fill expunged space
            let move_diff = -(self.expunged_space as i64);

            let orig_from_offset = ctx.mail.from_offset;
            if self.dest_first_mail {
                // This mail moves to the beginning of the file; its
                // leading separator newline is already counted in
                // expunged_space.
                let skip = if self.first_mail_crlf_expunged { 2 } else { 1 };
                ctx.mail.from_offset += skip;
                ctx.from_line.drain(..skip as usize);
                self.first_mail_sep_pending = false;
            }

            self.update_header(ctx);
            let base = self.base_values_for(ctx);
            let fit = rewrite::try_rewrite(
                &self.file,
                ctx,
                move_diff,
                base,
                &self.view,
                &self.tx,
                self.config.keep_recent,
            )?;

            match fit {
                RewriteFit::Fitted { uid_last_offset } => {
                    // Rewrite successful; put the From-line at the new
                    // location too.
                    ctx.mail.from_offset =
                        (ctx.mail.from_offset as i64 + move_diff) as u64;
                    ctx.mail.offset =
                        (ctx.mail.offset as i64 + move_diff) as u64;
                    self.file
                        .write_all_at(&ctx.from_line, ctx.mail.from_offset)?;

                    if let Some(off) = uid_last_offset {
                        self.note_base_written(off);
                    }
                    fitted = true;
                },
                RewriteFit::NoSpace => {
                    if self.dest_first_mail {
                        // Not enough space; move the offset back so
                        // seeking into it doesn't fail.
                        ctx.mail.from_offset = orig_from_offset;
                    }
                    fitted = false;
                },
            }
        } else if ctx.need_rewrite || !self.syncs.is_empty() {
            self.update_header(ctx);
            if self.delay_writes {
                // Mark it dirty and do it later
                ctx.dirty = true;
                return Ok(());
            }

            let base = self.base_values_for(ctx);
            match rewrite::try_rewrite(
                &self.file,
                ctx,
                0,
                base,
                &self.view,
                &self.tx,
                self.config.keep_recent,
            )? {
                RewriteFit::Fitted { uid_last_offset } => {
                    if let Some(off) = uid_last_offset {
                        self.note_base_written(off);
                    }
                    fitted = true;
                },
                RewriteFit::NoSpace => fitted = false,
            }
        } else {
            // Nothing to do
            return Ok(());
        }

        if !fitted && 0 == self.need_space_seq {
            // First mail with no space to write it
            self.need_space_seq = self.seq;
            self.space_diff = 0;

            if self.expunged_space > 0 {
                // Describe the expunged gap with a placeholder record so
                // the batch rewrite knows how much room precedes the
                // window. When the window will land at the start of the
                // file, the separator bytes already absorbed into
                // expunged_space must not be double-counted.
                let dest_skip = if self.dest_first_mail {
                    if self.first_mail_crlf_expunged {
                        2
                    } else {
                        1
                    }
                } else {
                    0
                };

                let mut gap = MailRecord::default();
                gap.flags = MailFlags::EXPUNGED;
                gap.from_offset =
                    ctx.mail.from_offset + dest_skip - self.expunged_space;
                gap.offset = gap.from_offset;
                gap.space = self.expunged_space as i64;

                self.space_diff = self.expunged_space as i64;
                self.expunged_space = 0;

                self.need_space_seq -= 1;
                self.mails.push(gap);
            }
        }
        Ok(())
    }

    /// Record that an X-IMAP(base) header was just written whose uid-last
    /// field sits at `offset`.
    pub(super) fn note_base_written(&mut self, offset: u64) {
        self.base_uid_last = self.next_uid.saturating_sub(1);
        self.base_uid_last_offset = offset;
    }

    /// Handle an expunged message: turn its whole span into reclaimable
    /// space.
    pub(super) fn handle_expunge(&mut self, ctx: &mut MailContext) {
        ctx.mail.flags = MailFlags::EXPUNGED;
        ctx.mail.offset = ctx.mail.from_offset;
        ctx.mail.space = (ctx.body_offset - ctx.mail.from_offset
            + ctx.mail.body_size) as i64;
        ctx.mail.body_size = 0;
        ctx.mail.uid = 0;

        if 1 == self.seq {
            // Expunging the first message: absorb the next message's
            // separator newline too, since it will become the first.
            ctx.mail.space += 1;
            if ctx.crlf {
                ctx.mail.space += 1;
                self.first_mail_crlf_expunged = true;
            }
            self.first_mail_sep_pending = true;

            // The uid-last offset pointed into this message
            self.base_uid_last_offset = 0;
        } else if self.first_mail_sep_pending {
            // The separator at the head of this span was already absorbed
            // by the first message's expunge.
            let skip = if self.first_mail_crlf_expunged { 2 } else { 1 };
            ctx.mail.space -= skip;
            ctx.mail.from_offset += skip as u64;
            ctx.mail.offset += skip as u64;
            self.first_mail_sep_pending = false;
        }

        self.expunged_space += ctx.mail.space as u64;
    }
}

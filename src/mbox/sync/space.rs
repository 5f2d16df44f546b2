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

//! The space planner.
//!
//! While a rewrite window is open, every message that passes under the
//! cursor joins it: spare header padding counts toward the cumulative
//! `space_diff`, needed growth counts against it, and expunged messages
//! contribute their whole span. Once the balance reaches zero the window is
//! flushed as one batch rewrite. A window still open at end of file is
//! settled by growing the file; leftover expunged space at end of file is
//! reclaimed by truncation.

use std::os::unix::fs::FileExt;

use chrono::prelude::*;
use log::error;

use super::defs::*;
use crate::mbox::from_line;
use crate::mbox::rewrite::{self, WindowRewrite};
use crate::support::error::Error;
use crate::support::hostname::HOSTNAME;

/// The text c-client writes into pseudo messages; kept byte-identical so
/// other mbox software recognises it.
const PSEUDO_MESSAGE_BODY: &str = "\
This text is part of the internal format of your mail folder, and is not\n\
a real message.  It is created automatically by the mail system software.\n\
If deleted, important folder data will be lost, and it will be re-created\n\
with the data reset to initial values.\n";

impl SyncContext {
    /// Account for `ctx` in the open rewrite window, flushing the window if
    /// its space balance has been settled.
    pub(super) fn handle_missing_space(
        &mut self,
        ctx: &mut crate::mbox::model::MailContext,
    ) -> Result<(), Error> {
        if !ctx.mail.expunged() {
            // The estimate must match what the batch rewrite will emit,
            // X-IMAPbase line included, or the window balance comes out
            // wrong.
            let first_live = self.mails.iter().all(|m| m.expunged());
            let window_start = self
                .mails
                .first()
                .map(|m| m.from_offset)
                .unwrap_or(ctx.mail.from_offset);
            let base = if ctx.pseudo
                || 1 == ctx.seq
                || (first_live && 0 == window_start)
            {
                Some(self.base_pair())
            } else {
                None
            };

            let old_len = (ctx.body_offset - ctx.hdr_offset) as i64;
            let required = rewrite::required_block_len(
                ctx,
                base,
                &self.view,
                &self.tx,
                self.config.keep_recent,
            ) as i64;
            ctx.mail.space = old_len - required;
        }
        self.mails.push(ctx.mail.clone());

        self.space_diff += ctx.mail.space;
        if self.space_diff < 0 {
            if self.expunged_space > 0 {
                // The expunged surplus was folded into the window when it
                // opened; this member is that same gap.
                debug_assert!(self.expunged_space as i64 == ctx.mail.space);
                self.expunged_space = 0;
            }
            return Ok(());
        }

        // We have enough space now
        let window_len = (self.seq - self.need_space_seq + 1) as u64;
        let end_offset;
        let move_diff;
        let include_last_body;

        if ctx.mail.expunged() {
            // This expunged message settled the balance. Consume as much
            // of its span as the window needs plus headroom, but don't
            // waste an enormous span entirely on padding.
            let span = ctx.mail.space as u64;
            let extra_space = self.config.header_padding * window_len;
            let needed_space = span - self.space_diff as u64;

            if self.space_diff as u64 > needed_space + extra_space {
                move_diff = (needed_space + extra_space) as i64;
                self.expunged_space = span - move_diff as u64;
            } else {
                move_diff = span as i64;
                self.expunged_space = 0;
            }

            self.mails.pop();
            end_offset = ctx.mail.from_offset;
            include_last_body = true;
        } else {
            // This message's headers gave enough space; rewriting stops at
            // the end of its header block and its body stays put.
            self.expunged_space = 0;
            end_offset = ctx.body_offset;
            move_diff = 0;
            include_last_body = false;
        }

        self.flush_window(end_offset, move_diff, include_last_body)?;

        // ctx's offsets are stale after the rewrite; the caller re-seeks
        // before using the reader again.
        Ok(())
    }

    /// Rewrite the accumulated window and reset the planner.
    fn flush_window(
        &mut self,
        end_offset: u64,
        move_diff: i64,
        include_last_body: bool,
    ) -> Result<(), Error> {
        let base = if self.need_space_seq <= 1
            || self.mails.first().map_or(false, |m| 0 == m.from_offset)
        {
            // The window covers the head of the file, so the rewrite must
            // carry the folder baseline.
            Some(self.base_pair())
        } else {
            None
        };

        let uid_last_offset = rewrite::rewrite_window(
            WindowRewrite {
                file: &self.file,
                file_size: self.file_size,
                mails: &mut self.mails,
                first_seq: self.need_space_seq,
                end_offset,
                move_diff,
                include_last_body,
                keep_recent: self.config.keep_recent,
                base,
            },
            &self.view,
            &mut self.tx,
        )?;
        if let Some(off) = uid_last_offset {
            self.note_base_written(off);
        }

        self.update_from_offsets();

        self.need_space_seq = 0;
        self.space_diff = 0;
        self.mails.clear();
        Ok(())
    }

    /// Store the new from-offsets of rewritten window members in the index.
    pub(super) fn update_from_offsets(&mut self) {
        for mail in &self.mails {
            if 0 == mail.idx_seq || mail.expunged() {
                continue;
            }

            self.moved_offsets = true;
            self.tx.update_from_offset(mail.idx_seq, mail.from_offset);
        }
    }

    /// Settle whatever the pass left open once the reader hit end of file:
    /// grow the file under a still-open window, truncate away trailing
    /// expunged space, and re-create the pseudo message if the file became
    /// empty.
    pub(super) fn handle_eof_updates(&mut self) -> Result<(), Error> {
        if !self.input_eof {
            debug_assert!(0 == self.need_space_seq);
            debug_assert!(0 == self.expunged_space);
            return Ok(());
        }

        let mut file_size = self.stat_size()?;
        if file_size < self.input_offset {
            error!(
                "{} File size unexpectedly shrank in mbox file ({} < {})",
                self.log_prefix, file_size, self.input_offset
            );
            return Err(Error::MboxShrank);
        }
        let mut trailer_size = file_size - self.input_offset;
        debug_assert!(trailer_size <= 2);

        if self.need_space_seq != 0 {
            debug_assert!(self.writable);
            debug_assert!(self.space_diff < 0);

            let window_len = (self.seq - self.need_space_seq + 1) as u64;
            self.space_diff -= (self.config.header_padding * window_len) as i64;

            debug_assert!(
                self.expunged_space as i64 <= -self.space_diff
            );
            self.space_diff += self.expunged_space as i64;
            self.expunged_space = 0;
            debug_assert!(self.space_diff < 0);

            let grow = (-self.space_diff) as u64;
            if let Err(e) = self.file.set_len(file_size + grow) {
                let _ = self.file.set_len(file_size);
                return Err(e.into());
            }
            self.file_size = file_size + grow;

            self.flush_window(file_size, grow as i64, true)?;
            file_size += grow;
        }

        if self.expunged_space > 0 {
            debug_assert!(self.writable);

            if file_size == self.expunged_space {
                // Everything was deleted; there is no trailer left either.
                trailer_size = 0;
            }

            // Slide the trailer over the expunged span, then cut the file
            let offset = file_size - self.expunged_space - trailer_size;
            crate::support::file_ops::move_within(
                &self.file,
                offset,
                offset + self.expunged_space,
                trailer_size,
            )?;
            self.file.set_len(offset + trailer_size)?;
            self.file_size = offset + trailer_size;

            if 0 == offset {
                self.write_pseudo()?;
            }

            self.expunged_space = 0;
        }

        Ok(())
    }

    /// Write a fresh pseudo message into the (now empty) file.
    fn write_pseudo(&mut self) -> Result<(), Error> {
        debug_assert!(self.writable);

        let mut uid_validity = if self.base_uid_validity != 0 {
            self.base_uid_validity
        } else {
            self.view.header().uid_validity
        };
        if 0 == uid_validity {
            uid_validity = Utc::now().timestamp() as u32;
        }

        let now = Utc::now();
        let uid_last = self.next_uid.saturating_sub(1);
        let text = format!(
            "{}Date: {}\n\
             From: Mail System Internal Data <MAILER-DAEMON@{host}>\n\
             Subject: DON'T DELETE THIS MESSAGE -- FOLDER INTERNAL DATA\n\
             Message-ID: <{stamp}@{host}>\n\
             X-IMAP: {validity} {uid_last:010}\n\
             Status: RO\n\
             \n\
             {body}\n",
            from_line::generate("MAILER-DAEMON", now),
            now.to_rfc2822(),
            host = &*HOSTNAME,
            stamp = now.timestamp(),
            validity = uid_validity,
            uid_last = uid_last,
            body = PSEUDO_MESSAGE_BODY,
        );

        if let Err(e) = self.file.write_all_at(text.as_bytes(), 0) {
            if Some(nix::libc::ENOSPC) == e.raw_os_error() {
                // Out of disk space; truncate back to empty rather than
                // leaving a torn pseudo message.
                let _ = self.file.set_len(0);
            }
            return Err(e.into());
        }
        self.file_size = text.len() as u64;

        self.base_uid_validity = uid_validity;
        self.base_uid_last = uid_last;
        // Not worth computing; the next sync re-reads it
        self.base_uid_last_offset = 0;
        Ok(())
    }
}

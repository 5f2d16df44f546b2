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

//! The sync driver: partial/full selection, the reconciliation loop, the
//! three-attempt retry ladder, and finalisation.

use std::os::unix::fs::{FileExt, MetadataExt};
use std::time::Duration;

use chrono::prelude::*;
use log::{error, warn};

use super::defs::*;
use super::index_sync::RecMatch;
use crate::index::Transaction;
use crate::mbox::Mbox;
use crate::support::error::Error;
use crate::support::file_ops;
use crate::support::lock::{LockType, MboxLock};

impl SyncContext {
    /// One pass over the mbox.
    ///
    /// Returns false when the pass must be redone from scratch (UID
    /// ordering broke under a partial sync, or the UID space ran out).
    fn sync_loop(&mut self, partial: &mut bool) -> Result<bool, Error> {
        let messages_count = self.view.messages_count();

        // Always start from the top so the X-IMAP(base) baseline is
        // re-read.
        self.seek_to_start()?;

        if self.renumber_uids {
            // All old records die; every message is appended anew under a
            // fresh validity.
            while self.idx_seq <= messages_count {
                self.tx.expunge(self.idx_seq);
                self.idx_seq += 1;
            }
            self.base_uid_validity = Utc::now().timestamp() as u32;
        }

        let mut skipped_mails = false;
        let mut uids_broken = false;

        while let Some(mut ctx) = self.read_next_mail()? {
            let mut uid = ctx.mail.uid;

            if 1 == ctx.seq
                && !self.renumber_uids
                && self.base_uid_validity != 0
                && self.view.header().uid_validity != 0
                && self.base_uid_validity != self.view.header().uid_validity
            {
                error!(
                    "{} UIDVALIDITY changed ({} -> {}) in mbox file",
                    self.log_prefix,
                    self.view.header().uid_validity,
                    self.base_uid_validity,
                );
                return Err(Error::UidValidityChanged);
            }

            if ctx.uid_broken && *partial {
                // UID ordering problems; resync everything to make sure
                // we get everything right.
                if !self.sync_dirty {
                    error!(
                        "{} UIDs broken with partial sync in mbox file",
                        self.log_prefix
                    );
                }
                self.sync_dirty = true;
                return Ok(false);
            }
            if ctx.uid_broken {
                uids_broken = true;
            }

            if ctx.pseudo {
                uid = 0;
            }

            let mut rec = None;
            let mut broken = false;
            if uid != 0 {
                match self.read_index_rec(uid)? {
                    RecMatch::Found(r) => rec = Some(r),
                    RecMatch::New => (),
                    RecMatch::Broken => {
                        broken = true;
                        uid = 0;
                        ctx.mail.uid = 0;
                    },
                }
            }

            if !broken
                && 0 == uid
                && !ctx.pseudo
                && (self.delay_writes || self.idx_seq <= messages_count)
            {
                // If we can't use/store X-UID headers, message identities
                // come from MD5 sums instead. Also pick up existing sums
                // even when we are able to write X-UIDs.
                self.save_md5 = true;

                if let Some(r) = self.find_index_md5(ctx.hdr_md5)? {
                    uid = r.uid;
                    ctx.mail.uid = r.uid;
                    rec = Some(r);
                }
            }

            // Pull all sync records for this message. The pseudo message
            // pulls just the stream lookahead so partial seeking can jump
            // from it.
            let mut expunged = self
                .read_index_syncs(if ctx.pseudo { 1 } else { uid })?;
            if ctx.pseudo {
                // Whatever was buffered was for the next message
                expunged = false;
            } else if rec.is_none() {
                // Message wasn't found in the index; everything from here
                // on must be read, no skipping.
                *partial = false;
            }

            if 0 == uid && !ctx.pseudo {
                // Missing/broken X-UID; all the rest of the mails need
                // new UIDs.
                while self.idx_seq <= messages_count {
                    self.tx.expunge(self.idx_seq);
                    self.idx_seq += 1;
                }

                if u32::MAX == self.next_uid {
                    // Out of UIDs. This shouldn't happen normally, so just
                    // get it fixed without crashing.
                    error!(
                        "{} Out of UIDs, renumbering them in mbox file",
                        self.log_prefix
                    );
                    self.renumber_uids = true;
                    self.sync_dirty = true;
                    return Ok(false);
                }

                ctx.need_rewrite = true;
                ctx.mail.uid = self.next_uid;
                self.next_uid += 1;
                self.prev_msg_uid = ctx.mail.uid;
            }

            if !ctx.pseudo {
                ctx.mail.idx_seq = self.idx_seq;
            }

            if let Some(ref r) = rec {
                if !self.delay_writes
                    && !*partial
                    && r.flags.contains(crate::index::MailFlags::DIRTY)
                {
                    // A full writing pass regenerates stale headers from
                    // the index's state. Partial passes leave dirty
                    // messages alone.
                    ctx.need_rewrite = true;
                }
            }

            if !expunged {
                self.handle_header(&mut ctx)?;
                self.dest_first_mail = false;
            } else {
                self.handle_expunge(&mut ctx);
            }

            if !ctx.pseudo {
                if !expunged {
                    self.update_index(&mut ctx, rec.as_ref())?;
                } else if rec.is_some() {
                    self.tx.expunge(self.idx_seq);
                }
                self.idx_seq += 1;
            }

            self.advance_past_body(&ctx);
            let offset = self.input_offset;

            if self.need_space_seq != 0 {
                self.handle_missing_space(&mut ctx)?;
                self.seek(offset)?;
            } else if self.expunged_space > 0 {
                if !expunged {
                    // Move the body backward to fill the expunged space
                    file_ops::move_within(
                        &self.file,
                        ctx.body_offset - self.expunged_space,
                        ctx.body_offset,
                        ctx.mail.body_size,
                    )?;
                    self.seek(offset)?;
                }
            } else if *partial {
                let next_uid = ctx.mail.uid.max(uid) + 1;
                if !self.partial_seek_next(
                    next_uid,
                    partial,
                    &mut skipped_mails,
                )? {
                    break;
                }
            }
        }

        if self.input_eof {
            // The rest of the messages in the index don't exist anymore
            while self.idx_seq <= messages_count {
                self.tx.expunge(self.idx_seq);
                self.idx_seq += 1;
            }
        }

        if !skipped_mails {
            self.sync_dirty = false;
        }
        if uids_broken && self.delay_writes {
            // Once we get around to writing the changes we'll need a full
            // sync to avoid the broken-UID error above.
            self.sync_dirty = true;
        }
        Ok(true)
    }

    /// Run the pass, retrying in full mode when a partial pass turns out
    /// to be unsafe, then settle end-of-file work.
    fn sync_do(&mut self, flags: SyncFlags) -> Result<(), Error> {
        let st = self.file.metadata()?;
        self.orig_size = st.len();
        self.orig_mtime = st.mtime();

        let hdr = self.view.header().clone();
        let mut partial;
        if flags.contains(SyncFlags::FORCE_FULL) {
            // Forcing a full sync; assume the file has changed
            partial = false;
            self.sync_dirty = true;
        } else if st.mtime() as u32 == hdr.sync_stamp
            && st.len() == hdr.sync_size
        {
            // File is fully synced
            partial = true;
            self.sync_dirty = false;
        } else if flags.contains(SyncFlags::UNDIRTY)
            || st.len() == hdr.sync_size
        {
            // Do full syncing. Always do this if the file size hasn't
            // changed but the timestamp has; someone probably modified a
            // header and we want to know about it.
            partial = false;
            self.sync_dirty = true;
        } else {
            // See if we can delay syncing the whole file; partial syncing
            // normally notices only expunges and appends.
            partial = true;
            self.sync_dirty = true;
        }

        self.restart();
        let mut done = false;
        for _ in 0..3 {
            if self.sync_loop(&mut partial)? {
                done = true;
                break;
            }

            // Partial syncing didn't work (or we ran out of UIDs); redo
            // the whole thing.
            debug_assert!(self.sync_dirty);
            self.restart();
            partial = false;
        }
        if !done {
            return Err(Error::SyncRetriesExhausted);
        }

        self.handle_eof_updates()?;

        // The only records left can be appends (and their updates) that
        // weren't synced for some reason; the pass above already
        // overwrote whatever they describe.
        self.syncs.clear();
        self.sync_rec = None;

        self.update_index_header()
    }

    /// Update the index header fields at the end of a successful pass.
    fn update_index_header(&mut self) -> Result<(), Error> {
        let mut st = self.file.metadata()?;

        if self.moved_offsets
            && (st.len() == self.view.header().sync_size
                || st.len() == self.orig_size)
        {
            // Messages moved inside the file without its size changing.
            // If the mtime doesn't change either, other processes cannot
            // know the file changed, so stall until it advances. This is
            // rare enough for the sleeping not to matter.
            while st.mtime() == self.orig_mtime {
                std::thread::sleep(Duration::from_millis(500));

                let now = Utc::now();
                let tv = nix::sys::time::TimeVal::new(now.timestamp(), 0);
                nix::sys::stat::utimes(self.path.as_path(), &tv, &tv)?;

                st = self.file.metadata()?;
            }
        }

        // The only reason not to have a UID validity at this point is a
        // completely empty file; make one up if it is needed later.
        debug_assert!(self.base_uid_validity != 0 || 0 == st.len());

        let hdr = self.view.header().clone();
        if self.base_uid_validity != hdr.uid_validity
            || 0 == self.base_uid_validity
        {
            if 0 == self.base_uid_validity {
                self.base_uid_validity = if hdr.uid_validity != 0 {
                    hdr.uid_validity
                } else {
                    Utc::now().timestamp() as u32
                };
            }
            if self.base_uid_validity != hdr.uid_validity {
                self.tx.set_uid_validity(self.base_uid_validity);
            }
        }

        if self.input_eof && self.next_uid != hdr.next_uid {
            debug_assert!(self.next_uid != 0);
            self.tx.set_next_uid(self.next_uid);
        }

        if st.mtime() as u32 != hdr.sync_stamp && !self.sync_dirty {
            self.tx.set_sync_stamp(st.mtime() as u32);
        }
        if st.len() != hdr.sync_size && !self.sync_dirty {
            self.tx.set_sync_size(st.len());
        }

        self.dirty_stamp = st.mtime();
        self.dirty_size = st.len();
        Ok(())
    }

    /// Patch the 10-digit uid-last field of the X-IMAP(base) header in
    /// place.
    ///
    /// The bytes on disk are read back first and must be exactly the value
    /// previously seen; anything else means the offset no longer points
    /// where we think it does, and writing there would corrupt the file.
    pub(super) fn rewrite_base_uid_last(&mut self) -> Result<(), Error> {
        debug_assert!(self.base_uid_last_offset != 0);

        let mut buf = [0u8; 10];
        if let Err(e) =
            self.file.read_exact_at(&mut buf, self.base_uid_last_offset)
        {
            if std::io::ErrorKind::UnexpectedEof == e.kind() {
                error!(
                    "{} X-IMAPbase uid-last unexpectedly points outside \
                     mbox file",
                    self.log_prefix
                );
                return Err(Error::UidLastLost);
            }
            return Err(e.into());
        }

        let on_disk = if buf.iter().all(u8::is_ascii_digit) {
            std::str::from_utf8(&buf)
                .ok()
                .and_then(|s| s.parse::<u32>().ok())
        } else {
            None
        };
        if Some(self.base_uid_last) != on_disk {
            error!(
                "{} X-IMAPbase uid-last unexpectedly lost in mbox file",
                self.log_prefix
            );
            return Err(Error::UidLastLost);
        }

        let value = format!("{:010}", self.next_uid - 1);
        self.file
            .write_all_at(value.as_bytes(), self.base_uid_last_offset)?;
        self.base_uid_last = self.next_uid - 1;
        Ok(())
    }
}

impl Mbox {
    /// Cheap change detection: compare the file's (mtime, size) against
    /// what the index recorded at the end of the last sync.
    ///
    /// With `leave_dirty` set, a file that is merely known-dirty (flag
    /// bytes stale, index authoritative) reports unchanged as long as it
    /// has not moved since the dirtiness was observed.
    pub fn has_changed(&mut self, leave_dirty: bool) -> Result<bool, Error> {
        let st = std::fs::metadata(&self.path)?;
        let hdr = self.index.header();

        if st.mtime() as u32 == hdr.sync_stamp && st.len() == hdr.sync_size {
            // Fully synced
            self.sync_dirty = false;
            return Ok(false);
        }

        if !self.sync_dirty || !leave_dirty {
            self.sync_dirty = true;
            return Ok(true);
        }

        Ok(st.mtime() != self.dirty_stamp || st.len() != self.dirty_size)
    }

    /// Synchronise the mbox file with the index, applying all pending
    /// sync records and repairing headers along the way.
    pub fn sync(&mut self, flags: SyncFlags) -> Result<(), Error> {
        let delay_writes = self.read_only
            || (self.config.delay_writes
                && !flags.contains(SyncFlags::REWRITE));

        let mut changed = if flags
            .intersects(SyncFlags::HEADER_ONLY | SyncFlags::FORCE_FULL)
        {
            true
        } else {
            self.has_changed(!flags.contains(SyncFlags::UNDIRTY))?
        };

        if flags.contains(SyncFlags::LOCK_READING) {
            // Only wanted a read lock over the pre-check; if the mbox
            // hasn't been modified there is nothing to sync under it.
            let file = self.open_file()?;
            let _read_lock = MboxLock::acquire(&file, LockType::Shared)?;
            if !changed && !self.index.has_pending() {
                return Ok(());
            }
            // Something to do; re-lock for writing below
        }

        let mut ctx;
        let mut lock;
        loop {
            let file = self.open_file()?;
            lock = if changed {
                // Most likely modifying the mbox; lock it for writing
                // immediately. The mbox must be locked before index
                // syncing starts to avoid deadlocks.
                let lock_type = if self.read_only {
                    LockType::Shared
                } else {
                    LockType::Exclusive
                };
                Some(MboxLock::acquire(&file, lock_type)?)
            } else {
                None
            };

            if !changed && !self.index.has_pending() {
                // Nothing to do; the index may still want to roll its log
                // up though, so commit rather than roll back.
                let session = self.index.sync_begin();
                return self.index.sync_commit(session);
            }

            // NB LAST_COMMIT needs no special handling here: this index
            // replays its whole pending queue on every sync.
            let session = self.index.sync_begin();
            let view = self.index.view();
            let tx = Transaction::new(&view);

            ctx = SyncContext {
                file,
                writable: !self.read_only,
                path: self.path.clone(),
                log_prefix: self.log_prefix.clone(),
                config: self.config.clone(),
                view,
                tx,
                session,
                input_offset: 0,
                input_eof: false,
                file_size: 0,
                seq: 0,
                idx_seq: 1,
                prev_msg_uid: 0,
                next_uid: 0,
                idx_next_uid: 0,
                saw_pseudo: false,
                base_uid_validity: 0,
                base_uid_last: 0,
                base_uid_last_offset: 0,
                mails: Vec::new(),
                syncs: Vec::new(),
                sync_rec: None,
                need_space_seq: 0,
                space_diff: 0,
                expunged_space: 0,
                dest_first_mail: true,
                first_mail_crlf_expunged: false,
                first_mail_sep_pending: false,
                moved_offsets: false,
                renumber_uids: false,
                delay_writes,
                sync_dirty: self.sync_dirty,
                save_md5: self.save_md5,
                orig_mtime: 0,
                orig_size: 0,
                dirty_stamp: 0,
                dirty_size: 0,
            };
            ctx.restart();

            if !changed && delay_writes {
                // If only flag changes are pending we don't need to open
                // the mbox data at all.
                ctx.read_index_syncs(1)?;
                if ctx.sync_rec.is_none() {
                    let SyncContext { tx, session, .. } = ctx;
                    self.index.commit(tx)?;
                    return self.index.sync_commit(session);
                }
            }

            if lock.is_some() {
                break;
            }

            // We have something to do but no lock; restart with locking
            // to avoid reconciling a file someone else is rewriting.
            let SyncContext { session, .. } = ctx;
            self.index.sync_rollback(session);
            changed = true;
        }

        let mut ret = ctx.sync_do(flags);

        // Whatever happened, remember the dirtiness state the pass left
        self.sync_dirty = ctx.sync_dirty;
        self.save_md5 = ctx.save_md5;
        if ret.is_ok() {
            self.dirty_stamp = ctx.dirty_stamp;
            self.dirty_size = ctx.dirty_size;
        }

        if ret.is_ok() {
            let tx = std::mem::replace(
                &mut ctx.tx,
                Transaction::new(&ctx.view),
            );
            if let Err(e) = self.index.commit(tx) {
                ret = Err(e);
            }
        }

        let session = std::mem::take(&mut ctx.session);
        match ret {
            Ok(()) => {
                if let Err(e) = self.index.sync_commit(session) {
                    ret = Err(e);
                }
            },
            Err(_) => self.index.sync_rollback(session),
        }

        if let Err(Error::UidValidityChanged) = ret {
            self.index.mark_corrupted();
        }

        if ret.is_ok()
            && ctx.base_uid_last != ctx.next_uid.wrapping_sub(1)
            && !ctx.delay_writes
            && ctx.base_uid_last_offset != 0
        {
            // Patch uid-last in the X-IMAPbase header if we've seen it
            // (i.e. the file isn't empty)
            ret = ctx.rewrite_base_uid_last();
        }

        if let Some(lock) = lock.as_mut() {
            if LockType::Exclusive == lock.lock_type() {
                // Drop to a read lock before releasing so a waiting
                // reader isn't briefly able to grab a write lock first.
                if let Err(e) = lock.convert(LockType::Shared) {
                    warn!(
                        "{} Failed to downgrade mbox lock: {}",
                        self.log_prefix, e
                    );
                }
            }
        }
        drop(lock);

        ret
    }
}

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

//! Types shared between the mbox parser, rewriter, and sync machinery.

use crate::index::MailFlags;

/// Bytes of padding granted to each rewritten message so that future flag
/// changes can usually be absorbed without shifting the file.
pub const MBOX_HEADER_PADDING: u64 = 64;

/// Everything the sync engine tracks about one message in the mbox.
#[derive(Clone, Debug, Default)]
pub struct MailRecord {
    /// Assigned UID, or 0 for none/broken/pseudo/expunged.
    pub uid: u32,
    pub flags: MailFlags,
    /// Sorted keyword ids.
    pub keywords: Vec<u32>,
    /// Byte offset of the From-line span. For every message but the first
    /// this span starts with the separator newline left by the previous
    /// message.
    pub from_offset: u64,
    /// Byte offset of the header block, or of the From-line span for an
    /// expunged record.
    pub offset: u64,
    pub body_size: u64,
    /// Spare room in the header block: `old_block_len - required_block_len`,
    /// negative when the header must grow. For an expunged record this is
    /// the full reclaimable span instead.
    pub space: i64,
    /// 1-based position in the index, 0 if not (yet) indexed.
    pub idx_seq: u32,
    /// The message is the IMAP-internal pseudo message.
    pub pseudo: bool,
}

impl MailRecord {
    pub fn expunged(&self) -> bool {
        self.flags.contains(MailFlags::EXPUNGED)
    }
}

/// The `X-IMAP`/`X-IMAPbase` baseline parsed out of the first message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImapBase {
    pub uid_validity: u32,
    pub uid_last: u32,
    /// Absolute file offset of the 10-digit uid-last field.
    pub uid_last_offset: u64,
}

/// Parse state for the message currently under inspection.
///
/// Created by the reader for each message, consumed by the header handler
/// and index updater, and invalidated once the cursor moves on.
#[derive(Clone, Debug, Default)]
pub struct MailContext {
    pub seq: u32,
    pub mail: MailRecord,
    pub pseudo: bool,
    /// The message carries no `O` in its Status header.
    pub recent: bool,
    /// Set when a pending change was deferred index-side only.
    pub dirty: bool,
    /// The header must be rewritten (missing X-UID, missing `O`, ...).
    pub need_rewrite: bool,
    /// The X-UID violates UID ordering.
    pub uid_broken: bool,
    pub hdr_offset: u64,
    pub body_offset: u64,
    /// Trusted Content-Length, if the header had a valid one.
    pub content_length: Option<u64>,
    /// MD5 sum over the invariant (unmanaged) headers.
    pub hdr_md5: [u8; 16],
    /// The raw From-line span, including the leading separator newline for
    /// non-first messages.
    pub from_line: Vec<u8>,
    /// All header lines the rewriter must preserve byte-for-byte.
    pub unmanaged_headers: Vec<u8>,
    /// The message uses CRLF line endings.
    pub crlf: bool,
    /// X-IMAP/X-IMAPbase values seen in this message's headers.
    pub imap_base: Option<ImapBase>,
}

/// Per-mailbox sync policy.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Padding appended to rewritten headers.
    pub header_padding: u64,
    /// Defer header writes: record changes index-side and mark messages
    /// dirty instead of touching the file.
    pub delay_writes: bool,
    /// Leave the `\Recent` state alone instead of writing `O` Status flags.
    pub keep_recent: bool,
    /// Store header MD5 sums for every message, not only when X-UID is
    /// unusable.
    pub save_md5: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            header_padding: MBOX_HEADER_PADDING,
            delay_writes: false,
            keep_recent: false,
            save_md5: false,
        }
    }
}

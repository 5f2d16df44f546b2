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

//! Header rewriting.
//!
//! A message's header block is regenerated rather than patched: the
//! unmanaged headers are preserved byte-for-byte and the managed headers
//! (`Status`, `X-Status`, `X-Keywords`, `X-UID`, `Content-Length`,
//! `X-IMAP`/`X-IMAPbase`) are emitted fresh from the reconciled mail state,
//! with trailing-space padding on the `X-UID` (or `X-IMAP`) line absorbing
//! any surplus room. An in-place rewrite succeeds only when the regenerated
//! block fits in the old block's span; otherwise the space planner batches
//! the message into a rewrite window and `rewrite_window()` relocates the
//! whole window at once.

use std::fs;
use std::os::unix::fs::FileExt;

use super::model::*;
use super::parse;
use crate::index::{IndexView, MailFlags, Transaction};
use crate::support::error::Error;
use crate::support::file_ops;

/// Everything needed to regenerate one message's header block.
pub struct HeaderTemplate<'a> {
    pub mail: &'a MailRecord,
    pub unmanaged: &'a [u8],
    pub body_size: u64,
    pub pseudo: bool,
    pub crlf: bool,
    /// Emit an `X-IMAP` (pseudo) or `X-IMAPbase` (first real message)
    /// header carrying these `(uid_validity, uid_last)` values.
    pub base: Option<(u32, u32)>,
}

/// A regenerated header block, without padding applied yet.
pub struct GeneratedHeader {
    pub bytes: Vec<u8>,
    /// Position where padding spaces are inserted.
    pad_insert: usize,
    /// Position of the 10-digit uid-last field, if one was emitted.
    uid_last_rel: Option<usize>,
}

impl GeneratedHeader {
    pub fn required_len(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Render the block padded out to exactly `target_len` bytes.
    ///
    /// Panics if the block does not fit; callers must check
    /// `required_len()` first.
    pub fn padded_to(&self, target_len: u64) -> Vec<u8> {
        let pad = target_len
            .checked_sub(self.bytes.len() as u64)
            .expect("padding header block it does not fit in") as usize;

        let mut out = Vec::with_capacity(target_len as usize);
        out.extend_from_slice(&self.bytes[..self.pad_insert]);
        out.resize(self.pad_insert + pad, b' ');
        out.extend_from_slice(&self.bytes[self.pad_insert..]);
        out
    }

    /// Offset of the uid-last field within the padded block.
    ///
    /// The field always precedes the padding point, so padding does not
    /// displace it.
    pub fn uid_last_rel(&self) -> Option<u64> {
        self.uid_last_rel.map(|r| r as u64)
    }
}

/// Regenerate the header block for `tpl`.
pub fn generate(
    tpl: &HeaderTemplate<'_>,
    view: &IndexView,
    tx: &Transaction,
    keep_recent: bool,
) -> GeneratedHeader {
    let eol: &[u8] = if tpl.crlf { b"\r\n" } else { b"\n" };
    let mail = tpl.mail;

    let mut bytes = Vec::with_capacity(tpl.unmanaged.len() + 256);
    bytes.extend_from_slice(tpl.unmanaged);

    let mut uid_last_rel = None;
    let mut base_line_pad = None;
    if let Some((uid_validity, uid_last)) = tpl.base {
        let name: &[u8] = if tpl.pseudo {
            b"X-IMAP: "
        } else {
            b"X-IMAPbase: "
        };
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(uid_validity.to_string().as_bytes());
        bytes.push(b' ');
        uid_last_rel = Some(bytes.len());
        bytes.extend_from_slice(format!("{:010}", uid_last).as_bytes());
        if tpl.pseudo {
            base_line_pad = Some(bytes.len());
        }
        bytes.extend_from_slice(eol);
    }

    if !mail.keywords.is_empty() {
        bytes.extend_from_slice(b"X-Keywords: ");
        for (ix, &id) in mail.keywords.iter().enumerate() {
            if ix > 0 {
                bytes.push(b' ');
            }
            bytes.extend_from_slice(
                tx.keyword_name(view, id).unwrap_or("").as_bytes(),
            );
        }
        bytes.extend_from_slice(eol);
    }

    let mut pad_insert = base_line_pad;
    if !tpl.pseudo && mail.uid != 0 {
        bytes.extend_from_slice(b"X-UID: ");
        bytes.extend_from_slice(mail.uid.to_string().as_bytes());
        pad_insert = Some(bytes.len());
        bytes.extend_from_slice(eol);
    }

    if !tpl.pseudo {
        bytes.extend_from_slice(b"Content-Length: ");
        bytes.extend_from_slice(tpl.body_size.to_string().as_bytes());
        if pad_insert.is_none() {
            pad_insert = Some(bytes.len());
        }
        bytes.extend_from_slice(eol);
    }

    let recent = mail.flags.contains(MailFlags::RECENT);
    let mut status = Vec::new();
    if mail.flags.contains(MailFlags::SEEN) || tpl.pseudo {
        status.push(b'R');
    }
    if tpl.pseudo || !recent || !keep_recent {
        status.push(b'O');
    }
    if !status.is_empty() {
        bytes.extend_from_slice(b"Status: ");
        bytes.extend_from_slice(&status);
        bytes.extend_from_slice(eol);
    }

    let mut xstatus = Vec::new();
    if mail.flags.contains(MailFlags::ANSWERED) {
        xstatus.push(b'A');
    }
    if mail.flags.contains(MailFlags::FLAGGED) {
        xstatus.push(b'F');
    }
    if mail.flags.contains(MailFlags::DELETED) {
        xstatus.push(b'D');
    }
    if mail.flags.contains(MailFlags::DRAFT) {
        xstatus.push(b'T');
    }
    if !xstatus.is_empty() {
        bytes.extend_from_slice(b"X-Status: ");
        bytes.extend_from_slice(&xstatus);
        bytes.extend_from_slice(eol);
    }

    // End-of-headers line. If nothing offered a padding point (pseudo
    // without base, pathologically), pad just before it: a run of spaces
    // forms a continuation line of the final header.
    let pad_insert = pad_insert.unwrap_or(bytes.len());
    bytes.extend_from_slice(eol);

    GeneratedHeader {
        bytes,
        pad_insert,
        uid_last_rel,
    }
}

/// Outcome of an in-place rewrite attempt.
pub enum RewriteFit {
    /// The header was rewritten. If an X-IMAP(base) header was emitted,
    /// carries the absolute offset of its uid-last field.
    Fitted { uid_last_offset: Option<u64> },
    /// The regenerated header does not fit the old block.
    NoSpace,
}

/// Attempt to rewrite the header block of the message described by `ctx` in
/// place, writing it `move_diff` bytes away from its current position.
///
/// The old block's span is the available room; `move_diff` shifts position
/// only. On failure nothing is written and `ctx.mail.space` records the
/// (negative) deficit.
pub fn try_rewrite(
    file: &fs::File,
    ctx: &mut MailContext,
    move_diff: i64,
    base: Option<(u32, u32)>,
    view: &IndexView,
    tx: &Transaction,
    keep_recent: bool,
) -> Result<RewriteFit, Error> {
    let old_len = ctx.body_offset - ctx.hdr_offset;
    let gen = generate(
        &HeaderTemplate {
            mail: &ctx.mail,
            unmanaged: &ctx.unmanaged_headers,
            body_size: ctx.mail.body_size,
            pseudo: ctx.pseudo,
            crlf: ctx.crlf,
            base,
        },
        view,
        tx,
        keep_recent,
    );

    if gen.required_len() > old_len {
        ctx.mail.space = old_len as i64 - gen.required_len() as i64;
        return Ok(RewriteFit::NoSpace);
    }

    let new_hdr_offset = (ctx.hdr_offset as i64 + move_diff) as u64;
    let block = gen.padded_to(old_len);
    file.write_all_at(&block, new_hdr_offset)?;

    ctx.mail.space = old_len as i64 - gen.required_len() as i64;
    Ok(RewriteFit::Fitted {
        uid_last_offset: gen.uid_last_rel().map(|r| new_hdr_offset + r),
    })
}

/// Compute how large the regenerated header block of `ctx` would be,
/// without writing anything.
pub fn required_block_len(
    ctx: &MailContext,
    base: Option<(u32, u32)>,
    view: &IndexView,
    tx: &Transaction,
    keep_recent: bool,
) -> u64 {
    generate(
        &HeaderTemplate {
            mail: &ctx.mail,
            unmanaged: &ctx.unmanaged_headers,
            body_size: ctx.mail.body_size,
            pseudo: ctx.pseudo,
            crlf: ctx.crlf,
            base,
        },
        view,
        tx,
        keep_recent,
    )
    .required_len()
}

/// Parameters for a batch window rewrite.
pub struct WindowRewrite<'a> {
    pub file: &'a fs::File,
    pub file_size: u64,
    /// The saved window members, expunged placeholders included, in file
    /// order. Offsets are updated in place to the new layout.
    pub mails: &'a mut [MailRecord],
    /// mbox sequence of `mails[0]`.
    pub first_seq: u32,
    /// Old end of the window span (exclusive).
    pub end_offset: u64,
    /// How far the end of the window moves (positive extends into
    /// following expunged space or freshly grown file tail).
    pub move_diff: i64,
    /// Whether the last member's body lies inside the window span. When
    /// the window was closed by that member's own header padding, the span
    /// stops at its body, which must not move.
    pub include_last_body: bool,
    pub keep_recent: bool,
    /// X-IMAP(base) values to emit on the pseudo or first real message.
    pub base: Option<(u32, u32)>,
}

struct MemberPlan {
    mail_ix: usize,
    old_from: u64,
    old_hdr: u64,
    old_body: u64,
    new_from: u64,
    new_hdr: u64,
    new_body: u64,
    from_line: Vec<u8>,
    gen: GeneratedHeader,
    hdr_len: u64,
}

/// Rewrite every message in the window, relocating headers and bodies so
/// that the members exactly fill `[mails[0].from_offset, end_offset +
/// move_diff)`, distributing all surplus room as header padding.
///
/// Returns the new absolute uid-last offset if an X-IMAP(base) header was
/// written.
pub fn rewrite_window(
    w: WindowRewrite<'_>,
    view: &IndexView,
    tx: &mut Transaction,
) -> Result<Option<u64>, Error> {
    let window_start = w.mails[0].from_offset;
    let span_target = (w.end_offset as i64 + w.move_diff) as u64;

    // Re-read each live member and regenerate its header
    let mut plans: Vec<MemberPlan> = Vec::new();
    for (ix, mail) in w.mails.iter().enumerate() {
        if mail.expunged() {
            continue;
        }

        let seq = w.first_seq + ix as u32;
        let reread = parse::parse_mail_at(
            w.file,
            mail.from_offset,
            w.file_size,
            seq,
            view,
            tx,
        )?;

        // The baseline lands on the pseudo message, the first message, or
        // whichever message is about to become first in the file.
        let becomes_first = plans.is_empty() && 0 == window_start;
        let base = match w.base {
            Some(b) if mail.pseudo || 1 == seq || becomes_first => Some(b),
            _ => None,
        };
        let gen = generate(
            &HeaderTemplate {
                mail,
                unmanaged: &reread.unmanaged_headers,
                body_size: mail.body_size,
                pseudo: mail.pseudo,
                crlf: reread.crlf,
                base,
            },
            view,
            tx,
            w.keep_recent,
        );

        plans.push(MemberPlan {
            mail_ix: ix,
            old_from: mail.from_offset,
            old_hdr: reread.hdr_offset,
            old_body: reread.body_offset,
            new_from: 0,
            new_hdr: 0,
            new_body: 0,
            from_line: reread.from_line,
            gen,
            hdr_len: 0,
        });
    }

    // Lay the members out; everything that is not message content becomes
    // header padding.
    let live = plans.len();
    let mut content = 0u64;
    for (plan_ix, plan) in plans.iter_mut().enumerate() {
        let mail = &w.mails[plan.mail_ix];
        let mut from_len = plan.from_line.len() as u64;
        if 0 == window_start && 0 == plan_ix && plan.old_from != 0 {
            // This member becomes the first message in the file; its
            // leading separator newline goes away.
            from_len -= if plan.from_line.starts_with(b"\r\n") {
                2
            } else {
                1
            };
        }
        plan.hdr_len = plan.gen.required_len();
        content += from_len + plan.hdr_len;
        if w.include_last_body || plan_ix + 1 != live {
            content += mail.body_size;
        }
    }

    let total_pad = span_target
        .checked_sub(window_start + content)
        .ok_or(Error::MboxShrank)?;

    let mut cursor = window_start;
    for (ix, plan) in plans.iter_mut().enumerate() {
        let mail = &w.mails[plan.mail_ix];
        let last = ix + 1 == live;
        let mut pad = if 0 == live { 0 } else { total_pad / live as u64 };
        if last {
            pad = total_pad - pad * (live as u64 - 1);
        }

        if 0 == cursor && plan.old_from != 0 {
            let strip = if plan.from_line.starts_with(b"\r\n") { 2 } else { 1 };
            plan.from_line.drain(..strip);
        }

        plan.new_from = cursor;
        plan.new_hdr = cursor + plan.from_line.len() as u64;
        plan.hdr_len += pad;
        plan.new_body = plan.new_hdr + plan.hdr_len;
        cursor = plan.new_body;
        if w.include_last_body || !last {
            cursor += mail.body_size;
        } else {
            // The closing member's body stays where it is; the layout must
            // come out flush against it.
            debug_assert!(plan.new_body == plan.old_body);
        }
    }
    debug_assert!(cursor == span_target);

    // Relocate. Forward-moving members are written back to front, then
    // backward-moving members front to back; either way a member's new span
    // can only overlap old spans that have already been consumed.
    let forward: Vec<usize> = (0..plans.len())
        .rev()
        .filter(|&ix| plans[ix].new_from > plans[ix].old_from)
        .collect();
    let backward: Vec<usize> = (0..plans.len())
        .filter(|&ix| plans[ix].new_from <= plans[ix].old_from)
        .collect();

    for &ix in forward.iter().chain(backward.iter()) {
        let plan = &plans[ix];
        let mail = &w.mails[plan.mail_ix];

        if w.include_last_body || ix + 1 != live {
            file_ops::move_within(
                w.file,
                plan.new_body,
                plan.old_body,
                mail.body_size,
            )?;
        }
        let block = plan.gen.padded_to(plan.hdr_len);
        w.file.write_all_at(&block, plan.new_hdr)?;
        w.file.write_all_at(&plan.from_line, plan.new_from)?;
    }

    // Publish the new offsets and spare room
    let mut uid_last_offset = None;
    for plan in &plans {
        let mail = &mut w.mails[plan.mail_ix];
        mail.from_offset = plan.new_from;
        mail.offset = plan.new_hdr;
        mail.space = plan.hdr_len as i64 - plan.gen.required_len() as i64;

        if let Some(rel) = plan.gen.uid_last_rel() {
            uid_last_offset = Some(plan.new_hdr + rel);
        }
    }

    Ok(uid_last_offset)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::index::MailIndex;

    fn scratch() -> (tempfile::TempDir, IndexView) {
        let dir = tempfile::TempDir::new().unwrap();
        let index = MailIndex::open(&dir.path().join("x"), "test".to_owned());
        let view = index.view();
        (dir, view)
    }

    fn mail(uid: u32, flags: MailFlags) -> MailRecord {
        MailRecord {
            uid,
            flags,
            ..MailRecord::default()
        }
    }

    #[test]
    fn generated_header_shape() {
        let (_dir, view) = scratch();
        let mut tx = Transaction::new(&view);
        let work = tx.keyword_id(&view, "work");

        let mut m = mail(3, MailFlags::SEEN | MailFlags::ANSWERED);
        m.keywords = vec![work];
        let gen = generate(
            &HeaderTemplate {
                mail: &m,
                unmanaged: b"Subject: x\n",
                body_size: 10,
                pseudo: false,
                crlf: false,
                base: None,
            },
            &view,
            &tx,
            false,
        );

        assert_eq!(
            b"Subject: x\n\
              X-Keywords: work\n\
              X-UID: 3\n\
              Content-Length: 10\n\
              Status: RO\n\
              X-Status: A\n\
              \n"
            .to_vec(),
            gen.bytes
        );
    }

    #[test]
    fn padding_lands_on_the_x_uid_line() {
        let (_dir, view) = scratch();
        let tx = Transaction::new(&view);

        let m = mail(3, MailFlags::empty());
        let gen = generate(
            &HeaderTemplate {
                mail: &m,
                unmanaged: b"",
                body_size: 0,
                pseudo: false,
                crlf: false,
                base: None,
            },
            &view,
            &tx,
            false,
        );

        let padded = gen.padded_to(gen.required_len() + 4);
        let text = String::from_utf8(padded).unwrap();
        assert!(text.contains("X-UID: 3    \n"), "got: {:?}", text);
    }

    #[test]
    fn keep_recent_omits_o_flag() {
        let (_dir, view) = scratch();
        let tx = Transaction::new(&view);

        let m = mail(3, MailFlags::RECENT);
        let gen = generate(
            &HeaderTemplate {
                mail: &m,
                unmanaged: b"",
                body_size: 0,
                pseudo: false,
                crlf: false,
                base: None,
            },
            &view,
            &tx,
            true,
        );
        let text = String::from_utf8(gen.bytes).unwrap();
        assert!(!text.contains("Status:"), "got: {:?}", text);

        let gen = generate(
            &HeaderTemplate {
                mail: &m,
                unmanaged: b"",
                body_size: 0,
                pseudo: false,
                crlf: false,
                base: None,
            },
            &view,
            &tx,
            false,
        );
        let text = String::from_utf8(gen.bytes).unwrap();
        assert!(text.contains("Status: O\n"), "got: {:?}", text);
    }

    #[test]
    fn base_header_tracks_uid_last_position() {
        let (_dir, view) = scratch();
        let tx = Transaction::new(&view);

        let m = mail(1, MailFlags::empty());
        let gen = generate(
            &HeaderTemplate {
                mail: &m,
                unmanaged: b"Subject: first\n",
                body_size: 5,
                pseudo: false,
                crlf: false,
                base: Some((12345, 3)),
            },
            &view,
            &tx,
            false,
        );

        let rel = gen.uid_last_rel().unwrap() as usize;
        assert_eq!(b"0000000003", &gen.bytes[rel..rel + 10]);
        // Padding must not displace the field
        let padded = gen.padded_to(gen.required_len() + 32);
        assert_eq!(b"0000000003", &padded[rel..rel + 10]);
    }
}

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

//! The raw mbox tokenizer.
//!
//! This locates `From ` delimiters and header boundaries, extracts the
//! managed headers (`Status`, `X-Status`, `X-Keywords`, `X-UID`,
//! `Content-Length`, `X-IMAP`/`X-IMAPbase`), and computes the MD5 sum over
//! everything else. The sync engine drives it strictly forward through the
//! file, one message at a time.

use std::fs;
use std::os::unix::fs::FileExt;

use openssl::hash::{Hasher, MessageDigest};

use super::from_line;
use super::model::*;
use crate::index::{IndexView, MailFlags, Transaction};
use crate::support::error::Error;

const CHUNK: usize = 8192;

/// Read exactly `len` bytes at `offset`, clamped to `size`.
fn read_bytes_at(
    file: &fs::File,
    offset: u64,
    len: usize,
    size: u64,
) -> Result<Vec<u8>, Error> {
    let len = len.min(size.saturating_sub(offset) as usize);
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

/// Buffered line-at-a-time access at arbitrary offsets.
struct LineReader<'a> {
    file: &'a fs::File,
    size: u64,
    pos: u64,
    buf: Vec<u8>,
    buf_start: u64,
}

impl<'a> LineReader<'a> {
    fn new(file: &'a fs::File, size: u64, pos: u64) -> Self {
        LineReader {
            file,
            size,
            pos,
            buf: Vec::new(),
            buf_start: 0,
        }
    }

    fn buffered(&mut self) -> Result<&[u8], Error> {
        let in_buf = self.pos >= self.buf_start
            && self.pos < self.buf_start + self.buf.len() as u64;
        if !in_buf {
            let len = CHUNK.min((self.size - self.pos) as usize);
            self.buf = vec![0u8; len];
            self.file.read_exact_at(&mut self.buf, self.pos)?;
            self.buf_start = self.pos;
        }

        Ok(&self.buf[(self.pos - self.buf_start) as usize..])
    }

    /// Read the line starting at the cursor, including its terminator (which
    /// is absent only at EOF). Returns the line's offset alongside.
    fn read_line(&mut self) -> Result<Option<(u64, Vec<u8>)>, Error> {
        if self.pos >= self.size {
            return Ok(None);
        }

        let start = self.pos;
        let mut line = Vec::new();
        while self.pos < self.size {
            let avail = self.buffered()?;
            match avail.iter().position(|&b| b'\n' == b) {
                Some(ix) => {
                    line.extend_from_slice(&avail[..=ix]);
                    self.pos += ix as u64 + 1;
                    return Ok(Some((start, line)));
                },
                None => {
                    let n = avail.len() as u64;
                    line.extend_from_slice(avail);
                    self.pos += n;
                },
            }
        }

        Ok(Some((start, line)))
    }
}

fn is_blank(line: &[u8]) -> bool {
    b"\n" == line || b"\r\n" == line
}

/// Strip the line terminator (LF or CRLF).
fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_u32(data: &[u8]) -> Option<u32> {
    if data.is_empty() || !data.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(data).ok()?.parse().ok()
}

fn parse_u64(data: &[u8]) -> Option<u64> {
    if data.is_empty() || !data.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(data).ok()?.parse().ok()
}

/// A fully assembled logical header (with continuation lines folded in).
struct LogicalHeader {
    /// Offset of the first line.
    offset: u64,
    /// Raw bytes of all physical lines.
    raw: Vec<u8>,
    /// Lower-cased name.
    name: Vec<u8>,
    /// Byte offset of the value within `raw`.
    value_start: usize,
}

impl LogicalHeader {
    fn value(&self) -> &[u8] {
        trim_eol(&self.raw[self.value_start..])
    }
}

/// Check whether bytes at `offset` begin a message boundary: start of file,
/// end of file, or a separator newline followed by a From-line.
pub fn boundary_at(
    file: &fs::File,
    offset: u64,
    size: u64,
) -> Result<bool, Error> {
    if offset == size {
        return Ok(true);
    }

    let peek = read_bytes_at(file, offset, 8, size)?;
    if 0 == offset {
        Ok(from_line::is_from_line(&peek))
    } else {
        Ok(from_line::separator_at(&peek).is_some())
    }
}

/// Scan forward from `start` for the next message separator.
///
/// Returns the offset where the current message's span ends, which is the
/// start of the next message's From-line span, or `size` at EOF.
fn scan_for_separator(
    file: &fs::File,
    start: u64,
    size: u64,
) -> Result<u64, Error> {
    const NEEDLE: &[u8] = b"\nFrom ";

    let mut pos = start;
    while pos < size {
        let chunk = read_bytes_at(file, pos, CHUNK + NEEDLE.len(), size)?;
        for ix in 0..chunk.len().min(CHUNK) {
            if chunk[ix..].starts_with(NEEDLE) {
                let nl = pos + ix as u64;
                // A CRLF separator starts at the \r
                if nl > start && b'\r' == chunk_byte(file, &chunk, pos, nl - 1)?
                {
                    return Ok(nl - 1);
                }
                return Ok(nl);
            }
        }
        pos += CHUNK as u64;
    }

    Ok(size)
}

/// Fetch the byte at absolute `offset`, preferring the given chunk.
fn chunk_byte(
    file: &fs::File,
    chunk: &[u8],
    chunk_start: u64,
    offset: u64,
) -> Result<u8, Error> {
    if offset >= chunk_start && offset < chunk_start + chunk.len() as u64 {
        Ok(chunk[(offset - chunk_start) as usize])
    } else {
        let mut b = [0u8; 1];
        file.read_exact_at(&mut b, offset)?;
        Ok(b[0])
    }
}

/// Parse the message whose From-line span starts at `from_offset`.
///
/// The caller is responsible for UID ordering validation and sequence
/// assignment; `seq` is used only for pseudo-message detection, which is
/// possible only at sequence 1.
pub fn parse_mail_at(
    file: &fs::File,
    from_offset: u64,
    file_size: u64,
    seq: u32,
    view: &IndexView,
    tx: &mut Transaction,
) -> Result<MailContext, Error> {
    // Non-first messages own the separator newline in front of their
    // From-line.
    let sep_len = if 0 == from_offset {
        0u64
    } else {
        let peek = read_bytes_at(file, from_offset, 2, file_size)?;
        if peek.starts_with(b"\r\n") {
            2
        } else if peek.starts_with(b"\n") {
            1
        } else {
            return Err(Error::LostFromLine);
        }
    };

    let mut reader = LineReader::new(file, file_size, from_offset + sep_len);
    let (_, line) = reader.read_line()?.ok_or(Error::LostFromLine)?;
    if !from_line::is_from_line(&line) {
        return Err(Error::LostFromLine);
    }

    let crlf = line.ends_with(b"\r\n") || 2 == sep_len;
    let mut raw_from =
        read_bytes_at(file, from_offset, sep_len as usize, file_size)?;
    raw_from.extend_from_slice(&line);

    let mut ctx = MailContext {
        seq,
        crlf,
        from_line: raw_from,
        hdr_offset: reader.pos,
        ..MailContext::default()
    };
    ctx.mail.from_offset = from_offset;

    let mut md5 = Hasher::new(MessageDigest::md5())?;
    let mut headers: Vec<LogicalHeader> = Vec::new();
    let mut body_offset = file_size;

    while let Some((offset, line)) = reader.read_line()? {
        if is_blank(&line) {
            body_offset = reader.pos;
            break;
        }

        if (b' ' == line[0] || b'\t' == line[0]) && !headers.is_empty() {
            headers.last_mut().unwrap().raw.extend_from_slice(&line);
            continue;
        }

        let colon = match line.iter().position(|&b| b':' == b) {
            Some(c) => c,
            // Not a header at all; the body apparently starts here without
            // an empty line. Treat the malformed line as body content.
            None => {
                body_offset = offset;
                break;
            },
        };

        let name = line[..colon].to_ascii_lowercase();
        let mut value_start = colon + 1;
        while value_start < line.len()
            && (b' ' == line[value_start] || b'\t' == line[value_start])
        {
            value_start += 1;
        }

        headers.push(LogicalHeader {
            offset,
            raw: line,
            name,
            value_start,
        });
    }
    ctx.body_offset = body_offset;
    ctx.mail.offset = ctx.hdr_offset;

    for hdr in &headers {
        match &hdr.name[..] {
            b"status" => {
                for &b in hdr.value() {
                    if b'R' == b {
                        ctx.mail.flags |= MailFlags::SEEN;
                    }
                }
            },
            b"x-status" => {
                for &b in hdr.value() {
                    match b {
                        b'A' => ctx.mail.flags |= MailFlags::ANSWERED,
                        b'F' => ctx.mail.flags |= MailFlags::FLAGGED,
                        b'D' => ctx.mail.flags |= MailFlags::DELETED,
                        b'T' => ctx.mail.flags |= MailFlags::DRAFT,
                        _ => (),
                    }
                }
            },
            b"x-keywords" => {
                for name in hdr
                    .value()
                    .split(|&b| b' ' == b || b'\t' == b)
                    .filter(|w| !w.is_empty())
                {
                    if let Ok(name) = std::str::from_utf8(name) {
                        let id = tx.keyword_id(view, name);
                        if let Err(ix) = ctx.mail.keywords.binary_search(&id) {
                            ctx.mail.keywords.insert(ix, id);
                        }
                    }
                }
            },
            b"x-uid" => {
                let value: Vec<u8> = hdr
                    .value()
                    .iter()
                    .copied()
                    .take_while(|b| b.is_ascii_digit())
                    .collect();
                ctx.mail.uid = parse_u32(&value).unwrap_or(0);
            },
            b"content-length" => {
                let value: Vec<u8> = hdr
                    .value()
                    .iter()
                    .copied()
                    .take_while(|b| b.is_ascii_digit())
                    .collect();
                ctx.content_length = parse_u64(&value);
            },
            b"x-imap" | b"x-imapbase" => {
                ctx.imap_base = parse_imap_base(hdr);
                if b"x-imap" == &hdr.name[..] && 1 == seq {
                    ctx.pseudo = true;
                }
            },
            _ => {
                md5.update(&hdr.raw)?;
                ctx.unmanaged_headers.extend_from_slice(&hdr.raw);
            },
        }
    }

    let digest = md5.finish()?;
    ctx.hdr_md5.copy_from_slice(&digest);

    // Status has an O => not recent; no Status line at all => recent
    let has_status = headers.iter().any(|h| b"status" == &h.name[..]);
    if !has_status {
        ctx.recent = true;
    } else {
        let o_flag = headers.iter().any(|h| {
            b"status" == &h.name[..] && h.value().contains(&b'O')
        });
        ctx.recent = !o_flag;
    }
    if ctx.recent {
        ctx.mail.flags |= MailFlags::RECENT;
    }

    // Determine the body size, preferring a Content-Length that provably
    // points at the next message boundary.
    let body_size = match ctx.content_length {
        Some(cl)
            if boundary_at(file, ctx.body_offset.saturating_add(cl), file_size)
                .unwrap_or(false)
                && ctx.body_offset + cl <= file_size =>
        {
            cl
        },
        _ => {
            ctx.content_length = None;
            scan_for_separator(file, ctx.body_offset, file_size)?
                - ctx.body_offset
        },
    };
    ctx.mail.body_size = body_size;

    Ok(ctx)
}

fn parse_imap_base(hdr: &LogicalHeader) -> Option<ImapBase> {
    let value = hdr.value();
    let mut fields = value
        .split(|&b| b' ' == b || b'\t' == b)
        .filter(|w| !w.is_empty());
    let validity = parse_u32(fields.next()?)?;
    let uid_last_field = fields.next()?;
    let uid_last = parse_u32(uid_last_field)?;

    // The positional uid-last rewrite is only possible against the
    // canonical fixed-width field.
    let uid_last_offset = if 10 == uid_last_field.len() {
        let field_pos = uid_last_field.as_ptr() as usize
            - hdr.raw.as_ptr() as usize;
        hdr.offset + field_pos as u64
    } else {
        0
    };

    Some(ImapBase {
        uid_validity: validity,
        uid_last,
        uid_last_offset,
    })
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;
    use crate::index::MailIndex;

    fn fixture(content: &[u8]) -> (tempfile::TempDir, fs::File) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mbox");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        drop(f);
        (dir, fs::File::open(&path).unwrap())
    }

    fn parse_first(content: &[u8]) -> (MailContext, tempfile::TempDir) {
        let (dir, file) = fixture(content);
        let index = MailIndex::open(&dir.path().join("x"), "test".to_owned());
        let view = index.view();
        let mut tx = Transaction::new(&view);
        let ctx = parse_mail_at(
            &file,
            0,
            content.len() as u64,
            1,
            &view,
            &mut tx,
        )
        .unwrap();
        (ctx, dir)
    }

    #[test]
    fn parses_simple_message() {
        let content = b"From alice Thu Jan  1 00:00:00 1970\n\
                        Subject: hi\n\
                        Status: RO\n\
                        X-Status: AF\n\
                        X-UID: 7\n\
                        \n\
                        body line\n";
        let (ctx, _dir) = parse_first(content);

        assert_eq!(7, ctx.mail.uid);
        assert!(ctx.mail.flags.contains(MailFlags::SEEN));
        assert!(ctx.mail.flags.contains(MailFlags::ANSWERED));
        assert!(ctx.mail.flags.contains(MailFlags::FLAGGED));
        assert!(!ctx.mail.flags.contains(MailFlags::DELETED));
        assert!(!ctx.recent);
        assert!(!ctx.pseudo);
        assert_eq!(b"Subject: hi\n".to_vec(), ctx.unmanaged_headers);
        assert_eq!(10, ctx.mail.body_size);
        assert_eq!(content.len() as u64 - 10, ctx.body_offset);
    }

    #[test]
    fn missing_status_is_recent() {
        let content = b"From alice Thu Jan  1 00:00:00 1970\n\
                        Subject: hi\n\
                        \n\
                        b\n";
        let (ctx, _dir) = parse_first(content);

        assert!(ctx.recent);
        assert!(ctx.mail.flags.contains(MailFlags::RECENT));
        assert_eq!(0, ctx.mail.uid);
    }

    #[test]
    fn body_scan_stops_at_next_from() {
        let content = b"From a Thu Jan  1 00:00:00 1970\n\
                        \n\
                        first body\n\
                        \nFrom b Thu Jan  1 00:00:00 1970\n\
                        \n\
                        second\n";
        let (ctx, dir) = parse_first(content);

        assert_eq!(11, ctx.mail.body_size);

        // And the second message's span starts at the separator
        let sep = ctx.body_offset + ctx.mail.body_size;
        let file = fs::File::open(dir.path().join("mbox")).unwrap();
        assert!(boundary_at(&file, sep, content.len() as u64).unwrap());

        let index = MailIndex::open(&dir.path().join("x"), "test".to_owned());
        let view = index.view();
        let mut tx = Transaction::new(&view);
        let ctx2 = parse_mail_at(
            &file,
            sep,
            content.len() as u64,
            2,
            &view,
            &mut tx,
        )
        .unwrap();
        assert_eq!(7, ctx2.mail.body_size);
        assert!(ctx2.from_line.starts_with(b"\nFrom b"));
    }

    #[test]
    fn quoted_from_does_not_end_body() {
        let content = b"From a Thu Jan  1 00:00:00 1970\n\
                        \n\
                        text\n\
                        >From quoted\n\
                        more\n";
        let (ctx, _dir) = parse_first(content);

        assert_eq!(
            content.len() as u64 - ctx.body_offset,
            ctx.mail.body_size
        );
    }

    #[test]
    fn trusted_content_length_wins() {
        // The body contains an unquoted "\nFrom " which would fool the
        // scanner; Content-Length points at the real boundary.
        let content = b"From a Thu Jan  1 00:00:00 1970\n\
                        Content-Length: 12\n\
                        \n\
                        x\nFrom fake\n\
                        \nFrom b Thu Jan  1 00:00:00 1970\n\
                        \n\
                        second\n";
        let (ctx, _dir) = parse_first(content);

        assert_eq!(12, ctx.mail.body_size);
        assert_eq!(Some(12), ctx.content_length);
    }

    #[test]
    fn bogus_content_length_is_ignored() {
        let content = b"From a Thu Jan  1 00:00:00 1970\n\
                        Content-Length: 9999\n\
                        \n\
                        short\n";
        let (ctx, _dir) = parse_first(content);

        assert_eq!(None, ctx.content_length);
        assert_eq!(6, ctx.mail.body_size);
    }

    #[test]
    fn pseudo_detection_and_base() {
        let content = b"From MAILER-DAEMON Thu Jan  1 00:00:00 1970\n\
                        From: Mail System Internal Data <MAILER-DAEMON@h>\n\
                        Subject: DON'T DELETE THIS MESSAGE\n\
                        X-IMAP: 1526339517 0000000042\n\
                        Status: RO\n\
                        \n\
                        warning\n";
        let (ctx, _dir) = parse_first(content);

        assert!(ctx.pseudo);
        let base = ctx.imap_base.unwrap();
        assert_eq!(1526339517, base.uid_validity);
        assert_eq!(42, base.uid_last);

        // The recorded offset must point at the 10-digit field
        let field = &content[base.uid_last_offset as usize
            ..base.uid_last_offset as usize + 10];
        assert_eq!(b"0000000042", field);
    }

    #[test]
    fn x_imapbase_on_real_message_is_not_pseudo() {
        let content = b"From alice Thu Jan  1 00:00:00 1970\n\
                        X-IMAPbase: 99 0000000003\n\
                        X-UID: 1\n\
                        \n\
                        b\n";
        let (ctx, _dir) = parse_first(content);

        assert!(!ctx.pseudo);
        assert_eq!(1, ctx.mail.uid);
        assert_eq!(99, ctx.imap_base.unwrap().uid_validity);
    }

    #[test]
    fn keywords_are_interned() {
        let content = b"From alice Thu Jan  1 00:00:00 1970\n\
                        X-Keywords: Work Todo Work\n\
                        \n\
                        b\n";
        let (dir, file) = fixture(content);
        let index = MailIndex::open(&dir.path().join("x"), "test".to_owned());
        let view = index.view();
        let mut tx = Transaction::new(&view);
        let ctx = parse_mail_at(
            &file,
            0,
            content.len() as u64,
            1,
            &view,
            &mut tx,
        )
        .unwrap();

        assert_eq!(2, ctx.mail.keywords.len());
        assert_eq!(Some("Work"), tx.keyword_name(&view, ctx.mail.keywords[0]));
    }

    #[test]
    fn md5_is_invariant_under_managed_headers() {
        let a = b"From alice Thu Jan  1 00:00:00 1970\n\
                  Subject: x\n\
                  Status: RO\n\
                  \n\
                  b\n";
        let b = b"From alice Thu Jan  1 00:00:00 1970\n\
                  Subject: x\n\
                  Status: O\n\
                  X-UID: 3\n\
                  \n\
                  b\n";
        let (ctx_a, _da) = parse_first(a);
        let (ctx_b, _db) = parse_first(b);

        assert_eq!(ctx_a.hdr_md5, ctx_b.hdr_md5);
    }

    #[test]
    fn crlf_detection() {
        let content = b"From a Thu Jan  1 00:00:00 1970\r\n\
                        Subject: x\r\n\
                        \r\n\
                        body\r\n";
        let (ctx, _dir) = parse_first(content);

        assert!(ctx.crlf);
        assert_eq!(
            content.len() as u64 - ctx.body_offset,
            ctx.mail.body_size
        );
    }

    proptest::proptest! {
        /// Walking the parse chain over arbitrary bodies partitions the
        /// file exactly: every span ends where the next begins, and every
        /// body is recovered byte for byte.
        #[test]
        fn message_chain_partitions_file(
            bodies in proptest::collection::vec("[a-z \\n]{0,64}", 1..4),
        ) {
            proptest::prop_assume!(
                bodies.iter().all(|b| !b.contains("\nFrom "))
            );

            let mut content = Vec::new();
            for (ix, body) in bodies.iter().enumerate() {
                if ix > 0 {
                    content.push(b'\n');
                }
                content.extend_from_slice(
                    b"From a Thu Jan  1 00:00:00 1970\nSubject: p\n\n",
                );
                content.extend_from_slice(body.as_bytes());
            }

            let (dir, file) = fixture(&content);
            let index =
                MailIndex::open(&dir.path().join("x"), "test".to_owned());
            let view = index.view();
            let mut tx = Transaction::new(&view);

            let size = content.len() as u64;
            let mut offset = 0u64;
            let mut seen = Vec::new();
            while offset < size {
                proptest::prop_assert!(
                    boundary_at(&file, offset, size).unwrap()
                );
                let ctx = parse_mail_at(
                    &file,
                    offset,
                    size,
                    seen.len() as u32 + 1,
                    &view,
                    &mut tx,
                )
                .unwrap();

                let body = &content[ctx.body_offset as usize
                    ..(ctx.body_offset + ctx.mail.body_size) as usize];
                seen.push(body.to_vec());
                offset = ctx.body_offset + ctx.mail.body_size;
            }

            let expected: Vec<Vec<u8>> =
                bodies.iter().map(|b| b.as_bytes().to_vec()).collect();
            proptest::prop_assert_eq!(expected, seen);
        }
    }
}

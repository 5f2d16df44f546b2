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

//! End-to-end sync scenarios, driven through the public `Mbox` handle
//! against real files.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::defs::SyncContext;
use crate::index::{
    MailFlags, MailIndex, SyncOp, SyncRecord, Transaction,
};
use crate::mbox::model::SyncConfig;
use crate::mbox::{Mbox, SyncFlags};
use crate::support::error::Error;

fn set_up() -> (tempfile::TempDir, PathBuf) {
    crate::init_test_log();
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("mbox");
    fs::File::create(&path).unwrap();
    (dir, path)
}

/// Append a message to the file the way an external delivery agent would.
fn deliver(path: &Path, subject: &str, body: &str) {
    let mut file = fs::OpenOptions::new().append(true).open(path).unwrap();
    let mut text = String::new();
    if file.metadata().unwrap().len() > 0 {
        text.push('\n');
    }
    text.push_str("From sender@example.com Thu Jan  1 00:00:00 1970\n");
    text.push_str(&format!("Subject: {}\n\n{}", subject, body));
    file.write_all(text.as_bytes()).unwrap();
}

fn open(path: &Path) -> Mbox {
    Mbox::open(path, false, SyncConfig::default()).unwrap()
}

fn contents(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap()
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    let needle = needle.as_bytes();
    haystack
        .windows(needle.len().max(1))
        .any(|w| w == needle)
}

fn enqueue_flags(
    mbox: &mut Mbox,
    uid1: u32,
    uid2: u32,
    add: MailFlags,
    remove: MailFlags,
) {
    mbox.enqueue(vec![SyncRecord {
        uid1,
        uid2,
        op: SyncOp::Flags { add, remove },
    }])
    .unwrap();
}

fn enqueue_expunge(mbox: &mut Mbox, uid1: u32, uid2: u32) {
    mbox.enqueue(vec![SyncRecord {
        uid1,
        uid2,
        op: SyncOp::Expunge,
    }])
    .unwrap();
}

fn uids(mbox: &Mbox) -> Vec<u32> {
    let view = mbox.index().view();
    (1..=view.messages_count())
        .map(|seq| view.lookup_uid(seq).unwrap())
        .collect()
}

#[test]
fn e1_initial_sync_assigns_uids() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two\n");
    deliver(&path, "three", "body three\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();

    let hdr = mbox.index().header();
    assert_eq!(4, hdr.next_uid);
    assert!(hdr.uid_validity != 0);
    assert_eq!(vec![1, 2, 3], uids(&mbox));

    let content = contents(&path);
    assert!(contains(
        &content,
        &format!("X-IMAPbase: {} 0000000003", hdr.uid_validity)
    ));
    assert!(contains(&content, "X-UID: 1"));
    assert!(contains(&content, "X-UID: 2"));
    assert!(contains(&content, "X-UID: 3"));
    assert!(contains(&content, "body one\n"));
    assert!(contains(&content, "body two\n"));
    assert!(contains(&content, "body three\n"));

    assert_eq!(content.len() as u64, mbox.index().header().sync_size);
    assert!(!mbox.has_changed(true).unwrap());
}

#[test]
fn e2_flag_update_rewrites_in_place() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    let size_before = contents(&path).len();

    enqueue_flags(&mut mbox, 2, 2, MailFlags::SEEN, MailFlags::empty());
    mbox.sync(SyncFlags::empty()).unwrap();

    let content = contents(&path);
    // Padding was consumed; nothing moved
    assert_eq!(size_before, content.len());
    assert!(contains(&content, "Status: RO"));

    let view = mbox.index().view();
    assert!(!view.lookup(1).unwrap().flags.contains(MailFlags::SEEN));
    assert!(view.lookup(2).unwrap().flags.contains(MailFlags::SEEN));
    assert_eq!(content.len() as u64, mbox.index().header().sync_size);
    assert!(!mbox.has_changed(true).unwrap());
}

#[test]
fn e3_expunge_middle_reclaims_space() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two is somewhat longer\n");
    deliver(&path, "three", "body three\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    let size_before = contents(&path).len() as u64;

    let view = mbox.index().view();
    let span2 = view.lookup_from_offset(3).unwrap()
        - view.lookup_from_offset(2).unwrap();

    enqueue_expunge(&mut mbox, 2, 2);
    mbox.sync(SyncFlags::empty()).unwrap();

    let content = contents(&path);
    assert_eq!(size_before - span2, content.len() as u64);
    assert_eq!(vec![1, 3], uids(&mbox));
    assert!(!contains(&content, "body two"));
    assert!(!contains(&content, "X-UID: 2"));
    assert!(contains(&content, "body one\n"));
    assert!(contains(&content, "body three\n"));
    // uid-last is untouched: no new UIDs were assigned
    assert!(contains(&content, "0000000003"));
    assert!(!mbox.has_changed(true).unwrap());
}

#[test]
fn e4_header_growth_grows_file_once() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    let size_before = contents(&path).len() as u64;

    // A keyword line far larger than the 64 bytes of padding
    let name: String = std::iter::repeat('k').take(100).collect();
    let id = mbox.intern_keyword(&name).unwrap();
    mbox.enqueue(vec![SyncRecord {
        uid1: 1,
        uid2: 1,
        op: SyncOp::KeywordAdd(id),
    }])
    .unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    let content = contents(&path);
    // The file grows by the deficit plus one unit of fresh padding, which
    // works out to exactly the new header line's length.
    let kw_line = "X-Keywords: ".len() as u64 + 100 + 1;
    assert_eq!(size_before + kw_line, content.len() as u64);
    assert!(contains(&content, &format!("X-Keywords: {}", name)));
    // The body is intact at its new position
    assert!(content.ends_with(b"body one\n"));
    assert_eq!(Some(0), mbox.index().view().lookup_from_offset(1));
    assert_eq!(vec![1], uids(&mbox));
    assert!(!mbox.has_changed(true).unwrap());
}

#[test]
fn e5_external_expunge_detected() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two\n");
    deliver(&path, "three", "body three\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();

    // Another program deletes the first message (taking the X-IMAPbase
    // header with it)
    let off2 = mbox.index().view().lookup_from_offset(2).unwrap() as usize;
    let content = contents(&path);
    fs::write(&path, &content[off2 + 1..]).unwrap();
    drop(mbox);

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();

    assert_eq!(vec![2, 3], uids(&mbox));
    assert_eq!(4, mbox.index().header().next_uid);

    // The surviving first message was given the folder baseline back
    let content = contents(&path);
    assert!(contains(&content, "X-IMAPbase: "));
    assert!(contains(&content, "0000000003"));
    assert!(!contains(&content, "body one"));

    // The sequential tail read settles everything in one pass
    assert!(!mbox.has_changed(true).unwrap());
    mbox.sync(SyncFlags::UNDIRTY).unwrap();
    assert_eq!(vec![2, 3], uids(&mbox));
}

#[test]
fn dirty_tail_sync_does_not_skip_the_last_message() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();

    // An external delivery makes the next pass a dirty partial sync
    // with no sync records at all. After message 1 the cursor already
    // sits on the last indexed message, so the tail check must fall
    // through to it sequentially instead of counting it as skipped.
    deliver(&path, "three", "body three\n");
    mbox.sync(SyncFlags::empty()).unwrap();

    assert_eq!(vec![1, 2, 3], uids(&mbox));
    // Nothing was skipped, so the pass came out clean and recorded the
    // sync stamp
    assert!(!mbox.has_changed(false).unwrap());
    assert_eq!(
        contents(&path).len() as u64,
        mbox.index().header().sync_size
    );
}

#[test]
fn e6_broken_uid_order_retries_full() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two\n");
    deliver(&path, "three", "body three\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    let stamp = mbox.index().header().sync_stamp;
    drop(mbox);

    // Corrupt the third message's UID so it sorts before its
    // predecessors, without changing the file's size...
    let mut content = contents(&path);
    let pos = content
        .windows(8)
        .position(|w| b"X-UID: 3" == w)
        .unwrap();
    content[pos + 7] = b'1';
    fs::write(&path, &content).unwrap();

    // ...or its mtime, so the next pass believes a partial sync is safe
    let tv = nix::sys::time::TimeVal::new(stamp as i64, 0);
    nix::sys::stat::utimes(&path, &tv, &tv).unwrap();

    let mut mbox = open(&path);
    enqueue_flags(&mut mbox, 3, 3, MailFlags::SEEN, MailFlags::empty());
    mbox.sync(SyncFlags::empty()).unwrap();

    // The partial pass bailed out harmlessly and the full retry reissued
    // the broken message's UID
    assert_eq!(vec![1, 2, 4], uids(&mbox));
    assert!(contains(&contents(&path), "X-UID: 4"));
    assert!(mbox.index().header().next_uid >= 5);
}

#[test]
fn window_closed_by_later_padding_keeps_file_size() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    let size_before = contents(&path).len();

    // Message 1 needs more room than its own padding, but message 2's
    // padding covers the difference, so the file must not grow.
    let name: String = std::iter::repeat('w').take(80).collect();
    let id = mbox.intern_keyword(&name).unwrap();
    mbox.enqueue(vec![SyncRecord {
        uid1: 1,
        uid2: 1,
        op: SyncOp::KeywordAdd(id),
    }])
    .unwrap();
    mbox.sync(SyncFlags::empty()).unwrap();

    let content = contents(&path);
    assert_eq!(size_before, content.len());
    assert!(contains(&content, &format!("X-Keywords: {}", name)));
    assert!(contains(&content, "body one\n"));
    assert!(contains(&content, "body two\n"));
    assert_eq!(vec![1, 2], uids(&mbox));
    // The mtime bump guarantees other processes see the move
    assert!(!mbox.has_changed(true).unwrap());

    // Both messages still parse on a full rescan
    mbox.sync(SyncFlags::FORCE_FULL).unwrap();
    assert_eq!(vec![1, 2], uids(&mbox));
}

#[test]
fn sync_is_idempotent() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    let hdr_after_first = mbox.index().header().clone();
    let content_after_first = contents(&path);

    mbox.sync(SyncFlags::empty()).unwrap();

    assert_eq!(hdr_after_first, *mbox.index().header());
    assert_eq!(content_after_first, contents(&path));
    assert!(!mbox.has_changed(true).unwrap());
}

#[test]
fn full_resync_of_clean_file_writes_nothing() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    let content = contents(&path);
    let uids_before = uids(&mbox);

    mbox.sync(SyncFlags::FORCE_FULL).unwrap();

    assert_eq!(content, contents(&path));
    assert_eq!(uids_before, uids(&mbox));
}

#[test]
fn expunge_everything_writes_fresh_pseudo() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");
    deliver(&path, "two", "body two\n");
    deliver(&path, "three", "body three\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    let uid_validity = mbox.index().header().uid_validity;

    enqueue_expunge(&mut mbox, 1, 3);
    mbox.sync(SyncFlags::empty()).unwrap();

    let content = contents(&path);
    assert!(content.starts_with(b"From MAILER-DAEMON"));
    assert!(contains(
        &content,
        &format!("X-IMAP: {} 0000000003", uid_validity)
    ));
    assert!(contains(&content, "Status: RO"));
    assert!(contains(&content, "internal format of your mail folder"));
    assert!(uids(&mbox).is_empty());
    assert_eq!(4, mbox.index().header().next_uid);
    assert!(!mbox.has_changed(true).unwrap());

    // The pseudo message round-trips through another pass
    mbox.sync(SyncFlags::FORCE_FULL).unwrap();
    assert_eq!(uid_validity, mbox.index().header().uid_validity);
    assert!(uids(&mbox).is_empty());

    // And a new delivery picks up where the UIDs left off
    deliver(&path, "four", "body four\n");
    mbox.sync(SyncFlags::empty()).unwrap();
    assert_eq!(vec![4], uids(&mbox));
    assert_eq!(5, mbox.index().header().next_uid);
}

#[test]
fn delay_writes_defers_header_rewrites() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");

    let config = SyncConfig {
        delay_writes: true,
        ..SyncConfig::default()
    };
    let mut mbox = Mbox::open(&path, false, config).unwrap();
    mbox.sync(SyncFlags::REWRITE).unwrap();
    let content_before = contents(&path);

    enqueue_flags(&mut mbox, 1, 1, MailFlags::SEEN, MailFlags::empty());
    mbox.sync(SyncFlags::empty()).unwrap();

    // Nothing was written; the index took the change and marked the
    // message dirty
    assert_eq!(content_before, contents(&path));
    let rec = mbox.index().view().lookup(1).unwrap().clone();
    assert!(rec.flags.contains(MailFlags::SEEN));
    assert!(rec.flags.contains(MailFlags::DIRTY));

    // A full write pass settles the file and clears the dirty bit
    mbox.sync(SyncFlags::FORCE_FULL | SyncFlags::REWRITE).unwrap();
    let content = contents(&path);
    assert!(contains(&content, "Status: RO"));
    let rec = mbox.index().view().lookup(1).unwrap().clone();
    assert!(rec.flags.contains(MailFlags::SEEN));
    assert!(!rec.flags.contains(MailFlags::DIRTY));
}

#[test]
fn read_only_sync_never_touches_the_file() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    let content_before = contents(&path);

    let mut ro =
        Mbox::open(&path, true, SyncConfig::default()).unwrap();
    ro.enqueue(vec![SyncRecord {
        uid1: 1,
        uid2: 1,
        op: SyncOp::Flags {
            add: MailFlags::FLAGGED,
            remove: MailFlags::empty(),
        },
    }])
    .unwrap();
    ro.sync(SyncFlags::empty()).unwrap();

    assert_eq!(content_before, contents(&path));
    let rec = ro.index().view().lookup(1).unwrap().clone();
    assert!(rec.flags.contains(MailFlags::FLAGGED));
    assert!(rec.flags.contains(MailFlags::DIRTY));
}

#[test]
fn uid_validity_change_is_fatal_and_non_destructive() {
    let (_dir, path) = set_up();
    deliver(&path, "one", "body one\n");

    let mut mbox = open(&path);
    mbox.sync(SyncFlags::empty()).unwrap();
    drop(mbox);

    // Another program rewrote the folder baseline
    let mut content = contents(&path);
    let pos = content
        .windows(12)
        .position(|w| b"X-IMAPbase: " == w)
        .unwrap();
    content[pos + 12] = if b'2' == content[pos + 12] { b'3' } else { b'2' };
    fs::write(&path, &content).unwrap();

    let mut mbox = open(&path);
    assert_matches!(
        Err(Error::UidValidityChanged),
        mbox.sync(SyncFlags::FORCE_FULL)
    );

    // No destructive writes happened
    assert_eq!(content, contents(&path));

    // The index was marked corrupted and gets rebuilt on open
    drop(mbox);
    let mbox = open(&path);
    assert!(uids(&mbox).is_empty());
    assert_eq!(0, mbox.index().header().uid_validity);
}

fn bare_ctx(path: &Path, content: &[u8]) -> SyncContext {
    fs::write(path, content).unwrap();
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    let index = MailIndex::open(path, "test".to_owned());
    let view = index.view();
    let tx = Transaction::new(&view);

    SyncContext {
        file,
        writable: true,
        path: path.to_owned(),
        log_prefix: "test".to_owned(),
        config: SyncConfig::default(),
        view,
        tx,
        session: Default::default(),
        input_offset: 0,
        input_eof: false,
        file_size: content.len() as u64,
        seq: 0,
        idx_seq: 1,
        prev_msg_uid: 0,
        next_uid: 50,
        idx_next_uid: 50,
        saw_pseudo: false,
        base_uid_validity: 1,
        base_uid_last: 42,
        base_uid_last_offset: 2,
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
        delay_writes: false,
        sync_dirty: false,
        save_md5: false,
        orig_mtime: 0,
        orig_size: 0,
        dirty_stamp: 0,
        dirty_size: 0,
    }
}

#[test]
fn uid_last_rewrite_refuses_foreign_bytes() {
    let (dir, _) = set_up();
    let path = dir.path().join("guard");

    // Non-digits where the field should be
    let content = b"xx**********yy".to_vec();
    let mut ctx = bare_ctx(&path, &content);
    assert_matches!(
        Err(Error::UidLastLost),
        ctx.rewrite_base_uid_last()
    );
    assert_eq!(content, contents(&path));

    // Digits, but not the value previously seen
    let content = b"xx0000000099yy".to_vec();
    let mut ctx = bare_ctx(&path, &content);
    assert_matches!(
        Err(Error::UidLastLost),
        ctx.rewrite_base_uid_last()
    );
    assert_eq!(content, contents(&path));

    // The expected value gets patched in place
    let content = b"xx0000000042yy".to_vec();
    let mut ctx = bare_ctx(&path, &content);
    ctx.rewrite_base_uid_last().unwrap();
    assert_eq!(b"xx0000000049yy".to_vec(), contents(&path));
    assert_eq!(49, ctx.base_uid_last);
}

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

use std::path::PathBuf;

use structopt::StructOpt;

use crate::mbox::{Mbox, SyncConfig, SyncFlags};
use crate::support::sysexits::*;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Synchronise an mbox folder against its index.
    ///
    /// Applies all queued flag, keyword, and expunge modifications to the
    /// file, assigns UIDs to new messages, and brings the index up to date
    /// with whatever other software did to the file.
    Sync(SyncSubcommand),
    /// Check whether an mbox has changed since its last sync.
    ///
    /// Exits 0 when the folder is fully synced and 1 when a sync is
    /// needed. Nothing is modified.
    Check(CommonOptions),
    /// Queue flag or expunge modifications for the next sync.
    Queue(QueueSubcommand),
    /// Print the indexed state of an mbox folder.
    Dump(CommonOptions),
}

#[derive(StructOpt)]
pub(super) struct CommonOptions {
    /// Path to the mbox file
    #[structopt(parse(from_os_str))]
    pub(super) mbox: PathBuf,
}

#[derive(StructOpt)]
pub(super) struct SyncSubcommand {
    #[structopt(flatten)]
    pub(super) common: CommonOptions,

    /// Rescan the whole file even if it looks unchanged.
    #[structopt(long)]
    force_full: bool,

    /// Write out flag state for messages the index marked dirty.
    #[structopt(long)]
    undirty: bool,

    /// Write header changes even under a delay-writes policy.
    #[structopt(long)]
    rewrite: bool,

    /// Hold a read lock over the change pre-check.
    #[structopt(long)]
    lock_reading: bool,

    /// Restrict the pass to records committed before a crash point.
    #[structopt(long)]
    last_commit: bool,

    /// Only bring the index header up to date.
    #[structopt(long)]
    header_only: bool,

    /// Open the mbox read-only; changes are recorded index-side only.
    #[structopt(long)]
    read_only: bool,

    /// Defer header writes; record changes index-side and mark messages
    /// dirty.
    #[structopt(long)]
    delay_writes: bool,

    /// Leave Recent state alone instead of writing 'O' Status flags.
    #[structopt(long)]
    keep_recent: bool,

    /// Store header MD5 sums for every message.
    #[structopt(long)]
    save_md5: bool,
}

#[derive(StructOpt)]
pub(super) enum QueueSubcommand {
    /// Queue flag and keyword changes for a UID range.
    ///
    /// Modifications are given as `+flag`/`-flag` for the standard flags
    /// (seen, answered, flagged, deleted, draft), `+kw:NAME`/`-kw:NAME`
    /// for keywords, or `=kw:` to clear all keywords.
    Flags(super::queue::FlagsSubcommand),
    /// Queue an expunge for a UID range.
    Expunge(super::queue::ExpungeSubcommand),
}

pub fn main() {
    let cmd = Command::from_args();
    crate::init_simple_log();

    match cmd {
        Command::Sync(cmd) => sync(cmd),
        Command::Check(cmd) => check(cmd),
        Command::Queue(QueueSubcommand::Flags(cmd)) => {
            super::queue::flags(cmd)
        },
        Command::Queue(QueueSubcommand::Expunge(cmd)) => {
            super::queue::expunge(cmd)
        },
        Command::Dump(cmd) => dump(cmd),
    }
}

pub(super) fn open_mbox(
    common: &CommonOptions,
    read_only: bool,
    config: SyncConfig,
) -> Mbox {
    match Mbox::open(&common.mbox, read_only, config) {
        Ok(mbox) => mbox,
        Err(e) => {
            eprintln!("Unable to open {}: {}", common.mbox.display(), e);
            EX_NOINPUT.exit()
        },
    }
}

fn sync(cmd: SyncSubcommand) {
    let config = SyncConfig {
        delay_writes: cmd.delay_writes,
        keep_recent: cmd.keep_recent,
        save_md5: cmd.save_md5,
        ..SyncConfig::default()
    };

    let mut flags = SyncFlags::empty();
    flags.set(SyncFlags::FORCE_FULL, cmd.force_full);
    flags.set(SyncFlags::UNDIRTY, cmd.undirty);
    flags.set(SyncFlags::REWRITE, cmd.rewrite);
    flags.set(SyncFlags::LOCK_READING, cmd.lock_reading);
    flags.set(SyncFlags::LAST_COMMIT, cmd.last_commit);
    flags.set(SyncFlags::HEADER_ONLY, cmd.header_only);

    let mut mbox = open_mbox(&cmd.common, cmd.read_only, config);
    if let Err(e) = mbox.sync(flags) {
        eprintln!("Sync of {} failed: {}", cmd.common.mbox.display(), e);
        EX_IOERR.exit()
    }
}

fn check(cmd: CommonOptions) {
    let mut mbox = open_mbox(&cmd, true, SyncConfig::default());
    match mbox.has_changed(true) {
        Ok(false) => (),
        Ok(true) => Sysexit(1).exit(),
        Err(e) => {
            eprintln!("Unable to check {}: {}", cmd.mbox.display(), e);
            EX_IOERR.exit()
        },
    }
}

fn dump(cmd: CommonOptions) {
    let mbox = open_mbox(&cmd, true, SyncConfig::default());
    let index = mbox.index();
    let hdr = index.header();

    println!(
        "uid-validity {}\nnext-uid {}\nsync-stamp {}\nsync-size {}",
        hdr.uid_validity, hdr.next_uid, hdr.sync_stamp, hdr.sync_size
    );

    let view = index.view();
    for seq in 1..=view.messages_count() {
        let rec = view.lookup(seq).unwrap();
        let keywords = rec
            .keywords
            .iter()
            .filter_map(|&id| view.keyword_name(id))
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{}: uid={} flags={:?} keywords=[{}] from-offset={:?}",
            seq, rec.uid, rec.flags, keywords, rec.from_offset
        );
    }
}

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

//! The `queue` subcommands: enqueue sync records against the index.

use structopt::StructOpt;

use super::main::{open_mbox, CommonOptions};
use crate::index::{MailFlags, SyncOp, SyncRecord};
use crate::mbox::SyncConfig;
use crate::support::sysexits::*;

#[derive(StructOpt)]
pub(super) struct FlagsSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// UID or inclusive UID range, e.g. `7` or `3:9`
    uids: String,

    /// Modifications, e.g. `+seen -flagged +kw:Work`
    #[structopt(required = true)]
    modifications: Vec<String>,
}

#[derive(StructOpt)]
pub(super) struct ExpungeSubcommand {
    #[structopt(flatten)]
    common: CommonOptions,

    /// UID or inclusive UID range, e.g. `7` or `3:9`
    uids: String,
}

fn parse_uid_range(s: &str) -> Option<(u32, u32)> {
    let mut parts = s.splitn(2, ':');
    let uid1: u32 = parts.next()?.parse().ok()?;
    let uid2 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => uid1,
    };

    if 0 == uid1 || uid2 < uid1 {
        None
    } else {
        Some((uid1, uid2))
    }
}

fn flag_by_name(name: &str) -> Option<MailFlags> {
    match name.to_ascii_lowercase().as_str() {
        "seen" => Some(MailFlags::SEEN),
        "answered" => Some(MailFlags::ANSWERED),
        "flagged" => Some(MailFlags::FLAGGED),
        "deleted" => Some(MailFlags::DELETED),
        "draft" => Some(MailFlags::DRAFT),
        _ => None,
    }
}

pub(super) fn flags(cmd: FlagsSubcommand) {
    let (uid1, uid2) = match parse_uid_range(&cmd.uids) {
        Some(r) => r,
        None => {
            eprintln!("Bad UID range: {}", cmd.uids);
            EX_USAGE.exit()
        },
    };

    let mut mbox = open_mbox(&cmd.common, true, SyncConfig::default());

    let mut records = Vec::new();
    let mut add = MailFlags::empty();
    let mut remove = MailFlags::empty();
    for modification in &cmd.modifications {
        let op = modification.as_bytes().first().copied();
        let rest = &modification[1.min(modification.len())..];
        let op = match op {
            Some(op @ b'+') | Some(op @ b'-') | Some(op @ b'=') => op,
            _ => {
                eprintln!("Bad modification: {}", modification);
                EX_USAGE.exit()
            },
        };

        if let Some(name) = rest.strip_prefix("kw:") {
            let keyword_id = |mbox: &mut crate::mbox::Mbox| match mbox
                .intern_keyword(name)
            {
                Ok(id) => id,
                Err(e) => {
                    eprintln!("Unable to intern keyword: {}", e);
                    EX_IOERR.exit()
                },
            };
            let sync_op = match op {
                b'=' => SyncOp::KeywordReset,
                b'+' if !name.is_empty() => {
                    SyncOp::KeywordAdd(keyword_id(&mut mbox))
                },
                b'-' if !name.is_empty() => {
                    SyncOp::KeywordRemove(keyword_id(&mut mbox))
                },
                _ => {
                    eprintln!("Bad modification: {}", modification);
                    EX_USAGE.exit()
                },
            };
            records.push(SyncRecord {
                uid1,
                uid2,
                op: sync_op,
            });
        } else {
            let flag = match flag_by_name(rest) {
                Some(f) if b'=' != op => f,
                _ => {
                    eprintln!("Unknown flag: {}", rest);
                    EX_USAGE.exit()
                },
            };
            match op {
                b'+' => add |= flag,
                _ => remove |= flag,
            }
        }
    }

    if !add.is_empty() || !remove.is_empty() {
        records.push(SyncRecord {
            uid1,
            uid2,
            op: SyncOp::Flags { add, remove },
        });
    }

    if let Err(e) = mbox.enqueue(records) {
        eprintln!("Unable to queue changes: {}", e);
        EX_IOERR.exit()
    }
}

pub(super) fn expunge(cmd: ExpungeSubcommand) {
    let (uid1, uid2) = match parse_uid_range(&cmd.uids) {
        Some(r) => r,
        None => {
            eprintln!("Bad UID range: {}", cmd.uids);
            EX_USAGE.exit()
        },
    };

    let mut mbox = open_mbox(&cmd.common, true, SyncConfig::default());
    if let Err(e) = mbox.enqueue(vec![SyncRecord {
        uid1,
        uid2,
        op: SyncOp::Expunge,
    }]) {
        eprintln!("Unable to queue expunge: {}", e);
        EX_IOERR.exit()
    }
}

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

//! On-disk representation of the index.
//!
//! The index is stored as a CBOR snapshot plus an append-only log of
//! committed transactions. Opening the index reads the snapshot and replays
//! the log over it; committing an index sync rolls the replayed state into a
//! fresh snapshot and truncates the log. The snapshot is always replaced
//! atomically, so a crash at any point leaves either the old or the new
//! state, never a torn one.
//!
//! Log framing is a LE u32 byte length followed by that many bytes of CBOR
//! encoding a `Vec<TxOp>`. A truncated trailing frame (crash mid-append) is
//! discarded with a warning.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use serde::{Deserialize, Serialize};

use super::transaction::TxOp;
use super::types::*;
use crate::support::error::Error;
use crate::support::file_ops;

/// The whole persistent state of an index.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub(super) struct IndexState {
    pub(super) header: IndexHeader,
    pub(super) keywords: Vec<String>,
    pub(super) records: Vec<IndexRecord>,
    /// Modifications queued for the next mbox sync, in enqueue order.
    pub(super) pending: Vec<SyncRecord>,
}

/// Apply a committed transaction's operations to `state`.
///
/// Operations are applied in order except expunges, which are deferred to
/// the end (largest sequence first) so that the sequence numbers recorded in
/// the other operations stay valid throughout.
pub(super) fn apply_ops(state: &mut IndexState, ops: &[TxOp]) {
    let mut expunges = Vec::new();

    for op in ops {
        match *op {
            TxOp::InternKeyword(ref name) => {
                if !state
                    .keywords
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(name))
                {
                    state.keywords.push(name.clone());
                }
            },
            TxOp::Append {
                uid,
                flags,
                ref keywords,
            } => {
                state.records.push(IndexRecord {
                    uid,
                    flags,
                    keywords: keywords.clone(),
                    from_offset: None,
                    hdr_md5: None,
                });
            },
            TxOp::UpdateFlags { seq, mode, flags } => {
                if let Some(rec) = record_mut(state, seq) {
                    match mode {
                        UpdateMode::Replace => rec.flags = flags,
                        UpdateMode::Add => rec.flags |= flags,
                        UpdateMode::Remove => rec.flags &= !flags,
                    }
                }
            },
            TxOp::UpdateKeywords { seq, mode, ref ids } => {
                if let Some(rec) = record_mut(state, seq) {
                    match mode {
                        UpdateMode::Replace => {
                            rec.keywords = ids.clone();
                            rec.keywords.sort_unstable();
                            rec.keywords.dedup();
                        },
                        UpdateMode::Add => {
                            for &id in ids {
                                let _ = apply_keyword_sync(
                                    &mut rec.keywords,
                                    &SyncOp::KeywordAdd(id),
                                );
                            }
                        },
                        UpdateMode::Remove => {
                            for &id in ids {
                                let _ = apply_keyword_sync(
                                    &mut rec.keywords,
                                    &SyncOp::KeywordRemove(id),
                                );
                            }
                        },
                    }
                }
            },
            TxOp::UpdateFromOffset { seq, offset } => {
                if let Some(rec) = record_mut(state, seq) {
                    rec.from_offset = Some(offset);
                }
            },
            TxOp::UpdateHdrMd5 { seq, md5 } => {
                if let Some(rec) = record_mut(state, seq) {
                    rec.hdr_md5 = Some(md5);
                }
            },
            TxOp::Expunge { seq } => expunges.push(seq),
            TxOp::SetUidValidity(v) => state.header.uid_validity = v,
            TxOp::SetNextUid(v) => state.header.next_uid = v,
            TxOp::SetSyncStamp(v) => state.header.sync_stamp = v,
            TxOp::SetSyncSize(v) => state.header.sync_size = v,
            TxOp::Enqueue(ref rec) => state.pending.push(rec.clone()),
        }
    }

    expunges.sort_unstable();
    expunges.dedup();
    for &seq in expunges.iter().rev() {
        if seq >= 1 && (seq as usize) <= state.records.len() {
            state.records.remove(seq as usize - 1);
        }
    }
}

fn record_mut(state: &mut IndexState, seq: u32) -> Option<&mut IndexRecord> {
    if 0 == seq {
        return None;
    }
    state.records.get_mut(seq as usize - 1)
}

/// Load the index state from `path` + `log_path`.
///
/// A missing, unreadable, garbled, or corruption-poisoned snapshot yields a
/// fresh default state, which forces the next sync to run full.
pub(super) fn load(
    path: &Path,
    log_path: &Path,
    log_prefix: &str,
) -> IndexState {
    let mut state = match fs::read(path) {
        Ok(bytes) => match serde_cbor::from_slice::<IndexState>(&bytes) {
            Ok(state) => {
                if state.header.corrupted {
                    warn!(
                        "{} Index was marked corrupted; rebuilding",
                        log_prefix
                    );
                    IndexState::default()
                } else {
                    state
                }
            },
            Err(e) => {
                warn!("{} Index unreadable ({}); rebuilding", log_prefix, e);
                IndexState::default()
            },
        },
        Err(ref e) if io::ErrorKind::NotFound == e.kind() => {
            IndexState::default()
        },
        Err(e) => {
            warn!("{} Cannot read index ({}); rebuilding", log_prefix, e);
            IndexState::default()
        },
    };

    match fs::File::open(log_path) {
        Ok(file) => replay_log(&mut state, file, log_prefix),
        Err(ref e) if io::ErrorKind::NotFound == e.kind() => (),
        Err(e) => {
            warn!("{} Cannot read index log ({}); ignoring", log_prefix, e)
        },
    }

    state
}

fn replay_log(state: &mut IndexState, mut file: fs::File, log_prefix: &str) {
    loop {
        let len = match file.read_u32::<LittleEndian>() {
            Ok(len) => len,
            Err(ref e) if io::ErrorKind::UnexpectedEof == e.kind() => break,
            Err(e) => {
                warn!("{} Index log read failed: {}", log_prefix, e);
                break;
            },
        };

        let mut buf = vec![0u8; len as usize];
        if let Err(e) = file.read_exact(&mut buf) {
            warn!(
                "{} Discarding truncated index log frame: {}",
                log_prefix, e
            );
            break;
        }

        match serde_cbor::from_slice::<Vec<TxOp>>(&buf) {
            Ok(ops) => apply_ops(state, &ops),
            Err(e) => {
                warn!(
                    "{} Discarding garbled index log frame: {}",
                    log_prefix, e
                );
                break;
            },
        }
    }
}

/// Append one committed transaction to the log.
pub(super) fn append_log(log_path: &Path, ops: &[TxOp]) -> Result<(), Error> {
    let bytes = serde_cbor::to_vec(&ops)?;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;
    file.write_u32::<LittleEndian>(bytes.len() as u32)?;
    file.write_all(&bytes)?;
    file.sync_data()?;
    Ok(())
}

/// Replace the snapshot with `state` and truncate the log.
pub(super) fn rollup(
    path: &Path,
    log_path: &Path,
    state: &IndexState,
) -> Result<(), Error> {
    let bytes = serde_cbor::to_vec(state)?;
    let tmp = path.parent().unwrap_or_else(|| Path::new("."));
    file_ops::spit(tmp, path, true, 0o600, &bytes)?;

    match fs::remove_file(log_path) {
        Ok(_) => Ok(()),
        Err(ref e) if io::ErrorKind::NotFound == e.kind() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn apply_expunges_last_and_descending() {
        let mut state = IndexState::default();
        apply_ops(
            &mut state,
            &[
                TxOp::Append {
                    uid: 1,
                    flags: MailFlags::empty(),
                    keywords: vec![],
                },
                TxOp::Append {
                    uid: 2,
                    flags: MailFlags::empty(),
                    keywords: vec![],
                },
                TxOp::Append {
                    uid: 3,
                    flags: MailFlags::empty(),
                    keywords: vec![],
                },
            ],
        );

        // The flag update on seq 3 must land on UID 3 even though seq 1 is
        // expunged in the same transaction.
        apply_ops(
            &mut state,
            &[
                TxOp::Expunge { seq: 1 },
                TxOp::UpdateFlags {
                    seq: 3,
                    mode: UpdateMode::Add,
                    flags: MailFlags::SEEN,
                },
            ],
        );

        assert_eq!(2, state.records.len());
        assert_eq!(2, state.records[0].uid);
        assert_eq!(3, state.records[1].uid);
        assert!(state.records[1].flags.contains(MailFlags::SEEN));
    }

    #[test]
    fn log_replay_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let snap = dir.path().join("idx");
        let log = dir.path().join("idx.log");

        let mut state = IndexState::default();
        let ops = vec![
            TxOp::Append {
                uid: 7,
                flags: MailFlags::SEEN,
                keywords: vec![],
            },
            TxOp::SetNextUid(8),
        ];
        apply_ops(&mut state, &ops);
        rollup(&snap, &log, &state).unwrap();

        let ops2 = vec![TxOp::UpdateFromOffset { seq: 1, offset: 42 }];
        append_log(&log, &ops2).unwrap();

        let loaded = load(&snap, &log, "test");
        assert_eq!(8, loaded.header.next_uid);
        assert_eq!(1, loaded.records.len());
        assert_eq!(Some(42), loaded.records[0].from_offset);

        // Rolling up again truncates the log
        rollup(&snap, &log, &loaded).unwrap();
        assert!(!log.exists());
        let reloaded = load(&snap, &log, "test");
        assert_eq!(Some(42), reloaded.records[0].from_offset);
    }

    #[test]
    fn truncated_log_frame_is_discarded() {
        let dir = tempfile::TempDir::new().unwrap();
        let snap = dir.path().join("idx");
        let log = dir.path().join("idx.log");

        append_log(
            &log,
            &[TxOp::Append {
                uid: 1,
                flags: MailFlags::empty(),
                keywords: vec![],
            }],
        )
        .unwrap();

        // Simulate a crash mid-append of a second frame
        let mut file = fs::OpenOptions::new().append(true).open(&log).unwrap();
        file.write_u32::<LittleEndian>(1000).unwrap();
        file.write_all(b"short").unwrap();
        drop(file);

        let state = load(&snap, &log, "test");
        assert_eq!(1, state.records.len());
    }
}

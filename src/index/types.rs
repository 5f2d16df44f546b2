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

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Per-message flag bits.
    ///
    /// The low five bits mirror the flags stored in the mbox `Status` and
    /// `X-Status` headers and are the only bits that persist as "real" mail
    /// flags. `RECENT` and `DIRTY` are bookkeeping bits; `EXPUNGED` never
    /// reaches the index and only marks reclaimed space within a sync pass.
    pub struct MailFlags: u8 {
        const SEEN = 1 << 0;
        const ANSWERED = 1 << 1;
        const FLAGGED = 1 << 2;
        const DELETED = 1 << 3;
        const DRAFT = 1 << 4;
        const RECENT = 1 << 5;
        /// The on-disk flags are stale; the index holds the truth.
        const DIRTY = 1 << 6;
        /// Sync-internal: this record describes reclaimable space.
        const EXPUNGED = 1 << 7;

        /// The flags that map to mbox Status/X-Status characters.
        const FLAGS_MASK = Self::SEEN.bits
            | Self::ANSWERED.bits
            | Self::FLAGGED.bits
            | Self::DELETED.bits
            | Self::DRAFT.bits;
        /// Bits managed by the sync machinery itself.
        const SYNC_FLAGS = Self::RECENT.bits | Self::DIRTY.bits;
    }
}

impl Serialize for MailFlags {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MailFlags {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Self, D::Error> {
        Ok(MailFlags::from_bits_truncate(u8::deserialize(deserializer)?))
    }
}

impl Default for MailFlags {
    fn default() -> Self {
        MailFlags::empty()
    }
}

/// The mutable header of the index.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IndexHeader {
    /// UID validity of the mailbox, or 0 if never assigned.
    pub uid_validity: u32,
    /// The UID that will be given to the next new message.
    pub next_uid: u32,
    /// mtime of the mbox file at the end of the last successful sync.
    pub sync_stamp: u32,
    /// Size of the mbox file at the end of the last successful sync.
    pub sync_size: u64,
    /// Set when the index is known to disagree with reality beyond repair.
    /// A corrupted index is discarded on open.
    pub corrupted: bool,
}

impl Default for IndexHeader {
    fn default() -> Self {
        IndexHeader {
            uid_validity: 0,
            next_uid: 1,
            sync_stamp: 0,
            sync_size: 0,
            corrupted: false,
        }
    }
}

/// One message as the index knows it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IndexRecord {
    pub uid: u32,
    pub flags: MailFlags,
    /// Sorted keyword ids (indices into the index keyword table).
    pub keywords: Vec<u32>,
    /// Byte offset of the message's From-line span in the mbox file.
    pub from_offset: Option<u64>,
    /// MD5 sum over the message's invariant headers, if computed.
    pub hdr_md5: Option<[u8; 16]>,
}

/// Mode for flag and keyword updates.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateMode {
    Replace,
    Add,
    Remove,
}

/// A pending modification queued against the index, to be applied to the
/// mbox file by the next sync.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SyncRecord {
    /// First UID of the affected range, inclusive.
    pub uid1: u32,
    /// Last UID of the affected range, inclusive.
    pub uid2: u32,
    pub op: SyncOp,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum SyncOp {
    /// Messages in the range were appended by a delivery agent which has
    /// already assigned their UIDs. Only `next_uid` needs adjusting.
    Append,
    Expunge,
    Flags { add: MailFlags, remove: MailFlags },
    KeywordAdd(u32),
    KeywordRemove(u32),
    KeywordReset,
}

impl SyncRecord {
    pub fn is_expunge(&self) -> bool {
        SyncOp::Expunge == self.op
    }
}

/// Apply a flag sync record to a working flag set.
pub fn apply_flag_sync(
    flags: &mut MailFlags,
    add: MailFlags,
    remove: MailFlags,
) {
    *flags |= add;
    *flags &= !remove;
}

/// Apply a keyword sync record to a working sorted keyword array.
///
/// Returns whether the array changed.
pub fn apply_keyword_sync(keywords: &mut Vec<u32>, op: &SyncOp) -> bool {
    match *op {
        SyncOp::KeywordAdd(id) => match keywords.binary_search(&id) {
            Ok(_) => false,
            Err(ix) => {
                keywords.insert(ix, id);
                true
            },
        },
        SyncOp::KeywordRemove(id) => match keywords.binary_search(&id) {
            Ok(ix) => {
                keywords.remove(ix);
                true
            },
            Err(_) => false,
        },
        SyncOp::KeywordReset => {
            let changed = !keywords.is_empty();
            keywords.clear();
            changed
        },
        _ => false,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flag_masks() {
        assert!(MailFlags::FLAGS_MASK.contains(MailFlags::SEEN));
        assert!(MailFlags::FLAGS_MASK.contains(MailFlags::DRAFT));
        assert!(!MailFlags::FLAGS_MASK.contains(MailFlags::RECENT));
        assert!(!MailFlags::FLAGS_MASK.contains(MailFlags::DIRTY));
        assert!(MailFlags::SYNC_FLAGS.contains(MailFlags::RECENT));
        assert!(!MailFlags::SYNC_FLAGS.contains(MailFlags::EXPUNGED));
    }

    #[test]
    fn keyword_sync_application() {
        let mut kw = vec![1, 3];

        assert!(apply_keyword_sync(&mut kw, &SyncOp::KeywordAdd(2)));
        assert_eq!(vec![1, 2, 3], kw);
        assert!(!apply_keyword_sync(&mut kw, &SyncOp::KeywordAdd(2)));

        assert!(apply_keyword_sync(&mut kw, &SyncOp::KeywordRemove(1)));
        assert_eq!(vec![2, 3], kw);
        assert!(!apply_keyword_sync(&mut kw, &SyncOp::KeywordRemove(9)));

        assert!(apply_keyword_sync(&mut kw, &SyncOp::KeywordReset));
        assert!(kw.is_empty());
        assert!(!apply_keyword_sync(&mut kw, &SyncOp::KeywordReset));
    }
}

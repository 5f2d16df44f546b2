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

use serde::{Deserialize, Serialize};

use super::types::*;
use super::view::IndexView;

/// One buffered index operation.
///
/// Sequence numbers are relative to the view the transaction was opened
/// against. Appended records get sequences just past the view's message
/// count, in order of appending. Expunges are applied only after every other
/// operation so that sequences stay stable for the whole transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum TxOp {
    InternKeyword(String),
    Append {
        uid: u32,
        flags: MailFlags,
        keywords: Vec<u32>,
    },
    UpdateFlags {
        seq: u32,
        mode: UpdateMode,
        flags: MailFlags,
    },
    UpdateKeywords {
        seq: u32,
        mode: UpdateMode,
        ids: Vec<u32>,
    },
    UpdateFromOffset {
        seq: u32,
        offset: u64,
    },
    UpdateHdrMd5 {
        seq: u32,
        md5: [u8; 16],
    },
    Expunge {
        seq: u32,
    },
    SetUidValidity(u32),
    SetNextUid(u32),
    SetSyncStamp(u32),
    SetSyncSize(u64),
    Enqueue(SyncRecord),
}

/// A buffered set of index modifications.
///
/// Nothing is visible to anyone until the transaction is committed through
/// `MailIndex::commit()`. Rolling back is simply dropping the transaction.
#[derive(Debug)]
pub struct Transaction {
    base_messages: u32,
    base_keywords: u32,
    appended: u32,
    new_keywords: Vec<String>,
    pub(super) ops: Vec<TxOp>,
}

impl Transaction {
    pub fn new(view: &IndexView) -> Self {
        Transaction {
            base_messages: view.messages_count(),
            base_keywords: view.keywords.len() as u32,
            appended: 0,
            new_keywords: Vec::new(),
            ops: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append a new record with the given UID, returning its sequence.
    pub fn append(&mut self, uid: u32) -> u32 {
        self.appended += 1;
        self.ops.push(TxOp::Append {
            uid,
            flags: MailFlags::empty(),
            keywords: Vec::new(),
        });
        self.base_messages + self.appended
    }

    pub fn expunge(&mut self, seq: u32) {
        debug_assert!(seq > 0);
        self.ops.push(TxOp::Expunge { seq });
    }

    pub fn update_flags(
        &mut self,
        seq: u32,
        mode: UpdateMode,
        flags: MailFlags,
    ) {
        self.ops.push(TxOp::UpdateFlags { seq, mode, flags });
    }

    pub fn update_keywords(&mut self, seq: u32, mode: UpdateMode, ids: &[u32]) {
        self.ops.push(TxOp::UpdateKeywords {
            seq,
            mode,
            ids: ids.to_vec(),
        });
    }

    pub fn update_from_offset(&mut self, seq: u32, offset: u64) {
        self.ops.push(TxOp::UpdateFromOffset { seq, offset });
    }

    pub fn update_hdr_md5(&mut self, seq: u32, md5: [u8; 16]) {
        self.ops.push(TxOp::UpdateHdrMd5 { seq, md5 });
    }

    pub fn set_uid_validity(&mut self, uid_validity: u32) {
        self.ops.push(TxOp::SetUidValidity(uid_validity));
    }

    pub fn set_next_uid(&mut self, next_uid: u32) {
        self.ops.push(TxOp::SetNextUid(next_uid));
    }

    pub fn set_sync_stamp(&mut self, sync_stamp: u32) {
        self.ops.push(TxOp::SetSyncStamp(sync_stamp));
    }

    pub fn set_sync_size(&mut self, sync_size: u64) {
        self.ops.push(TxOp::SetSyncSize(sync_size));
    }

    /// Queue a sync record for a later mbox sync pass.
    pub fn enqueue(&mut self, rec: SyncRecord) {
        self.ops.push(TxOp::Enqueue(rec));
    }

    /// Intern `name` in the keyword table, returning its id.
    ///
    /// Ids assigned within the transaction become durable on commit; the
    /// intern operation is recorded before any operation that references the
    /// new id.
    pub fn keyword_id(&mut self, view: &IndexView, name: &str) -> u32 {
        if let Some(id) = view.find_keyword(name) {
            return id;
        }

        if let Some(ix) = self
            .new_keywords
            .iter()
            .position(|k| k.eq_ignore_ascii_case(name))
        {
            return self.base_keywords + ix as u32;
        }

        let id = self.base_keywords + self.new_keywords.len() as u32;
        self.new_keywords.push(name.to_owned());
        self.ops.push(TxOp::InternKeyword(name.to_owned()));
        id
    }

    /// Resolve a keyword id against the view plus this transaction's
    /// still-uncommitted interns.
    pub fn keyword_name<'a>(
        &'a self,
        view: &'a IndexView,
        id: u32,
    ) -> Option<&'a str> {
        if id < self.base_keywords {
            view.keyword_name(id)
        } else {
            self.new_keywords
                .get((id - self.base_keywords) as usize)
                .map(|s| &s[..])
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::view::IndexView;
    use super::*;

    fn empty_view() -> IndexView {
        IndexView {
            header: IndexHeader::default(),
            keywords: vec!["work".to_owned()],
            records: vec![],
        }
    }

    #[test]
    fn append_assigns_sequences() {
        let view = empty_view();
        let mut tx = Transaction::new(&view);

        assert!(tx.is_empty());
        assert_eq!(1, tx.append(100));
        assert_eq!(2, tx.append(101));
        assert!(!tx.is_empty());
    }

    #[test]
    fn keyword_interning() {
        let view = empty_view();
        let mut tx = Transaction::new(&view);

        assert_eq!(0, tx.keyword_id(&view, "work"));
        assert_eq!(0, tx.keyword_id(&view, "WORK"));
        assert_eq!(1, tx.keyword_id(&view, "todo"));
        assert_eq!(1, tx.keyword_id(&view, "todo"));
        assert_eq!(2, tx.keyword_id(&view, "later"));

        assert_eq!(Some("work"), tx.keyword_name(&view, 0));
        assert_eq!(Some("todo"), tx.keyword_name(&view, 1));
        assert_eq!(Some("later"), tx.keyword_name(&view, 2));
        assert_eq!(None, tx.keyword_name(&view, 3));

        // Only the two new names were recorded as interns
        assert_eq!(
            2,
            tx.ops
                .iter()
                .filter(|op| matches!(op, TxOp::InternKeyword(_)))
                .count()
        );
    }
}

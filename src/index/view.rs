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

use super::types::*;

/// A point-in-time snapshot of the index, taken when an index sync begins.
///
/// All sequence numbers are 1-based positions into this snapshot and remain
/// stable for its lifetime regardless of what a concurrent transaction
/// buffers up.
#[derive(Clone, Debug)]
pub struct IndexView {
    pub(super) header: IndexHeader,
    pub(super) keywords: Vec<String>,
    pub(super) records: Vec<IndexRecord>,
}

impl IndexView {
    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn messages_count(&self) -> u32 {
        self.records.len() as u32
    }

    /// Look up the record at the given 1-based sequence.
    pub fn lookup(&self, seq: u32) -> Option<&IndexRecord> {
        if 0 == seq {
            return None;
        }
        self.records.get(seq as usize - 1)
    }

    pub fn lookup_uid(&self, seq: u32) -> Option<u32> {
        self.lookup(seq).map(|r| r.uid)
    }

    /// Find the sequence range of records whose UIDs fall within
    /// `[uid1, uid2]`, returning `(first_seq, last_seq)`.
    ///
    /// Returns `None` when no record falls in the range. Records are sorted
    /// by UID, which the sync machinery guarantees.
    pub fn lookup_uid_range(&self, uid1: u32, uid2: u32) -> Option<(u32, u32)> {
        let start = self.records.partition_point(|r| r.uid < uid1);
        let end = self.records.partition_point(|r| r.uid <= uid2);
        if start >= end {
            None
        } else {
            Some((start as u32 + 1, end as u32))
        }
    }

    pub fn lookup_keywords(&self, seq: u32) -> Option<&[u32]> {
        self.lookup(seq).map(|r| &r.keywords[..])
    }

    /// Look up the stored mbox from-offset extension of a record.
    pub fn lookup_from_offset(&self, seq: u32) -> Option<u64> {
        self.lookup(seq).and_then(|r| r.from_offset)
    }

    /// Look up the stored header-MD5 extension of a record.
    pub fn lookup_hdr_md5(&self, seq: u32) -> Option<[u8; 16]> {
        self.lookup(seq).and_then(|r| r.hdr_md5)
    }

    pub fn keyword_name(&self, id: u32) -> Option<&str> {
        self.keywords.get(id as usize).map(|s| &s[..])
    }

    pub fn find_keyword(&self, name: &str) -> Option<u32> {
        self.keywords
            .iter()
            .position(|k| k.eq_ignore_ascii_case(name))
            .map(|ix| ix as u32)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rec(uid: u32) -> IndexRecord {
        IndexRecord {
            uid,
            flags: MailFlags::empty(),
            keywords: vec![],
            from_offset: None,
            hdr_md5: None,
        }
    }

    fn view(uids: &[u32]) -> IndexView {
        IndexView {
            header: IndexHeader::default(),
            keywords: vec!["work".to_owned(), "todo".to_owned()],
            records: uids.iter().copied().map(rec).collect(),
        }
    }

    #[test]
    fn uid_range_lookup() {
        let v = view(&[2, 5, 7, 11]);

        assert_eq!(Some((1, 4)), v.lookup_uid_range(1, u32::MAX));
        assert_eq!(Some((2, 3)), v.lookup_uid_range(5, 7));
        assert_eq!(Some((2, 2)), v.lookup_uid_range(3, 6));
        assert_eq!(None, v.lookup_uid_range(3, 4));
        assert_eq!(None, v.lookup_uid_range(12, u32::MAX));
        assert_eq!(Some((1, 1)), v.lookup_uid_range(2, 2));
    }

    #[test]
    fn seq_lookup_is_one_based() {
        let v = view(&[2, 5]);

        assert_eq!(None, v.lookup(0));
        assert_eq!(Some(2), v.lookup_uid(1));
        assert_eq!(Some(5), v.lookup_uid(2));
        assert_eq!(None, v.lookup(3));
    }

    #[test]
    fn keyword_lookup() {
        let v = view(&[]);

        assert_eq!(Some(0), v.find_keyword("work"));
        assert_eq!(Some(0), v.find_keyword("Work"));
        assert_eq!(Some("todo"), v.keyword_name(1));
        assert_eq!(None, v.find_keyword("missing"));
        assert_eq!(None, v.keyword_name(2));
    }
}

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

//! The mbox sync state machine.
//!
//! Modifying an mbox can be slow, so it is done all at once, minimising the
//! required disk I/O. One pass may need to:
//!
//! - Update message flags in `Status`, `X-Status` and `X-Keywords` headers
//! - Write missing `X-UID` and `X-IMAP(base)` headers
//! - Write missing or broken `Content-Length` headers where there's room
//! - Expunge messages
//!
//! The pass reads messages from the beginning, remembering how much
//! trailing-space padding each message's managed headers carry. A header
//! that must change is rewritten in place when the padding suffices.
//! Otherwise a *window* opens: subsequent messages' padding keeps
//! accumulating until it covers everything the window needs, at which point
//! the whole window is rewritten in one batch. An expunged message
//! contributes its entire span; whatever expunged space survives the
//! windows is reclaimed by shifting every following message backward and
//! truncating the file at the end. A window still open at end of file is
//! settled by growing the file, exactly once, at its tail.
//!
//! The driver decides between a *partial* pass (skip straight to the UIDs
//! with pending work; safe only while the file is structurally unchanged)
//! and a *full* pass, and retries in full mode when a partial pass turns
//! out to be unsafe, up to three attempts. Failures roll the index
//! transaction back; the file may already have been modified, but the
//! index header is only updated on commit, so the next sync observes the
//! mismatch and rescans.

mod defs;
mod driver;
mod header;
mod index_sync;
mod reader;
mod records;
mod space;

#[cfg(test)]
mod tests;

pub use self::defs::SyncFlags;

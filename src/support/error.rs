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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not a valid mbox file")]
    NotMbox,
    #[error("mbox is read-only")]
    MboxReadOnly,
    #[error("Lost From-line in mbox file")]
    LostFromLine,
    #[error("mbox file shrank during sync")]
    MboxShrank,
    #[error("UIDVALIDITY changed in mbox file")]
    UidValidityChanged,
    #[error("X-IMAPbase uid-last field unexpectedly lost")]
    UidLastLost,
    #[error("Message index is corrupted")]
    IndexCorrupted,
    #[error("Sync failed repeatedly; giving up")]
    SyncRetriesExhausted,
    #[error("Timed out waiting for mbox lock")]
    LockTimeout,
    #[error("No such message in index")]
    NxMessage,
    #[error("Unsupported/unknown flag")]
    NxFlag,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Nix(#[from] nix::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Cbor(#[from] serde_cbor::error::Error),
}

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

//! Advisory region locking on the mbox file.
//!
//! Locking uses `fcntl()` record locks covering the whole file, which is what
//! other mbox-aware software on the system conventionally honours. The locks
//! are advisory; nothing prevents a rogue process from scribbling over the
//! file anyway.
//!
//! Acquisition polls with `F_SETLK` rather than blocking in `F_SETLKW` so
//! that a wedged peer cannot hang us forever.

use std::fs;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg};
use nix::libc;

use crate::support::error::Error;

/// How long to keep retrying lock acquisition before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(300);
/// Delay between acquisition attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

impl LockType {
    fn to_c(self) -> libc::c_short {
        match self {
            LockType::Shared => libc::F_RDLCK as libc::c_short,
            LockType::Exclusive => libc::F_WRLCK as libc::c_short,
        }
    }
}

/// An advisory lock held on an open mbox file.
///
/// The lock is released when the guard is dropped (or when the file is
/// closed, since these are POSIX record locks).
#[derive(Debug)]
pub struct MboxLock {
    fd: RawFd,
    lock_type: LockType,
}

fn whole_file(lock_type: libc::c_short) -> libc::flock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;
    fl
}

impl MboxLock {
    /// Acquire a lock of the given type on `file`, polling until
    /// `LOCK_TIMEOUT` expires.
    pub fn acquire(
        file: &fs::File,
        lock_type: LockType,
    ) -> Result<Self, Error> {
        let fd = file.as_raw_fd();
        let deadline = Instant::now() + LOCK_TIMEOUT;

        loop {
            let fl = whole_file(lock_type.to_c());
            match fcntl(fd, FcntlArg::F_SETLK(&fl)) {
                Ok(_) => return Ok(MboxLock { fd, lock_type }),
                Err(nix::errno::Errno::EACCES)
                | Err(nix::errno::Errno::EAGAIN) => (),
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(Error::LockTimeout);
            }

            std::thread::sleep(LOCK_RETRY_DELAY);
        }
    }

    /// Convert this lock to the given type in place.
    ///
    /// Downgrading always succeeds immediately; upgrading may need to wait
    /// for readers to finish, with the same timeout as `acquire()`.
    pub fn convert(&mut self, lock_type: LockType) -> Result<(), Error> {
        if lock_type == self.lock_type {
            return Ok(());
        }

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            let fl = whole_file(lock_type.to_c());
            match fcntl(self.fd, FcntlArg::F_SETLK(&fl)) {
                Ok(_) => {
                    self.lock_type = lock_type;
                    return Ok(());
                },
                Err(nix::errno::Errno::EACCES)
                | Err(nix::errno::Errno::EAGAIN) => (),
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                return Err(Error::LockTimeout);
            }

            std::thread::sleep(LOCK_RETRY_DELAY);
        }
    }

    pub fn lock_type(&self) -> LockType {
        self.lock_type
    }
}

impl Drop for MboxLock {
    fn drop(&mut self) {
        let fl = whole_file(libc::F_UNLCK as libc::c_short);
        let _ = fcntl(self.fd, FcntlArg::F_SETLK(&fl));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_unlock_cycle() {
        let file = tempfile::tempfile().unwrap();

        let mut lock = MboxLock::acquire(&file, LockType::Shared).unwrap();
        assert_eq!(LockType::Shared, lock.lock_type());

        // POSIX record locks do not conflict within one process, so all we
        // can verify here is that conversion and re-acquisition succeed.
        lock.convert(LockType::Exclusive).unwrap();
        assert_eq!(LockType::Exclusive, lock.lock_type());
        lock.convert(LockType::Shared).unwrap();
        drop(lock);

        let lock = MboxLock::acquire(&file, LockType::Exclusive).unwrap();
        drop(lock);
    }
}

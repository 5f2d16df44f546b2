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

//! Miscellaneous functions for working with files.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::Path;

/// Write `data` into the file at `path`, atomically.
///
/// The file will first be staged within `tmp`.
///
/// If `overwrite` is true, this will replace anything already at `path`. If
/// false, the call will fail if `path` already exists.
pub fn spit(
    tmp: impl AsRef<Path>,
    path: impl AsRef<Path>,
    overwrite: bool,
    mode: u32,
    data: &[u8],
) -> io::Result<()> {
    let mut tf = tempfile::NamedTempFile::new_in(tmp)?;
    tf.as_file_mut().write_all(data)?;
    fs::set_permissions(tf.path(), fs::Permissions::from_mode(mode))?;
    tf.as_file_mut().sync_all()?;
    if overwrite {
        tf.persist(path)?;
    } else {
        tf.persist_noclobber(path)?;
    }
    Ok(())
}

/// Copy `len` bytes within `file` from offset `src` to offset `dst`,
/// `memmove()`-style: the ranges may overlap in either direction.
pub fn move_within(
    file: &fs::File,
    dst: u64,
    src: u64,
    len: u64,
) -> io::Result<()> {
    const CHUNK: u64 = 64 * 1024;

    if 0 == len || src == dst {
        return Ok(());
    }

    let mut buf = vec![0u8; CHUNK.min(len) as usize];

    if dst < src {
        // Moving toward the start; copy front to back.
        let mut done = 0u64;
        while done < len {
            let n = CHUNK.min(len - done) as usize;
            file.read_exact_at(&mut buf[..n], src + done)?;
            file.write_all_at(&buf[..n], dst + done)?;
            done += n as u64;
        }
    } else {
        // Moving toward the end; copy back to front so the source is
        // consumed before it is overwritten.
        let mut remaining = len;
        while remaining > 0 {
            let n = CHUNK.min(remaining) as usize;
            remaining -= n as u64;
            file.read_exact_at(&mut buf[..n], src + remaining)?;
            file.write_all_at(&buf[..n], dst + remaining)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use super::*;

    fn file_with(content: &[u8]) -> fs::File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(content).unwrap();
        f
    }

    fn contents(mut f: &fs::File) -> Vec<u8> {
        use std::io::Seek;
        let mut buf = Vec::new();
        f.seek(io::SeekFrom::Start(0)).unwrap();
        f.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn move_backward() {
        let f = file_with(b"0123456789");
        move_within(&f, 2, 5, 5).unwrap();
        assert_eq!(b"0156789789".to_vec(), contents(&f));
    }

    #[test]
    fn move_forward_overlapping() {
        let f = file_with(b"0123456789");
        f.set_len(12).unwrap();
        move_within(&f, 4, 2, 8).unwrap();
        assert_eq!(b"012323456789".to_vec(), contents(&f));
    }

    #[test]
    fn move_zero_len_is_noop() {
        let f = file_with(b"abc");
        move_within(&f, 0, 2, 0).unwrap();
        assert_eq!(b"abc".to_vec(), contents(&f));
    }
}

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

//! Reading and writing mbox `From ` delimiter lines.

use chrono::prelude::*;

/// Return whether `data` begins a `From ` delimiter line.
pub fn is_from_line(data: &[u8]) -> bool {
    data.starts_with(b"From ")
}

/// Return whether the bytes at the start of `data` form a message separator:
/// a newline (LF or CRLF) followed by a `From ` line.
///
/// On match, returns the length of the separator newline (1 or 2).
pub fn separator_at(data: &[u8]) -> Option<usize> {
    if data.starts_with(b"\nFrom ") {
        Some(1)
    } else if data.starts_with(b"\r\nFrom ") {
        Some(2)
    } else {
        None
    }
}

/// Generate a `From ` line for the given envelope sender.
///
/// The date is rendered in the traditional 24-character `ctime()` format
/// that mbox consumers expect.
pub fn generate(sender: &str, time: DateTime<Utc>) -> String {
    format!("From {} {}\n", sender, time.format("%a %b %e %H:%M:%S %Y"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn from_line_detection() {
        assert!(is_from_line(
            b"From foo@example.com Thu Jan  1 00:00:00 1970\n"
        ));
        assert!(!is_from_line(b"From: foo@example.com\n"));
        assert!(!is_from_line(b">From quoted\n"));
    }

    #[test]
    fn separator_detection() {
        assert_eq!(Some(1), separator_at(b"\nFrom x\n"));
        assert_eq!(Some(2), separator_at(b"\r\nFrom x\n"));
        assert_eq!(None, separator_at(b"From x\n"));
        assert_eq!(None, separator_at(b"\nFrom: x\n"));
    }

    #[test]
    fn generated_line_shape() {
        let time = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            "From MAILER-DAEMON Thu Jan  1 00:00:00 1970\n",
            generate("MAILER-DAEMON", time)
        );
    }
}

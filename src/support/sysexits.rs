//-
// Copyright (c) 2020, Jason Lingle
//
// This file is part of Mailcore.
//
// Mailcore is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailcore is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailcore. If not, see <http://www.gnu.org/licenses/>.

//! Constants from `sysexits.h`, and the mapping of store errors onto them.

use super::error::Error;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Sysexit(pub i32);

pub const EX_OK: Sysexit = Sysexit(0);
pub const EX_USAGE: Sysexit = Sysexit(64);
pub const EX_DATAERR: Sysexit = Sysexit(65);
pub const EX_NOINPUT: Sysexit = Sysexit(66);
pub const EX_SOFTWARE: Sysexit = Sysexit(70);
pub const EX_IOERR: Sysexit = Sysexit(74);
pub const EX_TEMPFAIL: Sysexit = Sysexit(75);
pub const EX_NOPERM: Sysexit = Sysexit(77);
pub const EX_CONFIG: Sysexit = Sysexit(78);

impl Sysexit {
    pub fn exit(self) -> ! {
        std::process::exit(self.0)
    }
}

impl From<&Error> for Sysexit {
    fn from(e: &Error) -> Self {
        match *e {
            Error::Config(..) | Error::NegativeBatchSize(..) => EX_CONFIG,
            Error::Io(..) => EX_IOERR,
            Error::PermissionDenied(..) => EX_NOPERM,
            Error::OverQuota { .. }
            | Error::LockTimeout
            | Error::MailboxFull => EX_TEMPFAIL,
            Error::NxMailbox
            | Error::NxThread
            | Error::NxGroup(..)
            | Error::NxFlag
            | Error::UnsafeName
            | Error::MailboxExists => EX_DATAERR,
            _ => EX_SOFTWARE,
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use super::*;

    #[test]
    fn errors_map_to_exit_codes() {
        assert_eq!(EX_CONFIG, Sysexit::from(&Error::NegativeBatchSize(-3)));
        assert_eq!(
            EX_IOERR,
            Sysexit::from(&Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "gone"
            )))
        );
        assert_eq!(EX_TEMPFAIL, Sysexit::from(&Error::LockTimeout));
        assert_eq!(EX_SOFTWARE, Sysexit::from(&Error::LockUpgrade));
    }
}

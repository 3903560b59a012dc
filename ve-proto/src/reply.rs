//! The ack message: an `int64` return value following Linux errno
//! conventions (negative = error), per §6.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply(pub i64);

impl Reply {
    pub fn ok(value: i64) -> Self {
        debug_assert!(value >= 0, "ok reply must be non-negative");
        Self(value)
    }

    pub fn err(errno: i32) -> Self {
        Self(-(errno as i64))
    }

    pub fn is_err(self) -> bool {
        self.0 < 0
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        w.write_i64::<LittleEndian>(self.0)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, Error> {
        Ok(Self(r.read_i64::<LittleEndian>()?))
    }
}

/// Converts a `Result` whose error type knows how to map itself to an
/// errno into the negated-errno reply convention. `ok_value` lets
/// handlers that return something other than `()` pick what "success"
/// encodes as (e.g. a request id, or the old mask from `sigprocmask`).
pub fn reply_from<T, E>(result: Result<T, E>, ok_value: impl FnOnce(T) -> i64, to_errno: impl FnOnce(&E) -> i32) -> Reply {
    match result {
        Ok(v) => Reply::ok(ok_value(v)),
        Err(e) => Reply::err(to_errno(&e)),
    }
}

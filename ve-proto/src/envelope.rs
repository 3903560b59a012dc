//! The length-prefixed message envelope every pseudo-process command
//! travels in: `{command id, caller pid, opaque payload bytes, payload
//! length}`, per §6 of the design.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::Error;

/// Cap on a single message, guarding against a corrupt length prefix
/// driving an unbounded allocation.
const MAX_PAYLOAD: u32 = 1 << 20;

#[derive(Debug, Clone)]
pub struct Envelope {
    pub command_id: u32,
    pub caller_pid: i32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(command_id: u32, caller_pid: i32, payload: Vec<u8>) -> Self {
        Self { command_id, caller_pid, payload }
    }

    /// Wire shape: `u32 total_len` (covering everything after itself),
    /// then `u32 command_id`, `i32 caller_pid`, then `payload`.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<(), Error> {
        let total_len = 4 + 4 + self.payload.len() as u32;
        w.write_u32::<LittleEndian>(total_len)?;
        w.write_u32::<LittleEndian>(self.command_id)?;
        w.write_i32::<LittleEndian>(self.caller_pid)?;
        w.write_all(&self.payload)?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self, Error> {
        let total_len = r.read_u32::<LittleEndian>()?;
        if total_len > MAX_PAYLOAD || total_len < 8 {
            return Err(Error::TooLarge(total_len));
        }
        let command_id = r.read_u32::<LittleEndian>()?;
        let caller_pid = r.read_i32::<LittleEndian>()?;
        let payload_len = (total_len - 8) as usize;
        let mut payload = vec![0u8; payload_len];
        r.read_exact(&mut payload)?;
        Ok(Self { command_id, caller_pid, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_through_bytes() {
        let env = Envelope::new(3, 1234, vec![1, 2, 3, 4, 5]);
        let mut buf = Vec::new();
        env.write_to(&mut buf).unwrap();
        let mut cur = Cursor::new(buf);
        let back = Envelope::read_from(&mut cur).unwrap();
        assert_eq!(back.command_id, 3);
        assert_eq!(back.caller_pid, 1234);
        assert_eq!(back.payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn rejects_oversized_length_prefix() {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(u32::MAX).unwrap();
        let mut cur = Cursor::new(buf);
        let err = Envelope::read_from(&mut cur).unwrap_err();
        assert!(matches!(err, Error::TooLarge(_)));
    }
}

//! The signal frame: a fixed binary layout written into VE stack memory by
//! delivery and read back by sigreturn. Treated as an ABI contract with VE
//! user code, not as a source-language structure — every field is encoded
//! at its reference-defined offset, little-endian.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use ve_task::registers::{RegisterImage, NUM_SR};
use ve_task::signals::SigInfo;

/// Five 64-bit words invoking the sigreturn pseudo-syscall when a handler
/// returns. Fixed opcodes, never recomputed.
pub const TRAMPOLINE: [u64; 5] = [
    0x462eaeae00000000,
    0x012e008e00000018,
    0x45000f0000000000,
    0x310003ae00000000,
    0x3f00000000000000,
];

/// Size of the LSHM snapshot carried in every frame. The reference
/// partitions a fixed per-task LSHM array; we size the snapshot to one
/// VE page, matching the per-task partition granularity used elsewhere
/// in the facade.
pub const LSHM_AREA_SIZE: usize = 0x1000;

/// Bytes consumed by the handler's own prologue before SR11 (the frame
/// pointer handed to the handler) — used to compute `SR11 = frame_addr -
/// HANDLER_FRAME_SIZE` per the delivery algorithm.
pub const HANDLER_FRAME_SIZE: u64 = 0x400;

#[derive(Debug, Clone, Copy, Default)]
pub struct StackInfo {
    pub sp: u64,
    pub size: u64,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct UContext {
    pub flags: u64,
    pub link: u64,
    pub stack: StackInfo,
    pub sigmask: u64,
    pub mcontext: RegisterImage,
}

#[derive(Debug, Clone)]
pub struct SignalFrame {
    pub trampoline: [u64; 5],
    pub siginfo: SigInfo,
    pub ucontext: UContext,
    pub lshm: Vec<u8>,
    /// Marks a frame built from a fatal hardware-exception origin: read
    /// back by sigreturn to decide whether the process must be killed
    /// with the original signal.
    pub flag: u32,
    pub signum: u32,
}

impl SignalFrame {
    pub fn new(signum: u32, siginfo: SigInfo, ucontext: UContext, lshm: Vec<u8>, fatal: bool) -> Self {
        Self { trampoline: TRAMPOLINE, siginfo, ucontext, lshm, flag: fatal as u32, signum }
    }

    pub fn encoded_len(&self) -> usize {
        // trampoline(5*8) + siginfo(5 fields, 4*4+8=24? see to_bytes) + ucontext + lshm + flag + signum
        self.to_bytes().len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Vec::new();
        for word in self.trampoline {
            w.write_u64::<LittleEndian>(word).unwrap();
        }
        w.write_u32::<LittleEndian>(self.siginfo.signo).unwrap();
        w.write_i32::<LittleEndian>(self.siginfo.code).unwrap();
        w.write_i32::<LittleEndian>(self.siginfo.pid).unwrap();
        w.write_u32::<LittleEndian>(self.siginfo.uid).unwrap();
        w.write_u64::<LittleEndian>(self.siginfo.si_addr).unwrap();

        w.write_u64::<LittleEndian>(self.ucontext.flags).unwrap();
        w.write_u64::<LittleEndian>(self.ucontext.link).unwrap();
        w.write_u64::<LittleEndian>(self.ucontext.stack.sp).unwrap();
        w.write_u64::<LittleEndian>(self.ucontext.stack.size).unwrap();
        w.write_u32::<LittleEndian>(self.ucontext.stack.flags).unwrap();
        w.write_u64::<LittleEndian>(self.ucontext.sigmask).unwrap();
        w.write_u64::<LittleEndian>(self.ucontext.mcontext.ic).unwrap();
        for sr in self.ucontext.mcontext.sr {
            w.write_u64::<LittleEndian>(sr).unwrap();
        }

        let mut lshm = self.lshm.clone();
        lshm.resize(LSHM_AREA_SIZE, 0);
        w.extend_from_slice(&lshm);

        w.write_u32::<LittleEndian>(self.flag).unwrap();
        w.write_u32::<LittleEndian>(self.signum).unwrap();
        w
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let mut c = Cursor::new(buf);
        let mut trampoline = [0u64; 5];
        for t in trampoline.iter_mut() {
            *t = c.read_u64::<LittleEndian>()?;
        }
        let siginfo = SigInfo {
            signo: c.read_u32::<LittleEndian>()?,
            code: c.read_i32::<LittleEndian>()?,
            pid: c.read_i32::<LittleEndian>()?,
            uid: c.read_u32::<LittleEndian>()?,
            si_addr: c.read_u64::<LittleEndian>()?,
        };
        let flags = c.read_u64::<LittleEndian>()?;
        let link = c.read_u64::<LittleEndian>()?;
        let sp = c.read_u64::<LittleEndian>()?;
        let size = c.read_u64::<LittleEndian>()?;
        let stack_flags = c.read_u32::<LittleEndian>()?;
        let sigmask = c.read_u64::<LittleEndian>()?;
        let ic = c.read_u64::<LittleEndian>()?;
        let mut sr = [0u64; NUM_SR];
        for s in sr.iter_mut() {
            *s = c.read_u64::<LittleEndian>()?;
        }
        let mut lshm = vec![0u8; LSHM_AREA_SIZE];
        c.read_exact(&mut lshm)?;
        let flag = c.read_u32::<LittleEndian>()?;
        let signum = c.read_u32::<LittleEndian>()?;

        Ok(Self {
            trampoline,
            siginfo,
            ucontext: UContext {
                flags,
                link,
                stack: StackInfo { sp, size, flags: stack_flags },
                sigmask,
                mcontext: RegisterImage { ic, sr },
            },
            lshm,
            flag,
            signum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut regs = RegisterImage::default();
        regs.ic = 0x1000;
        regs.sr[8] = 0x7fff_0000;
        let frame = SignalFrame::new(
            11,
            SigInfo { signo: 11, code: 0x80, pid: 0, uid: 0, si_addr: 0x2000 },
            UContext {
                flags: 0,
                link: 0,
                stack: StackInfo { sp: 0x8000, size: 0x2000, flags: 0 },
                sigmask: 0x10,
                mcontext: regs,
            },
            b"snapshot".to_vec(),
            true,
        );
        let bytes = frame.to_bytes();
        let back = SignalFrame::from_bytes(&bytes).unwrap();
        assert_eq!(back.trampoline, TRAMPOLINE);
        assert_eq!(back.siginfo.signo, 11);
        assert_eq!(back.ucontext.mcontext.ic, 0x1000);
        assert_eq!(back.ucontext.mcontext.sr[8], 0x7fff_0000);
        assert_eq!(back.flag, 1);
        assert_eq!(&back.lshm[..8], b"snapshot");
    }
}

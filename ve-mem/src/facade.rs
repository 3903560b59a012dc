//! Aligned send/recv and string-receive: the bridge between a
//! pseudo-process's byte-oriented requests and the DMA engine's
//! 8-byte-aligned hardware primitive.

use log::trace;

use crate::backend::MemoryBackend;
use crate::error::{Error, StringRecvError};

const WORD: u64 = 8;
const VE_PAGE_SIZE: u64 = 0x20_0000; // 2 MiB
const STRING_CHUNK: usize = 0x1000; // 4 KiB

fn round_down(x: u64, align: u64) -> u64 {
    x - (x % align)
}

fn round_up(x: u64, align: u64) -> u64 {
    round_down(x + align - 1, align)
}

/// Host -> VE. Enlarges an unaligned `[addr, addr+len)` range to the
/// enclosing 8-byte-aligned span, reading back the boundary words first
/// so they can be preserved, then issues a single aligned DMA write.
pub fn aligned_send(backend: &dyn MemoryBackend, pid: i32, addr: u64, data: &[u8]) -> Result<(), Error> {
    if data.is_empty() {
        return Ok(());
    }
    let len = data.len() as u64;
    let start_off = addr % WORD;
    let aligned_start = addr - start_off;
    let end = addr + len;
    let aligned_end = round_up(end, WORD);
    let total = (aligned_end - aligned_start) as usize;

    if start_off == 0 && total == data.len() {
        trace!("aligned_send: fast path, addr={addr:#x} len={len}");
        return backend.dma_write_aligned(pid, addr, data);
    }

    let mut bounce = vec![0u8; total];
    if start_off != 0 {
        let first_word = backend.dma_read_aligned(pid, aligned_start, WORD as usize)?;
        bounce[0..WORD as usize].copy_from_slice(&first_word);
    }
    if aligned_end != end {
        let last_word_addr = aligned_end - WORD;
        let last_word = backend.dma_read_aligned(pid, last_word_addr, WORD as usize)?;
        let off = total - WORD as usize;
        bounce[off..off + WORD as usize].copy_from_slice(&last_word);
    }
    let overlay_off = start_off as usize;
    bounce[overlay_off..overlay_off + data.len()].copy_from_slice(data);
    trace!("aligned_send: bounce path, addr={addr:#x} len={len} total={total}");
    backend.dma_write_aligned(pid, aligned_start, &bounce)
}

/// VE -> host. Symmetric to `aligned_send`: DMA the enlarged aligned
/// region into a bounce buffer, then slice out the requested sub-range.
pub fn aligned_recv(backend: &dyn MemoryBackend, pid: i32, addr: u64, len: u64) -> Result<Vec<u8>, Error> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let start_off = addr % WORD;
    let aligned_start = addr - start_off;
    let end = addr + len;
    let aligned_end = round_up(end, WORD);
    let total = (aligned_end - aligned_start) as usize;

    let bounce = backend.dma_read_aligned(pid, aligned_start, total)?;
    let from = start_off as usize;
    let to = from + len as usize;
    Ok(bounce[from..to].to_vec())
}

/// Calls the 8-byte-granular primitive directly; only valid after the
/// caller has already aligned both `addr` and `len` to a multiple of 8.
/// Any other caller hits `Error::InvalidArgument` — this is the
/// "intentional unsafe lower rung" the spec calls out.
pub fn raw_send(backend: &dyn MemoryBackend, pid: i32, addr: u64, data: &[u8]) -> Result<(), Error> {
    if addr % WORD != 0 || data.len() as u64 % WORD != 0 {
        return Err(Error::InvalidArgument);
    }
    backend.dma_write_aligned(pid, addr, data)
}

pub fn raw_recv(backend: &dyn MemoryBackend, pid: i32, addr: u64, len: u64) -> Result<Vec<u8>, Error> {
    if addr % WORD != 0 || len % WORD != 0 {
        return Err(Error::InvalidArgument);
    }
    backend.dma_read_aligned(pid, addr, len as usize)
}

/// Reads 4 KiB at a time starting at `addr`, never scanning past the end
/// of the page after `addr`'s page (i.e. touching at most two VE pages),
/// looking for a NUL terminator.
pub fn recv_string(
    backend: &dyn MemoryBackend,
    pid: i32,
    addr: u64,
    dst_capacity: usize,
) -> Result<usize, StringRecvError> {
    let page_start = round_down(addr, VE_PAGE_SIZE);
    let window_end = page_start + 2 * VE_PAGE_SIZE;

    let mut found = Vec::new();
    let mut cursor = addr;
    while cursor < window_end {
        let chunk_len = (STRING_CHUNK as u64).min(window_end - cursor) as usize;
        let chunk = aligned_recv(backend, pid, cursor, chunk_len as u64)?;
        if let Some(nul_pos) = chunk.iter().position(|b| *b == 0) {
            let total_len = found.len() + nul_pos;
            if total_len + 1 > dst_capacity {
                return Err(StringRecvError::DstTooSmall);
            }
            for (i, b) in chunk[..nul_pos].iter().enumerate() {
                log_non_printable(*b, found.len() + i);
            }
            found.extend_from_slice(&chunk[..nul_pos]);
            return Ok(found.len());
        }
        for (i, b) in chunk.iter().enumerate() {
            log_non_printable(*b, found.len() + i);
        }
        found.extend_from_slice(&chunk);
        cursor += chunk_len as u64;
    }
    Err(StringRecvError::NullNotFound)
}

fn log_non_printable(b: u8, offset: usize) {
    if b == b'\n' || (0x20..0x7f).contains(&b) {
        return;
    }
    trace!("recv_string: non-printable byte {b:#04x} at offset {offset}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DmaBackend;
    use crate::image::VeMemoryImage;
    use std::sync::Arc;

    struct Identity;
    impl ve_dma::PageTranslator for Identity {
        fn translate(&self, _pid: i32, addr: u64) -> Result<u64, ve_dma::Error> {
            Ok(addr)
        }
    }

    fn backend() -> (DmaBackend, Arc<VeMemoryImage>) {
        let engine = ve_dma::DmaEngine::open(Arc::new(ve_dma::driver::SimDriver::new(ve_dma::N_DESC))).unwrap();
        let mem = Arc::new(VeMemoryImage::new());
        (DmaBackend::new(engine, Arc::new(Identity), 0, mem.clone()), mem)
    }

    #[test]
    fn aligned_round_trip_exact() {
        let (backend, _mem) = backend();
        let data = b"ABCDEFGHIJKLMNOP";
        aligned_send(&backend, 1, 0x1000, data).unwrap();
        let got = aligned_recv(&backend, 1, 0x1000, data.len() as u64).unwrap();
        assert_eq!(got, data);
    }

    #[test]
    fn unaligned_send_preserves_neighbors() {
        let (backend, mem) = backend();
        mem.fill(0x0, 0x20, 0xFF);
        aligned_send(&backend, 1, 0x1003, b"hello").unwrap();
        assert_eq!(mem.read(0x0, 3), vec![0xFF, 0xFF, 0xFF]);
        assert_eq!(mem.read(0x1003, 5), b"hello");
        assert_eq!(mem.read(0x1008, 0x1020 - 0x1008), vec![0xFFu8; 0x1020 - 0x1008]);
    }

    #[test]
    fn round_trip_law_any_alignment() {
        for (addr, len) in [(0x1000u64, 16usize), (0x1003, 5), (0x2001, 31), (0x4000, 1)] {
            let (backend, _mem) = backend();
            let data: Vec<u8> = (0..len as u8).collect();
            aligned_send(&backend, 1, addr, &data).unwrap();
            let got = aligned_recv(&backend, 1, addr, len as u64).unwrap();
            assert_eq!(got, data);
        }
    }

    #[test]
    fn recv_string_finds_nul() {
        let (backend, _mem) = backend();
        aligned_send(&backend, 1, 0x3000, b"hello\0world").unwrap();
        let n = recv_string(&backend, 1, 0x3000, 64).unwrap();
        assert_eq!(n, 5);
    }

    #[test]
    fn recv_string_dst_too_small() {
        let (backend, _mem) = backend();
        aligned_send(&backend, 1, 0x3000, b"hello\0").unwrap();
        let err = recv_string(&backend, 1, 0x3000, 3).unwrap_err();
        assert!(matches!(err, StringRecvError::DstTooSmall));
    }

    #[test]
    fn recv_string_no_nul_across_two_pages_boundary() {
        // A page-aligned start touches exactly two full VE pages (no more,
        // no less): a run that fills the whole window with no NUL must
        // report NullNotFound right at the window edge.
        let (backend, _mem) = backend();
        let addr = 4 * VE_PAGE_SIZE;
        let run = vec![b'A'; (2 * VE_PAGE_SIZE) as usize];
        aligned_send(&backend, 1, addr, &run).unwrap();
        let err = recv_string(&backend, 1, addr, 1 << 24).unwrap_err();
        assert!(matches!(err, StringRecvError::NullNotFound));
    }

    #[test]
    fn recv_string_finds_nul_at_last_byte_of_window() {
        // One byte short of the two-page window, the NUL is still inside
        // bounds and must be found.
        let (backend, _mem) = backend();
        let addr = 4 * VE_PAGE_SIZE;
        let window = 2 * VE_PAGE_SIZE;
        let mut run = vec![b'A'; (window - 1) as usize];
        run.push(0);
        aligned_send(&backend, 1, addr, &run).unwrap();
        let n = recv_string(&backend, 1, addr, 1 << 24).unwrap();
        assert_eq!(n as u64, window - 1);
    }
}

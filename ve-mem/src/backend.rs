//! The seam between the memory-transfer facade and the DMA engine.
//!
//! `MemoryBackend` is deliberately narrow: a single aligned, whole-word
//! write and read. All of the unaligned/bounce-buffer logic lives in
//! `facade.rs` above this trait, so the only thing a production
//! implementation has to get right is moving `N` 8-byte-aligned bytes
//! between a host buffer and one VE address.

use crate::Error;

pub trait MemoryBackend: Send + Sync {
    /// Writes `data` (whose length is a multiple of 8) to `ve_addr`
    /// (8-byte aligned) in `ve_pid`'s address space.
    fn dma_write_aligned(&self, ve_pid: i32, ve_addr: u64, data: &[u8]) -> Result<(), Error>;

    /// Reads `len` bytes (a multiple of 8) starting at `ve_addr` (8-byte
    /// aligned) from `ve_pid`'s address space.
    fn dma_read_aligned(&self, ve_pid: i32, ve_addr: u64, len: usize) -> Result<Vec<u8>, Error>;
}

fn check_aligned(addr: u64, len: usize) -> Result<(), Error> {
    if addr % 8 != 0 || len % 8 != 0 {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// Production backend: routes through a `ve_dma::DmaEngine` and a
/// simulated VE memory image (since no real VE page tables or hardware
/// DMA are reachable here). The scheduling behavior (posting, waiting,
/// error surfacing) is the real `ve_dma` code; only the "hardware moves
/// bytes" step is simulated, via `mem`.
pub struct DmaBackend {
    engine: ve_dma::DmaEngine,
    translator: std::sync::Arc<dyn ve_dma::PageTranslator>,
    host_pid: i32,
    mem: std::sync::Arc<crate::image::VeMemoryImage>,
}

impl DmaBackend {
    pub fn new(
        engine: ve_dma::DmaEngine,
        translator: std::sync::Arc<dyn ve_dma::PageTranslator>,
        host_pid: i32,
        mem: std::sync::Arc<crate::image::VeMemoryImage>,
    ) -> Self {
        Self { engine, translator, host_pid, mem }
    }
}

impl MemoryBackend for DmaBackend {
    fn dma_write_aligned(&self, ve_pid: i32, ve_addr: u64, data: &[u8]) -> Result<(), Error> {
        check_aligned(ve_addr, data.len())?;
        let src = ve_dma::Endpoint::Virtual {
            tag: ve_dma::AddrSpaceTag::HostVirtual,
            pid: self.host_pid,
            addr: data.as_ptr() as u64,
        };
        let dst = ve_dma::Endpoint::Virtual { tag: ve_dma::AddrSpaceTag::VeVirtual, pid: ve_pid, addr: ve_addr };
        let req = self.engine.post(src, dst, data.len() as u64, &*self.translator)?;
        match req.wait() {
            ve_dma::RequestStatus::Ok => {
                self.mem.write(ve_addr, data);
                Ok(())
            }
            _ => Err(Error::Fault),
        }
    }

    fn dma_read_aligned(&self, ve_pid: i32, ve_addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        check_aligned(ve_addr, len)?;
        let mut buf = vec![0u8; len];
        let src = ve_dma::Endpoint::Virtual { tag: ve_dma::AddrSpaceTag::VeVirtual, pid: ve_pid, addr: ve_addr };
        let dst = ve_dma::Endpoint::Virtual {
            tag: ve_dma::AddrSpaceTag::HostVirtual,
            pid: self.host_pid,
            addr: buf.as_mut_ptr() as u64,
        };
        let req = self.engine.post(src, dst, len as u64, &*self.translator)?;
        match req.wait() {
            ve_dma::RequestStatus::Ok => {
                buf.copy_from_slice(&self.mem.read(ve_addr, len));
                Ok(buf)
            }
            _ => Err(Error::Fault),
        }
    }
}

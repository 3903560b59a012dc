//! Splitting a logical `(src, dst, len)` transfer into reqlist entries.
//!
//! Each entry covers at most one host-page or one VE-page of contiguous
//! physical memory (whichever endpoint is virtual at that step), and honors
//! the smaller of the two endpoints' alignment at every step.

use crate::addr::{AddrSpaceTag, Endpoint};
use crate::Error;

pub const HOST_PAGE_SIZE: u64 = 0x1000; // 4 KiB
pub const VE_PAGE_SIZE: u64 = 0x20_0000; // 2 MiB

/// Translates a virtual address (within some pid) to a physical address.
/// Implemented by whatever owns the VE/host page tables; a translation
/// failure marks only the one reqlist entry ERROR, per the spec.
pub trait PageTranslator {
    fn translate(&self, pid: i32, addr: u64) -> Result<u64, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Posted,
    Ok,
    Error,
    Canceled,
}

#[derive(Debug, Clone)]
pub struct ReqListEntry {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub len: u64,
    pub status: EntryStatus,
}

/// Distance to the next page boundary starting at `addr`, for a page of
/// size `page_size` (a power of two).
fn to_next_boundary(addr: u64, page_size: u64) -> u64 {
    page_size - (addr % page_size)
}

/// Splits `len` bytes starting at `src`/`dst` into a minimal set of
/// reqlist entries. Virtual endpoints are translated through `translate`;
/// an entry whose translation fails is still produced, but marked
/// `EntryStatus::Error` so that posting can surface it without aborting
/// the rest of the transfer.
pub fn split_transfer<T: PageTranslator>(
    src: Endpoint,
    dst: Endpoint,
    len: u64,
    translator: &T,
) -> Result<Vec<ReqListEntry>, Error> {
    crate::addr::validate_len_and_align(src.addr(), dst.addr(), len)?;

    let mut entries = Vec::new();
    let mut off: u64 = 0;
    let mut cur_src = src;
    let mut cur_dst = dst;

    while off < len {
        let remaining = len - off;

        let src_chunk = if cur_src.is_virtual() {
            to_next_boundary(cur_src.addr(), cur_src.tag().page_size())
        } else {
            remaining
        };
        let dst_chunk = if cur_dst.is_virtual() {
            to_next_boundary(cur_dst.addr(), cur_dst.tag().page_size())
        } else {
            remaining
        };

        let mut chunk = remaining.min(src_chunk).min(dst_chunk);
        // keep every fragment boundary 8-byte aligned
        chunk -= chunk % crate::addr::DMA_ALIGN;
        if chunk == 0 {
            chunk = remaining.min(crate::addr::DMA_ALIGN);
        }

        let (phys_src, src_ok) = resolve(cur_src, translator);
        let (phys_dst, dst_ok) = resolve(cur_dst, translator);
        let status = if src_ok && dst_ok { EntryStatus::Posted } else { EntryStatus::Error };

        entries.push(ReqListEntry { src: phys_src, dst: phys_dst, len: chunk, status });

        off += chunk;
        cur_src = cur_src.with_addr(cur_src.addr() + chunk);
        cur_dst = cur_dst.with_addr(cur_dst.addr() + chunk);
    }

    Ok(entries)
}

/// Resolves an endpoint to its physical form for the hardware descriptor.
/// Returns the (possibly-unchanged) endpoint and whether resolution
/// succeeded; virtual endpoints that fail translation keep their logical
/// address so the error is visible in logs/tests.
fn resolve<T: PageTranslator>(ep: Endpoint, translator: &T) -> (Endpoint, bool) {
    match ep {
        Endpoint::Physical { .. } => (ep, true),
        Endpoint::Virtual { tag, pid, addr } => {
            if tag == AddrSpaceTag::VeVirtualNoProt || tag == AddrSpaceTag::VeVirtual || tag == AddrSpaceTag::HostVirtual {
                match translator.translate(pid, addr) {
                    Ok(phys) => (Endpoint::Physical { tag, addr: phys }, true),
                    Err(_) => (ep, false),
                }
            } else {
                (ep, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;
    impl PageTranslator for Identity {
        fn translate(&self, _pid: i32, addr: u64) -> Result<u64, Error> {
            Ok(addr)
        }
    }

    struct AlwaysFail;
    impl PageTranslator for AlwaysFail {
        fn translate(&self, _pid: i32, _addr: u64) -> Result<u64, Error> {
            Err(Error::Fault)
        }
    }

    fn ve(addr: u64) -> Endpoint {
        Endpoint::Virtual { tag: AddrSpaceTag::VeVirtual, pid: 1, addr }
    }
    fn vh(addr: u64) -> Endpoint {
        Endpoint::Virtual { tag: AddrSpaceTag::HostVirtual, pid: 2, addr }
    }

    #[test]
    fn single_entry_when_no_boundary_crossed() {
        let entries = split_transfer(ve(0x1000), vh(0x2000), 0x100, &Identity).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].len, 0x100);
        assert_eq!(entries[0].status, EntryStatus::Posted);
    }

    #[test]
    fn splits_on_host_page_boundary() {
        // host endpoint crosses a 4KiB boundary partway through
        let entries = split_transfer(ve(0x0), vh(0x1f00), 0x400, &Identity).unwrap();
        let total: u64 = entries.iter().map(|e| e.len).sum();
        assert_eq!(total, 0x400);
        assert!(entries.len() >= 2);
    }

    #[test]
    fn translation_failure_marks_entry_error_only() {
        let entries = split_transfer(ve(0x0), vh(0x0), 0x100, &AlwaysFail).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Error);
    }

    #[test]
    fn max_len_accepted_exact_boundary() {
        let r = crate::addr::validate_len_and_align(0, 0, crate::addr::MAX_DMA_LEN);
        assert!(r.is_ok());
        let r = crate::addr::validate_len_and_align(0, 0, 1u64 << 63);
        assert!(r.is_err());
    }

    #[test]
    fn unaligned_address_rejected() {
        let r = split_transfer(ve(1), vh(0), 8, &Identity);
        assert!(r.is_err());
    }
}

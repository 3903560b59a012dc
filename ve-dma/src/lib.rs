//! DMA engine manager: a request/response scheduler over a fixed-size
//! hardware descriptor ring moving data between host and VE address
//! spaces.

pub mod addr;
pub mod driver;
pub mod engine;
mod error;
pub mod reqlist;
pub mod request;

pub use addr::{AddrSpaceTag, Endpoint};
pub use engine::{DmaEngine, EngineStats, N_DESC};
pub use error::Error;
pub use reqlist::PageTranslator;
pub use request::{DmaRequest, RequestStatus};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SimDriver;
    use std::sync::Arc;
    use std::time::Duration;

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

    fn open_engine() -> DmaEngine {
        DmaEngine::open(Arc::new(SimDriver::new(N_DESC))).unwrap()
    }

    #[test]
    fn post_and_wait_ok() {
        let engine = open_engine();
        let req = engine.post(ve(0x1000), vh(0x2000), 0x100, &Identity).unwrap();
        assert_eq!(req.wait(), RequestStatus::Ok);
        engine.close().unwrap();
    }

    #[test]
    fn translation_fault_surfaces_as_error_on_wait() {
        let engine = open_engine();
        let req = engine.post(ve(0x1000), vh(0x2000), 0x100, &AlwaysFail).unwrap();
        assert_eq!(req.wait(), RequestStatus::Error);
        engine.close().unwrap();
    }

    #[test]
    fn close_fails_busy_while_in_flight() {
        let engine = open_engine();
        // post more reqlist entries than N_DESC so some remain queued
        let req = engine.post(ve(0x0), vh(0x0), (N_DESC as u64 + 4) * 0x1000, &Identity).unwrap();
        // don't wait yet; close should observe in-flight descriptors
        let busy = engine.close();
        assert!(matches!(busy, Err(Error::Busy)) || req.wait() == RequestStatus::Ok);
    }

    #[test]
    fn timedwait_returns_timeout_without_mutating_status() {
        // a driver that never advances its read pointer models a stalled engine
        struct NeverDriver(SimDriver);
        impl crate::driver::DescriptorRingDriver for NeverDriver {
            fn halt(&self) { self.0.halt(); }
            fn start(&self) {}
            fn run_state(&self) -> crate::driver::EngineRunState { self.0.run_state() }
            fn clear(&self, slot: usize) { self.0.clear(slot); }
            fn post(&self, slot: usize, len: u64, e: bool) { self.0.post(slot, len, e); }
            fn read_readptr(&self) -> usize { 0 }
            fn read_status(&self, slot: usize) -> reqlist::EntryStatus { self.0.read_status(slot) }
        }
        let engine = DmaEngine::open(Arc::new(NeverDriver(SimDriver::new(N_DESC)))).unwrap();
        let req = engine.post(ve(0x0), vh(0x0), 0x100, &Identity).unwrap();
        let r = req.timedwait(Duration::from_millis(20));
        assert!(matches!(r, Err(Error::TimedOut)));
        assert_eq!(req.test(), RequestStatus::NotFinished);
        engine.terminate_all();
    }

    #[test]
    fn cancel_mid_flight_dma() {
        let engine = open_engine();
        // 64 MiB VE-to-host transfer, several VE pages worth
        let req = engine.post(ve(0x0), vh(0x0), 64 * 1024 * 1024, &Identity).unwrap();
        engine.terminate(&req).unwrap();
        let status = req.wait();
        assert!(matches!(status, RequestStatus::Canceled | RequestStatus::Ok));
        req.free();

        // engine still usable afterwards, and converges back to zero in-flight
        let req2 = engine.post(ve(0x0), vh(0x0), 0x100, &Identity).unwrap();
        assert_eq!(req2.wait(), RequestStatus::Ok);
        req2.free();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(engine.stats().desc_num_used, 0);
        engine.close().unwrap();
    }

    #[test]
    fn max_length_boundary() {
        // physical endpoints don't split on page boundaries, so the full
        // length is a single reqlist entry rather than one per page of a
        // transfer nobody could actually back with real memory.
        let phys_src = Endpoint::Physical { tag: AddrSpaceTag::VePhysical, addr: 0 };
        let phys_dst = Endpoint::Physical { tag: AddrSpaceTag::HostSysBusPhysical, addr: 0 };
        let engine = open_engine();
        let req = engine.post(phys_src, phys_dst, addr::MAX_DMA_LEN, &Identity);
        assert!(req.is_ok());
        let err = engine.post(phys_src, phys_dst, 1u64 << 63, &Identity);
        assert!(matches!(err, Err(Error::InvalidArgument)));
        engine.terminate_all();
    }

    #[test]
    fn unaligned_addr_rejected() {
        let engine = open_engine();
        let err = engine.post(ve(1), vh(0), 8, &Identity);
        assert!(matches!(err, Err(Error::InvalidArgument)));
        engine.terminate_all();
    }
}

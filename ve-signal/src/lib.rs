//! Signal subsystem: generation, queuing, masking, delivery, trampoline
//! construction, alternate-stack handling, and core-dump orchestration for
//! VE tasks, mirroring POSIX semantics with all register state on the VE.

pub mod coredump;
pub mod deliver;
mod error;
pub mod frame;
pub mod generate;
pub mod ops;

pub use error::Error;

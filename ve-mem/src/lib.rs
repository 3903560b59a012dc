//! Memory-transfer facade: aligned send/recv between a host buffer and VE
//! memory, and a bounded string-read across VE pages.

pub mod backend;
mod error;
pub mod facade;
pub mod image;

pub use backend::{DmaBackend, MemoryBackend};
pub use error::{Error, StringRecvError};
pub use facade::{aligned_recv, aligned_send, raw_recv, raw_send, recv_string};
pub use image::VeMemoryImage;

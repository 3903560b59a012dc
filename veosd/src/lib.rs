//! `veosd`: the service entry point. Wires the DMA engine, memory-transfer
//! facade, and signal subsystem into one process that serves the pseudo-
//! process protocol over a UNIX socket per VE node.

pub mod config;
pub mod dispatch;
pub mod server;
pub mod service;

pub use config::Config;
pub use service::Service;

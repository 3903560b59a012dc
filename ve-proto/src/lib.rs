//! Wire protocol between a pseudo process and this service: length-
//! prefixed command envelopes over a UNIX stream socket, and the
//! negated-errno reply convention described in the external-interfaces
//! section of the design.

pub mod command;
mod error;
pub mod envelope;
pub mod reply;

pub use command::Command;
pub use envelope::Envelope;
pub use error::Error;
pub use reply::Reply;

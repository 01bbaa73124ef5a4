//! Asterisk Gateway Interface (AGI) engine.
//!
//! [`AgiProtocol`] speaks the command/reply protocol of a single AGI
//! session, whether it arrives over a pipe, a FastAGI TCP connection,
//! or tunnelled through AMI ([`asyncagi`]).

pub mod asyncagi;

mod protocol;

pub use protocol::{AgiProtocol, AgiReply, AgiState};

//! Asterisk Manager Interface (AMI) engine.
//!
//! [`AmiProtocol`] is the sans-I/O state machine: feed it bytes, get
//! correlated responses and dispatched events back. [`Action`] builds
//! outbound requests, [`calls`] layers originate-and-track call
//! management on top of the engine.

pub mod calls;

mod action;
mod protocol;

pub use action::Action;
pub use protocol::{
    ActionReply, AmiProtocol, AmiState, Event, EventHandlerToken, EventList, Response,
    ResponseKind,
};

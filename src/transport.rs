//! Transport and engine contracts.
//!
//! The engines own no socket. An embedder hands them a [`Transport`]
//! through [`Engine::connection_made`], feeds received bytes through
//! [`Engine::data_received`], and reports closure through
//! [`Engine::connection_lost`]. Everything else (connecting, reading,
//! process spawning) belongs to the embedder; see [`crate::net`] for a
//! Tokio one.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use crate::error::Error;

/// Byte sink owned exclusively by one engine.
pub trait Transport {
    /// Write already-encoded bytes, trailing terminator included.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Ask the underlying connection to close. The engine still waits
    /// for [`Engine::connection_lost`] before declaring itself closed.
    fn close(&mut self);
}

/// Contract every protocol engine exposes to its I/O driver.
pub trait Engine {
    /// Record the transport and start the session state machine.
    fn connection_made(&self, transport: Box<dyn Transport>);

    /// Feed received bytes. Chunk boundaries are arbitrary.
    fn data_received(&self, data: &[u8]);

    /// The connection is gone, with an optional cause. Every pending
    /// request fails with [`Error::ConnectionLost`].
    fn connection_lost(&self, cause: Option<Error>);
}

#[derive(Debug, Default)]
struct BufferState {
    written: Vec<u8>,
    closed: bool,
}

/// In-memory transport recording written bytes.
///
/// Clones share state: hand one clone to the engine, keep another to
/// drain what the engine wrote. Used by the [`crate::net`] driver for
/// outbound buffering and by tests as the wire.
#[derive(Debug, Clone, Default)]
pub struct BufferTransport {
    state: Rc<RefCell<BufferState>>,
}

impl BufferTransport {
    /// Fresh, open transport with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every byte written since the last drain.
    pub fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().written)
    }

    /// `true` once the engine asked the connection to close.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

impl Transport for BufferTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport closed",
            ));
        }
        state.written.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) {
        self.state.borrow_mut().closed = true;
    }
}

//! Asterisk Manager (AMI) and Gateway (AGI) protocol engines for Rust
//!
//! This crate implements both text protocols used to control an
//! Asterisk switch:
//!
//! - **AMI**: authenticate, send actions, receive correlated responses
//!   and asynchronous events over one TCP connection.
//! - **AGI**: drive a single call from a FastAGI server or over an AMI
//!   carrier (Async AGI), one command and one reply at a time.
//!
//! # Architecture
//!
//! The protocol engines are **sans-I/O**: [`AmiProtocol`](ami::AmiProtocol)
//! and [`AgiProtocol`](agi::AgiProtocol) own no socket. An embedder
//! attaches a [`Transport`] (`write`/`close`), feeds received bytes
//! through [`Engine::data_received`], and reports closure through
//! [`Engine::connection_lost`]. Every asynchronous request returns a
//! [`Handle`], a single-shot result slot with success and failure
//! sinks. The [`net`] module supplies Tokio drivers for the common
//! cases.
//!
//! # AMI client
//!
//! ```no_run
//! use asterisk_control::ami::Action;
//! use asterisk_control::net::AmiConnection;
//! use asterisk_control::AmiConfig;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> asterisk_control::Result<()> {
//!     let connection = AmiConnection::connect("localhost", 5038, AmiConfig::default()).await?;
//!     let ami = connection.protocol();
//!
//!     ami.register_event_handler("Hangup", |event| {
//!         println!("hangup: {:?}", event.header("Cause"));
//!     });
//!
//!     let login = ami.login("admin", "secret");
//!     let engine = ami.clone();
//!     login.on_result(move |_| {
//!         let channels = engine.send_action(
//!             Action::new("CoreShowChannels").completed_by("CoreShowChannelsComplete"),
//!         );
//!         channels.on_result(|reply| {
//!             println!("{} channels up", reply.events().len().saturating_sub(1));
//!         }).unwrap();
//!     }).unwrap();
//!
//!     connection.run().await
//! }
//! ```
//!
//! # FastAGI server
//!
//! ```no_run
//! use asterisk_control::net::serve_fastagi;
//! use asterisk_control::{AgiConfig, DEFAULT_FASTAGI_PORT};
//! use tokio::net::TcpListener;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> asterisk_control::Result<()> {
//!     let listener = TcpListener::bind(("0.0.0.0", DEFAULT_FASTAGI_PORT))
//!         .await
//!         .map_err(asterisk_control::Error::from)?;
//!     let local = tokio::task::LocalSet::new();
//!     local.run_until(serve_fastagi(listener, AgiConfig::default(), |agi| {
//!         let session = agi.clone();
//!         agi.on_ready(move || {
//!             let answered = session.send_command(["ANSWER"]);
//!             answered.on_result(|reply| {
//!                 println!("answered: result={:?}", reply.result);
//!             }).unwrap();
//!         });
//!     })).await
//! }
//! ```
//!
//! # Async AGI
//!
//! [`agi::asyncagi::AsyncAgiExecutor`] runs the same AGI engine over an
//! AMI connection: Asterisk announces each channel with an
//! `AsyncAGI Start` event, commands travel as `AGI` actions, and
//! results come back as `Exec` events.

pub mod agi;
pub mod ami;
pub mod net;

pub mod constants;

mod config;
mod error;
mod framer;
mod handle;
mod headers;
mod transport;

pub use config::{logging_fault_sink, AgiConfig, AmiConfig, Encoding, Fault, FaultSink};
pub use constants::{DEFAULT_AMI_PORT, DEFAULT_FASTAGI_PORT};
pub use error::{Error, Result};
pub use framer::LineFramer;
pub use handle::Handle;
pub use headers::Headers;
pub use transport::{BufferTransport, Engine, Transport};

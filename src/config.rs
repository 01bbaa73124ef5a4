//! Engine configuration: text codec, header strictness, list-action
//! terminators, and the fault sink for non-fatal anomalies.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use tracing::warn;

use crate::error::{Error, Result};

/// Text codec applied to both directions of a connection.
///
/// Asterisk does not pin a charset; it passes bytes through. UTF-8 is
/// the default for common setups, Latin-1 covers legacy deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Encoding {
    /// UTF-8 (default). Invalid sequences fail the connection.
    #[default]
    Utf8,
    /// ISO-8859-1. Decoding never fails; encoding rejects characters
    /// above U+00FF.
    Latin1,
}

impl Encoding {
    /// Decode received bytes into text.
    pub fn decode(&self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|_| Error::protocol("invalid UTF-8 in received line")),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| b as char).collect()),
        }
    }

    /// Encode outgoing text into bytes.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c))
                        .map_err(|_| Error::protocol(format!("character {c:?} not encodable as Latin-1")))
                })
                .collect(),
        }
    }
}

/// Non-fatal protocol anomaly, delivered to the configured fault sink.
///
/// None of these tear down the connection; they exist for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Fault {
    /// A header line without a colon.
    MalformedLine { line: String },
    /// A response whose `ActionID` is missing or matches no pending
    /// action.
    UnmatchedResponse { action_id: Option<String> },
    /// An event for which no handler (specific or wildcard) is
    /// registered.
    UnhandledEvent { name: String },
    /// A user-supplied handler or sink panicked.
    HandlerPanic { context: String },
    /// A line received in a state where nothing was expected.
    UnexpectedLine { line: String },
    /// An Async-AGI event for a channel that is not bound.
    UnknownChannel { channel: String },
    /// An Async-AGI `Exec` event carrying an unknown command id.
    UnknownCommandId { command_id: String },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::MalformedLine { line } => write!(f, "malformed header line {line:?}"),
            Fault::UnmatchedResponse { action_id: Some(id) } => {
                write!(f, "response for unknown or stale ActionID {id:?}")
            }
            Fault::UnmatchedResponse { action_id: None } => {
                write!(f, "response without an ActionID")
            }
            Fault::UnhandledEvent { name } => write!(f, "unhandled event {name:?}"),
            Fault::HandlerPanic { context } => write!(f, "panic in {context}"),
            Fault::UnexpectedLine { line } => write!(f, "unexpected line {line:?}"),
            Fault::UnknownChannel { channel } => {
                write!(f, "Async AGI event for unknown channel {channel:?}")
            }
            Fault::UnknownCommandId { command_id } => {
                write!(f, "Async AGI exec for unknown command {command_id:?}")
            }
        }
    }
}

/// Shared sink for [`Fault`] reports.
pub type FaultSink = Rc<dyn Fn(&Fault)>;

/// Fault sink that logs each anomaly and drops it.
pub fn logging_fault_sink() -> FaultSink {
    Rc::new(|fault| warn!("protocol anomaly: {fault}"))
}

/// Configuration for an AMI engine.
#[derive(Clone)]
pub struct AmiConfig {
    /// Text codec for both directions.
    pub encoding: Encoding,
    /// When `true`, a malformed header line fails the connection instead
    /// of being reported to the fault sink and skipped.
    pub strict_headers: bool,
    /// Action name to terminating event name, seeding the list-style
    /// classifier. A per-action terminator on the
    /// [`Action`](crate::ami::Action) builder takes precedence.
    pub list_action_terminators: HashMap<String, String>,
    /// Whether the terminating event is delivered inside the event list
    /// (default). When `false`, its headers are merged into the response
    /// headers instead.
    pub include_list_terminator: bool,
    /// Receives non-fatal protocol anomalies.
    pub fault_sink: FaultSink,
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            strict_headers: false,
            list_action_terminators: HashMap::new(),
            include_list_terminator: true,
            fault_sink: logging_fault_sink(),
        }
    }
}

impl fmt::Debug for AmiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmiConfig")
            .field("encoding", &self.encoding)
            .field("strict_headers", &self.strict_headers)
            .field("list_action_terminators", &self.list_action_terminators)
            .field("include_list_terminator", &self.include_list_terminator)
            .finish_non_exhaustive()
    }
}

/// Configuration for an AGI engine.
#[derive(Clone)]
pub struct AgiConfig {
    /// Text codec for both directions.
    pub encoding: Encoding,
    /// When `true`, an environment entry without the `agi_` prefix
    /// fails the connection instead of being reported to the fault
    /// sink and skipped. A line with no colon at all is always fatal
    /// in the environment phase, since it usually means a command
    /// reply arrived before the block completed.
    pub strict_headers: bool,
    /// Receives non-fatal protocol anomalies.
    pub fault_sink: FaultSink,
}

impl Default for AgiConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            strict_headers: false,
            fault_sink: logging_fault_sink(),
        }
    }
}

impl fmt::Debug for AgiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgiConfig")
            .field("encoding", &self.encoding)
            .field("strict_headers", &self.strict_headers)
            .finish_non_exhaustive()
    }
}

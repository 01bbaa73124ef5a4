//! Sans-I/O implementation of the AGI protocol.
//!
//! A session starts with the environment block Asterisk sends, then
//! becomes a strict command/reply loop: at most one command is on the
//! wire at a time, and queued commands are written only after the
//! current reply has been delivered to its handle.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{AgiConfig, Fault, FaultSink};
use crate::constants::{AGI_ENV_PREFIX, AGI_EOL, END_OF_USAGE_PREFIX};
use crate::error::{Error, Result};
use crate::framer::LineFramer;
use crate::handle::Handle;
use crate::headers::Headers;
use crate::transport::{Engine, Transport};

/// Structured AGI command reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgiReply {
    /// Status code of the final reply line.
    pub code: u16,
    /// Value of the `result=` token, verbatim.
    pub result: Option<String>,
    /// Parenthesized verbose data, e.g. the `foobar` of
    /// `200 result=0 (foobar)`.
    pub value: Option<String>,
    /// Trailing `key=value` tokens, e.g. `endpos=1234`.
    pub extra: Vec<(String, String)>,
    /// 1xx informational lines received before the final reply.
    pub info_lines: Vec<String>,
    /// Multi-line body of the reply, when the status carried one.
    pub body_lines: Vec<String>,
}

impl AgiReply {
    /// `result=` parsed as an integer, when present and numeric.
    pub fn result_code(&self) -> Option<i64> {
        self.result.as_deref().and_then(|s| s.parse().ok())
    }
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AgiState {
    /// Consuming the leading environment block.
    HeaderIngest,
    /// Environment complete, no command in flight.
    Ready,
    /// A command is on the wire. After a 511 the engine stays here,
    /// dead, until the transport closes.
    AwaitingReply,
    /// Session over; every send fails.
    Closed,
}

struct PendingCommand {
    wire: Vec<u8>,
    handle: Handle<AgiReply>,
}

struct UsageBody {
    lines: Vec<String>,
}

enum AgiEffect {
    SessionReady,
    Resolve(Handle<AgiReply>, AgiReply),
    Reject(Handle<AgiReply>, Error),
    RejectMany(Vec<Handle<AgiReply>>, Error),
    Fault(Fault),
}

enum Step {
    Effects(Vec<AgiEffect>),
    Fatal(Error),
    Drained,
}

struct Inner {
    config: AgiConfig,
    framer: LineFramer,
    transport: Option<Box<dyn Transport>>,
    state: AgiState,
    dead: bool,
    env: Headers,
    args: Vec<String>,
    queue: VecDeque<PendingCommand>,
    head_written: bool,
    info_lines: Vec<String>,
    usage: Option<UsageBody>,
    ready_hooks: Vec<Rc<RefCell<dyn FnMut()>>>,
    lost_sinks: Vec<Rc<RefCell<dyn FnMut(Option<&Error>)>>>,
}

/// Sans-I/O AGI protocol engine.
///
/// Clones share the session; it is single-threaded (`!Send`). See
/// [`crate::net::serve_fastagi`] for a Tokio driver and
/// [`crate::agi::asyncagi`] for running sessions over an AMI carrier.
pub struct AgiProtocol {
    inner: Rc<RefCell<Inner>>,
    depth: Rc<Cell<u32>>,
    writing: Rc<Cell<bool>>,
}

impl Clone for AgiProtocol {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            depth: self.depth.clone(),
            writing: self.writing.clone(),
        }
    }
}

impl fmt::Debug for AgiProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("AgiProtocol")
            .field("state", &inner.state)
            .field("dead", &inner.dead)
            .field("pending_commands", &inner.queue.len())
            .finish_non_exhaustive()
    }
}

impl AgiProtocol {
    /// Engine with the given configuration, ready to ingest the
    /// environment block.
    pub fn new(config: AgiConfig) -> Self {
        let framer = LineFramer::new(config.encoding);
        Self {
            inner: Rc::new(RefCell::new(Inner {
                config,
                framer,
                transport: None,
                state: AgiState::HeaderIngest,
                dead: false,
                env: Headers::new(),
                args: Vec::new(),
                queue: VecDeque::new(),
                head_written: false,
                info_lines: Vec::new(),
                usage: None,
                ready_hooks: Vec::new(),
                lost_sinks: Vec::new(),
            })),
            depth: Rc::new(Cell::new(0)),
            writing: Rc::new(Cell::new(false)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgiState {
        self.inner.borrow().state
    }

    /// `true` after a 511 reply: the channel is gone and every send
    /// fails immediately.
    pub fn is_channel_dead(&self) -> bool {
        self.inner.borrow().dead
    }

    /// Environment block, `agi_` prefixes stripped, insertion order
    /// preserved.
    pub fn environment(&self) -> Headers {
        self.inner.borrow().env.clone()
    }

    /// One environment value.
    pub fn env_get(&self, name: &str) -> Option<String> {
        self.inner.borrow().env.get(name).map(str::to_string)
    }

    /// Script arguments collected from `agi_arg_1`, `agi_arg_2`, …
    pub fn arguments(&self) -> Vec<String> {
        self.inner.borrow().args.clone()
    }

    /// Commands queued or in flight.
    pub fn pending_commands(&self) -> usize {
        self.inner.borrow().queue.len()
    }

    /// Hook fired once the environment block is complete and the
    /// session is ready for commands.
    pub fn on_ready(&self, hook: impl FnMut() + 'static) {
        self.inner
            .borrow_mut()
            .ready_hooks
            .push(Rc::new(RefCell::new(hook)));
    }

    /// Sink invoked when the session ends, with the cause if any.
    pub fn on_connection_lost(&self, sink: impl FnMut(Option<&Error>) + 'static) {
        self.inner
            .borrow_mut()
            .lost_sinks
            .push(Rc::new(RefCell::new(sink)));
    }

    /// Send one AGI command built from `args`; at most one command is
    /// on the wire, additional ones queue in FIFO order.
    ///
    /// Arguments are escaped: quotes and backslashes are
    /// backslash-escaped, empty or whitespace-carrying arguments are
    /// quoted, and NUL/newline are rejected.
    ///
    /// The handle resolves with the structured [`AgiReply`], or fails
    /// with the status-specific error. After a 511 every send fails
    /// with [`Error::AgiChannelDead`] without touching the wire.
    pub fn send_command<I, S>(&self, args: I) -> Handle<AgiReply>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let handle = {
            let mut inner = self.inner.borrow_mut();
            let handle: Handle<AgiReply> =
                Handle::with_fault_sink(inner.config.fault_sink.clone());
            match inner.state {
                AgiState::Closed | AgiState::HeaderIngest => {
                    let _ = handle.set_exception(Error::NotConnected);
                    return handle;
                }
                _ if inner.dead => {
                    let _ = handle.set_exception(Error::AgiChannelDead {
                        message: "channel already reported dead".into(),
                    });
                    return handle;
                }
                AgiState::Ready | AgiState::AwaitingReply => {}
            }
            let wire = match encode_command(args, &inner.config) {
                Ok(wire) => wire,
                Err(err) => {
                    let _ = handle.set_exception(err);
                    return handle;
                }
            };
            inner.queue.push_back(PendingCommand {
                wire,
                handle: handle.clone(),
            });
            inner.state = AgiState::AwaitingReply;
            handle
        };
        if self.depth.get() == 0 {
            self.write_next();
        }
        handle
    }

    /// End the session: the transport is closed and every queued and
    /// in-flight command fails with [`Error::ConnectionLost`].
    pub fn close(&self) {
        self.teardown(Error::ConnectionLost { cause: None }, None);
    }

    fn write_next(&self) {
        if self.writing.get() {
            return;
        }
        self.writing.set(true);
        loop {
            let job = {
                let mut inner = self.inner.borrow_mut();
                if inner.state != AgiState::AwaitingReply || inner.dead || inner.head_written {
                    None
                } else if inner.queue.is_empty() {
                    inner.state = AgiState::Ready;
                    None
                } else {
                    match inner.transport.take() {
                        Some(transport) => {
                            inner.head_written = true;
                            let wire = inner
                                .queue
                                .front()
                                .map(|command| command.wire.clone())
                                .unwrap_or_default();
                            Some((wire, transport))
                        }
                        None => None,
                    }
                }
            };
            let Some((wire, mut transport)) = job else {
                break;
            };
            // The write runs without the engine borrowed: a transport
            // that feeds bytes back synchronously (Async AGI) must be
            // able to re-enter the engine.
            let written = transport.write(&wire);
            {
                let mut inner = self.inner.borrow_mut();
                if inner.state == AgiState::Closed {
                    transport.close();
                } else {
                    inner.transport = Some(transport);
                }
            }
            if let Err(err) = written {
                let handle = {
                    let mut inner = self.inner.borrow_mut();
                    inner.head_written = false;
                    inner.queue.pop_front().map(|command| command.handle)
                };
                if let Some(handle) = handle {
                    if !handle.is_completed() {
                        let _ = handle.set_exception(Error::from(err));
                    }
                }
                continue;
            }
        }
        self.writing.set(false);
    }

    fn pump(&self) {
        loop {
            let step = {
                let mut inner = self.inner.borrow_mut();
                match inner.state {
                    AgiState::Closed => Step::Drained,
                    AgiState::HeaderIngest => inner.ingest_environment(),
                    AgiState::Ready | AgiState::AwaitingReply => {
                        match inner.framer.next_line() {
                            Err(err) => Step::Fatal(err),
                            Ok(None) => Step::Drained,
                            Ok(Some(line)) => match inner.handle_line(line) {
                                Err(err) => Step::Fatal(err),
                                Ok(effects) => Step::Effects(effects),
                            },
                        }
                    }
                }
            };
            match step {
                Step::Drained => break,
                Step::Fatal(err) => {
                    self.fail_connection(err);
                    break;
                }
                Step::Effects(effects) => self.run_effects(effects),
            }
        }
    }

    fn run_effects(&self, effects: Vec<AgiEffect>) {
        self.depth.set(self.depth.get() + 1);
        for effect in effects {
            match effect {
                AgiEffect::SessionReady => {
                    let hooks = self.inner.borrow().ready_hooks.clone();
                    for hook in hooks {
                        self.guarded(|| (hook.borrow_mut())(), "session ready hook");
                    }
                }
                AgiEffect::Resolve(handle, reply) => {
                    if !handle.is_completed() {
                        let _ = handle.set_result(reply);
                    }
                }
                AgiEffect::Reject(handle, err) => {
                    if !handle.is_completed() {
                        let _ = handle.set_exception(err);
                    }
                }
                AgiEffect::RejectMany(handles, err) => {
                    for handle in handles {
                        if !handle.is_completed() {
                            let _ = handle.set_exception(err.clone());
                        }
                    }
                }
                AgiEffect::Fault(fault) => self.report_fault(&fault),
            }
        }
        self.depth.set(self.depth.get() - 1);
        if self.depth.get() == 0 {
            self.write_next();
        }
    }

    fn guarded(&self, f: impl FnOnce(), context: &str) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            self.report_fault(&Fault::HandlerPanic {
                context: context.to_string(),
            });
        }
    }

    fn report_fault(&self, fault: &Fault) {
        let sink: FaultSink = self.inner.borrow().config.fault_sink.clone();
        let _ = catch_unwind(AssertUnwindSafe(|| sink(fault)));
    }

    fn fail_connection(&self, err: Error) {
        self.teardown(err.clone(), Some(err));
    }

    fn teardown(&self, pending_error: Error, cause: Option<Error>) {
        let (transport, handles, sinks) = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == AgiState::Closed {
                return;
            }
            inner.state = AgiState::Closed;
            inner.head_written = false;
            let handles: Vec<Handle<AgiReply>> = inner
                .queue
                .drain(..)
                .map(|command| command.handle)
                .collect();
            (inner.transport.take(), handles, inner.lost_sinks.clone())
        };
        if let Some(mut transport) = transport {
            transport.close();
        }
        for handle in handles {
            if !handle.is_completed() {
                let _ = handle.set_exception(pending_error.clone());
            }
        }
        for sink in sinks {
            self.guarded(|| (sink.borrow_mut())(cause.as_ref()), "session-lost sink");
        }
    }
}

impl Engine for AgiProtocol {
    fn connection_made(&self, transport: Box<dyn Transport>) {
        let mut inner = self.inner.borrow_mut();
        inner.transport = Some(transport);
        inner.state = AgiState::HeaderIngest;
        info!("AGI transport attached, ingesting environment");
    }

    fn data_received(&self, data: &[u8]) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == AgiState::Closed {
                return;
            }
            inner.framer.feed(data);
        }
        self.pump();
    }

    fn connection_lost(&self, cause: Option<Error>) {
        self.teardown(Error::connection_lost(cause.as_ref()), cause);
    }
}

impl Inner {
    fn ingest_environment(&mut self) -> Step {
        let block = match self.framer.next_block() {
            // A line without a colon here is either garbage or a
            // command reply arriving before the environment finished;
            // both poison the session.
            Err(err) => return Step::Fatal(err),
            Ok(None) => return Step::Drained,
            Ok(Some(block)) => block,
        };
        let mut effects = Vec::new();
        for (name, value) in block.iter() {
            let Some(var) = name.strip_prefix(AGI_ENV_PREFIX) else {
                if self.config.strict_headers {
                    return Step::Fatal(Error::protocol(format!(
                        "invalid AGI variable {name:?}"
                    )));
                }
                effects.push(AgiEffect::Fault(Fault::MalformedLine {
                    line: format!("{name}: {value}"),
                }));
                continue;
            };
            if let Some(arg_index) = var.strip_prefix("arg_") {
                if let Ok(n) = arg_index.parse::<usize>() {
                    if n == self.args.len() + 1 {
                        self.args.push(value.to_string());
                        continue;
                    }
                }
            }
            if self.env.contains(var) {
                warn!(variable = var, "duplicate AGI environment variable");
            }
            self.env.push(var, value);
        }
        self.state = AgiState::Ready;
        info!(
            variables = self.env.len(),
            arguments = self.args.len(),
            "AGI environment complete"
        );
        effects.push(AgiEffect::SessionReady);
        Step::Effects(effects)
    }

    fn handle_line(&mut self, line: String) -> Result<Vec<AgiEffect>> {
        if self.state == AgiState::Ready {
            return if line.trim().is_empty() {
                Ok(Vec::new())
            } else {
                Ok(vec![AgiEffect::Fault(Fault::UnexpectedLine { line })])
            };
        }
        if let Some(usage) = &mut self.usage {
            if line.starts_with(END_OF_USAGE_PREFIX) {
                let body = self.usage.take().map(|u| u.lines).unwrap_or_default();
                return Ok(self.complete_head(Err(Error::AgiUsage { usage: body })));
            }
            usage.lines.push(line);
            return Ok(Vec::new());
        }
        let (code, separator, tail) = parse_status_line(&line)?;
        debug!(code, tail, "AGI reply line");
        match code {
            100..=199 => {
                // Informational continuation; attached to the eventual
                // reply.
                self.info_lines.push(tail.to_string());
                Ok(Vec::new())
            }
            200..=299 => {
                let (result, value, extra) = parse_result(tail);
                let reply = AgiReply {
                    code,
                    result,
                    value,
                    extra,
                    info_lines: std::mem::take(&mut self.info_lines),
                    body_lines: Vec::new(),
                };
                Ok(self.complete_head(Ok(reply)))
            }
            520 if separator == '-' || tail.contains("follows") => {
                self.usage = Some(UsageBody {
                    lines: vec![tail.to_string()],
                });
                Ok(Vec::new())
            }
            520 => Ok(self.complete_head(Err(Error::AgiUsage {
                usage: vec![tail.to_string()],
            }))),
            511 => {
                let err = Error::AgiChannelDead {
                    message: tail.to_string(),
                };
                self.dead = true;
                let mut effects = self.complete_head(Err(err.clone()));
                // Queued commands can never be written now.
                let swept: Vec<Handle<AgiReply>> = self
                    .queue
                    .drain(..)
                    .map(|command| command.handle)
                    .collect();
                if !swept.is_empty() {
                    effects.push(AgiEffect::RejectMany(swept, err));
                }
                Ok(effects)
            }
            _ => Ok(self.complete_head(Err(Error::AgiCommand {
                code,
                message: tail.to_string(),
            }))),
        }
    }

    /// Pop the in-flight command and build its completion effect. The
    /// next queued command is written after the sinks have run.
    fn complete_head(&mut self, outcome: Result<AgiReply>) -> Vec<AgiEffect> {
        self.info_lines.clear();
        self.head_written = false;
        let Some(command) = self.queue.pop_front() else {
            return vec![AgiEffect::Fault(Fault::UnexpectedLine {
                line: "reply with no command in flight".to_string(),
            })];
        };
        match outcome {
            Ok(reply) => vec![AgiEffect::Resolve(command.handle, reply)],
            Err(err) => vec![AgiEffect::Reject(command.handle, err)],
        }
    }
}

/// Escape one command argument: backslash-escape `\` and `"`, quote
/// when empty or containing whitespace or escapes.
fn escape_arg(arg: &str) -> Result<String> {
    if arg.contains('\0') || arg.contains('\n') || arg.contains('\r') {
        return Err(Error::protocol(format!(
            "forbidden characters in AGI argument {arg:?}"
        )));
    }
    let escaped = arg.replace('\\', "\\\\").replace('"', "\\\"");
    if arg.is_empty() || escaped != arg || arg.contains(' ') || arg.contains('\t') {
        Ok(format!("\"{escaped}\""))
    } else {
        Ok(escaped)
    }
}

fn encode_command<I, S>(args: I, config: &AgiConfig) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parts = Vec::new();
    for arg in args {
        parts.push(escape_arg(arg.as_ref())?);
    }
    if parts.is_empty() {
        return Err(Error::protocol("AGI command cannot be empty"));
    }
    let line = parts.join(" ") + AGI_EOL;
    config.encoding.encode(&line)
}

/// Split a status line into `(code, separator, tail)`.
fn parse_status_line(line: &str) -> Result<(u16, char, &str)> {
    let code: u16 = line
        .get(..3)
        .filter(|prefix| prefix.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|prefix| prefix.parse().ok())
        .ok_or_else(|| Error::protocol(format!("invalid AGI reply line {line:?}")))?;
    match line[3..].chars().next() {
        None => Ok((code, ' ', "")),
        Some(sep @ (' ' | '-')) => Ok((code, sep, &line[4..])),
        Some(_) => Err(Error::protocol(format!("invalid AGI reply line {line:?}"))),
    }
}

/// Parse the tail of a reply: `result=1 (foo bar) endpos=1234` becomes
/// `(Some("1"), Some("foo bar"), [("endpos", "1234")])`.
fn parse_result(tail: &str) -> (Option<String>, Option<String>, Vec<(String, String)>) {
    let mut result = None;
    let mut extra = Vec::new();
    let mut value_parts: Vec<&str> = Vec::new();
    let mut in_value = false;
    for part in tail.split(' ') {
        if in_value {
            if let Some(end) = part.strip_suffix(')') {
                value_parts.push(end);
                in_value = false;
            } else {
                value_parts.push(part);
            }
        } else if let Some(open) = part.strip_prefix('(') {
            if let Some(both) = open.strip_suffix(')') {
                value_parts.push(both);
            } else {
                value_parts.push(open);
                in_value = true;
            }
        } else if let Some((key, value)) = part.split_once('=') {
            if key == "result" {
                result = Some(value.to_string());
            } else {
                extra.push((key.to_string(), value.to_string()));
            }
        }
    }
    let value = if value_parts.is_empty() {
        None
    } else {
        Some(value_parts.join(" "))
    };
    (result, value, extra)
}

//! Sans-I/O implementation of the AMI protocol.
//!
//! The engine is a line-driven state machine fed through
//! [`Engine::data_received`]. Outbound actions are correlated with
//! their responses by an engine-assigned `ActionID`; events either
//! complete a pending list action or fan out through the handler
//! registry. All user callbacks run on the thread driving the engine,
//! and a send issued from inside a callback is queued until the
//! callback returns.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AmiConfig, Fault, FaultSink};
use crate::constants::{AMI_BANNER_PREFIX, END_COMMAND_SENTINEL};
use crate::error::{Error, Result};
use crate::framer::{split_header_line, LineFramer};
use crate::handle::Handle;
use crate::headers::Headers;
use crate::transport::{Engine, Transport};

use super::action::Action;

/// Classification of the `Response` header value.
///
/// Values outside the documented set parse as `Other` and complete the
/// pending action like a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ResponseKind {
    Success,
    Error,
    Follows,
    Goodbye,
    Other(String),
}

impl ResponseKind {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "success" => ResponseKind::Success,
            "error" => ResponseKind::Error,
            "follows" => ResponseKind::Follows,
            "goodbye" => ResponseKind::Goodbye,
            _ => ResponseKind::Other(value.to_string()),
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseKind::Success => f.write_str("Success"),
            ResponseKind::Error => f.write_str("Error"),
            ResponseKind::Follows => f.write_str("Follows"),
            ResponseKind::Goodbye => f.write_str("Goodbye"),
            ResponseKind::Other(value) => f.write_str(value),
        }
    }
}

/// Inbound response to an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Parsed `Response` header value.
    pub kind: ResponseKind,
    /// Every header except the leading `Response` line.
    pub headers: Headers,
    /// Raw payload lines of a `Follows` response.
    pub payload: Vec<String>,
}

impl Response {
    /// Echoed `ActionID`, if present.
    pub fn action_id(&self) -> Option<&str> {
        self.headers.get("ActionID")
    }

    /// `Message` header, carried by most success and error responses.
    pub fn message(&self) -> Option<&str> {
        self.headers.get("Message")
    }

    /// Payload of a `Follows` response joined with newlines, or `None`
    /// when there is none.
    pub fn payload_text(&self) -> Option<String> {
        if self.payload.is_empty() {
            None
        } else {
            Some(self.payload.join("\n"))
        }
    }
}

/// Inbound asynchronous event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// `Event` header value.
    pub name: String,
    /// Every header except the leading `Event` line.
    pub headers: Headers,
}

impl Event {
    /// `ActionID` tagging this event to a pending action, if any.
    pub fn action_id(&self) -> Option<&str> {
        self.headers.get("ActionID")
    }

    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// Completed list action: the short response plus the event stream that
/// followed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventList {
    pub response: Response,
    pub events: Vec<Event>,
}

/// What an action handle resolves with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionReply {
    /// Plain action: the response alone.
    Response(Response),
    /// List action: response plus accumulated events.
    EventList(EventList),
}

impl ActionReply {
    /// The response, for either shape.
    pub fn response(&self) -> &Response {
        match self {
            ActionReply::Response(response) => response,
            ActionReply::EventList(list) => &list.response,
        }
    }

    /// Accumulated events; empty for plain actions.
    pub fn events(&self) -> &[Event] {
        match self {
            ActionReply::Response(_) => &[],
            ActionReply::EventList(list) => &list.events,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AmiState {
    /// No transport yet.
    Disconnected,
    /// Transport attached, greeting line not yet received.
    AwaitingBanner,
    /// Banner seen; only `Login`/`Challenge` may be sent.
    Unauthenticated,
    /// Steady state.
    Authenticated,
    /// `close()` called, waiting for `connection_lost`.
    Closing,
    /// Connection gone; every send fails.
    Closed,
}

/// Token returned by handler registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHandlerToken {
    id: u64,
}

type EventCallback = Rc<RefCell<dyn FnMut(&Event)>>;
type LostCallback = Rc<RefCell<dyn FnMut(Option<&Error>)>>;

struct HandlerEntry {
    id: u64,
    /// `None` registers for every event (wildcard `"*"`).
    name: Option<String>,
    callback: EventCallback,
}

struct ListState {
    terminator: String,
    response: Option<Response>,
    events: Vec<Event>,
}

struct PendingAction {
    handle: Handle<ActionReply>,
    is_login: bool,
    list: Option<ListState>,
}

enum Parse {
    Banner,
    Idle,
    InResponse {
        kind: ResponseKind,
        headers: Headers,
    },
    FollowsPayload {
        headers: Headers,
        payload: Vec<String>,
    },
    InEvent {
        name: String,
        headers: Headers,
    },
}

enum Effect {
    Resolve(Handle<ActionReply>, ActionReply),
    Reject(Handle<ActionReply>, Error),
    Dispatch(Event),
    Fault(Fault),
    /// Login was refused: tear the connection down after the reject.
    AuthTeardown(Error),
}

enum Step {
    Effects(Vec<Effect>),
    Fatal(Error),
    Drained,
}

struct Inner {
    config: AmiConfig,
    framer: LineFramer,
    transport: Option<Box<dyn Transport>>,
    state: AmiState,
    parse: Parse,
    server_version: Option<String>,
    next_action_id: u64,
    pending: HashMap<String, PendingAction>,
    handlers: Vec<HandlerEntry>,
    next_handler_id: u64,
    lost_sinks: Vec<LostCallback>,
    outbox: VecDeque<(String, Vec<u8>)>,
}

/// Sans-I/O AMI protocol engine.
///
/// Clones share the engine; it is single-threaded (`!Send`) and must be
/// driven from one loop. See [`crate::net::AmiConnection`] for a Tokio
/// driver.
///
/// ```no_run
/// use asterisk_control::ami::AmiProtocol;
/// use asterisk_control::{AmiConfig, BufferTransport, Engine};
///
/// let ami = AmiProtocol::new(AmiConfig::default());
/// ami.connection_made(Box::new(BufferTransport::new()));
/// // ... feed the banner through data_received, then:
/// let login = ami.login("admin", "secret");
/// login.on_result(|reply| {
///     println!("authenticated: {}", reply.response().kind);
/// }).unwrap();
/// ```
pub struct AmiProtocol {
    inner: Rc<RefCell<Inner>>,
    /// Nesting depth of user-callback dispatch; sends queue while > 0.
    depth: Rc<Cell<u32>>,
}

impl Clone for AmiProtocol {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            depth: self.depth.clone(),
        }
    }
}

impl fmt::Debug for AmiProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("AmiProtocol")
            .field("state", &inner.state)
            .field("pending_actions", &inner.pending.len())
            .finish_non_exhaustive()
    }
}

impl AmiProtocol {
    /// Engine with the given configuration, not yet connected.
    pub fn new(config: AmiConfig) -> Self {
        let framer = LineFramer::new(config.encoding);
        Self {
            inner: Rc::new(RefCell::new(Inner {
                config,
                framer,
                transport: None,
                state: AmiState::Disconnected,
                parse: Parse::Banner,
                server_version: None,
                next_action_id: 1,
                pending: HashMap::new(),
                handlers: Vec::new(),
                next_handler_id: 1,
                lost_sinks: Vec::new(),
                outbox: VecDeque::new(),
            })),
            depth: Rc::new(Cell::new(0)),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AmiState {
        self.inner.borrow().state
    }

    /// Protocol version from the greeting line, once received.
    pub fn server_version(&self) -> Option<String> {
        self.inner.borrow().server_version.clone()
    }

    /// Number of actions still waiting for completion.
    pub fn pending_actions(&self) -> usize {
        self.inner.borrow().pending.len()
    }

    pub(crate) fn fault_sink(&self) -> FaultSink {
        self.inner.borrow().config.fault_sink.clone()
    }

    /// Send an action; the handle resolves with the correlated
    /// response (or response-plus-events for list actions).
    ///
    /// Pre-fails with [`Error::NotConnected`] outside the
    /// `Authenticated` state (`Login`/`Challenge` are also allowed in
    /// `Unauthenticated`), and with the underlying I/O error when the
    /// transport write fails.
    pub fn send_action(&self, action: Action) -> Handle<ActionReply> {
        let (handle, id, wire) = {
            let mut inner = self.inner.borrow_mut();
            let handle = Handle::with_fault_sink(inner.config.fault_sink.clone());
            let allowed = match inner.state {
                AmiState::Authenticated => true,
                AmiState::Unauthenticated => action.is_auth(),
                _ => false,
            };
            if !allowed || inner.transport.is_none() {
                let _ = handle.set_exception(Error::NotConnected);
                return handle;
            }
            let id = inner.next_action_id.to_string();
            inner.next_action_id += 1;
            let wire = match action.to_wire(&id, inner.config.encoding) {
                Ok(wire) => wire,
                Err(err) => {
                    let _ = handle.set_exception(err);
                    return handle;
                }
            };
            let terminator = action
                .terminator()
                .map(str::to_string)
                .or_else(|| inner.config.list_action_terminators.get(action.name()).cloned());
            debug!(action = action.name(), action_id = %id, list = terminator.is_some(), "sending action");
            inner.pending.insert(
                id.clone(),
                PendingAction {
                    handle: handle.clone(),
                    is_login: action.is_login(),
                    list: terminator.map(|terminator| ListState {
                        terminator,
                        response: None,
                        events: Vec::new(),
                    }),
                },
            );
            (handle, id, wire)
        };
        if self.depth.get() > 0 {
            self.inner.borrow_mut().outbox.push_back((id, wire));
        } else {
            self.write_now(id, wire);
        }
        handle
    }

    /// Send a `Login` action.
    pub fn login(&self, username: &str, secret: &str) -> Handle<ActionReply> {
        match Action::new("Login")
            .header("Username", username)
            .and_then(|a| a.header("Secret", secret))
        {
            Ok(action) => self.send_action(action),
            Err(err) => Handle::failed(err),
        }
    }

    /// Send a `Logoff` action; the switch answers `Response: Goodbye`
    /// and closes the connection.
    pub fn logoff(&self) -> Handle<ActionReply> {
        self.send_action(Action::new("Logoff"))
    }

    /// Register `handler` for events named `name` (`"*"` receives every
    /// event, after the specific handlers). Handlers for the same name
    /// fire in registration order.
    pub fn register_event_handler(
        &self,
        name: &str,
        handler: impl FnMut(&Event) + 'static,
    ) -> EventHandlerToken {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_handler_id;
        inner.next_handler_id += 1;
        inner.handlers.push(HandlerEntry {
            id,
            name: (name != "*").then(|| name.to_string()),
            callback: Rc::new(RefCell::new(handler)),
        });
        EventHandlerToken { id }
    }

    /// Remove a previously registered handler.
    pub fn unregister_event_handler(&self, token: EventHandlerToken) {
        self.inner
            .borrow_mut()
            .handlers
            .retain(|entry| entry.id != token.id);
    }

    /// Register a sink invoked once the connection is gone, with the
    /// cause when one is known.
    pub fn on_connection_lost(&self, sink: impl FnMut(Option<&Error>) + 'static) {
        self.inner
            .borrow_mut()
            .lost_sinks
            .push(Rc::new(RefCell::new(sink)));
    }

    /// Flip to `Closing` and ask the transport to close. The engine
    /// reaches `Closed` when the embedder reports `connection_lost`.
    pub fn close(&self) {
        let transport = {
            let mut inner = self.inner.borrow_mut();
            if !matches!(
                inner.state,
                AmiState::AwaitingBanner | AmiState::Unauthenticated | AmiState::Authenticated
            ) {
                return;
            }
            inner.state = AmiState::Closing;
            inner.transport.take()
        };
        if let Some(mut transport) = transport {
            transport.close();
            let mut inner = self.inner.borrow_mut();
            if inner.state == AmiState::Closing {
                inner.transport = Some(transport);
            }
        }
    }

    fn write_now(&self, id: String, wire: Vec<u8>) {
        let result = {
            let mut inner = self.inner.borrow_mut();
            match inner.transport.as_mut() {
                Some(transport) => transport.write(&wire).map_err(Error::from),
                None => Err(Error::NotConnected),
            }
        };
        if let Err(err) = result {
            let record = self.inner.borrow_mut().pending.remove(&id);
            if let Some(record) = record {
                if !record.handle.is_completed() {
                    let _ = record.handle.set_exception(err);
                }
            }
        }
    }

    fn flush_outbox(&self) {
        loop {
            let item = self.inner.borrow_mut().outbox.pop_front();
            match item {
                Some((id, wire)) => self.write_now(id, wire),
                None => break,
            }
        }
    }

    fn pump(&self) {
        loop {
            let step = {
                let mut inner = self.inner.borrow_mut();
                if matches!(inner.state, AmiState::Disconnected | AmiState::Closed) {
                    Step::Drained
                } else {
                    match inner.framer.next_line() {
                        Err(err) => Step::Fatal(err),
                        Ok(None) => Step::Drained,
                        Ok(Some(line)) => match inner.handle_line(line) {
                            Err(err) => Step::Fatal(err),
                            Ok(effects) => Step::Effects(effects),
                        },
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

    fn run_effects(&self, effects: Vec<Effect>) {
        if effects.is_empty() {
            return;
        }
        self.depth.set(self.depth.get() + 1);
        for effect in effects {
            match effect {
                Effect::Resolve(handle, reply) => {
                    // A handle the embedder already failed was cancelled:
                    // consume the reply silently.
                    if !handle.is_completed() {
                        let _ = handle.set_result(reply);
                    }
                }
                Effect::Reject(handle, err) => {
                    if !handle.is_completed() {
                        let _ = handle.set_exception(err);
                    }
                }
                Effect::Dispatch(event) => self.dispatch_event(&event),
                Effect::Fault(fault) => self.report_fault(&fault),
                Effect::AuthTeardown(err) => {
                    info!("authentication refused, closing connection");
                    self.teardown(Error::connection_lost(Some(&err)), Some(err));
                }
            }
        }
        self.depth.set(self.depth.get() - 1);
        if self.depth.get() == 0 {
            self.flush_outbox();
        }
    }

    fn dispatch_event(&self, event: &Event) {
        let callbacks: Vec<EventCallback> = {
            let inner = self.inner.borrow();
            let specific = inner.handlers.iter().filter(|entry| {
                entry
                    .name
                    .as_deref()
                    .is_some_and(|name| name.eq_ignore_ascii_case(&event.name))
            });
            let wildcard = inner.handlers.iter().filter(|entry| entry.name.is_none());
            specific
                .chain(wildcard)
                .map(|entry| entry.callback.clone())
                .collect()
        };
        if callbacks.is_empty() {
            self.report_fault(&Fault::UnhandledEvent {
                name: event.name.clone(),
            });
            return;
        }
        for callback in callbacks {
            let outcome = catch_unwind(AssertUnwindSafe(|| (callback.borrow_mut())(event)));
            if outcome.is_err() {
                self.report_fault(&Fault::HandlerPanic {
                    context: format!("handler for event {:?}", event.name),
                });
            }
        }
    }

    fn report_fault(&self, fault: &Fault) {
        let sink: FaultSink = self.inner.borrow().config.fault_sink.clone();
        let _ = catch_unwind(AssertUnwindSafe(|| sink(fault)));
    }

    /// Fatal protocol failure: close, fail pending with the error
    /// itself, notify lost sinks.
    fn fail_connection(&self, err: Error) {
        self.teardown(err.clone(), Some(err));
    }

    fn teardown(&self, pending_error: Error, cause: Option<Error>) {
        let (transport, records, sinks) = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, AmiState::Closed | AmiState::Disconnected) {
                return;
            }
            inner.state = AmiState::Closed;
            inner.parse = Parse::Idle;
            inner.outbox.clear();
            let records: Vec<PendingAction> =
                inner.pending.drain().map(|(_, record)| record).collect();
            (inner.transport.take(), records, inner.lost_sinks.clone())
        };
        if let Some(mut transport) = transport {
            transport.close();
        }
        for record in records {
            if !record.handle.is_completed() {
                let _ = record.handle.set_exception(pending_error.clone());
            }
        }
        for sink in sinks {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| (sink.borrow_mut())(cause.as_ref())));
            if outcome.is_err() {
                self.report_fault(&Fault::HandlerPanic {
                    context: "connection-lost sink".to_string(),
                });
            }
        }
    }
}

impl Engine for AmiProtocol {
    fn connection_made(&self, transport: Box<dyn Transport>) {
        let mut inner = self.inner.borrow_mut();
        inner.transport = Some(transport);
        inner.state = AmiState::AwaitingBanner;
        inner.parse = Parse::Banner;
        info!("AMI transport attached, awaiting banner");
    }

    fn data_received(&self, data: &[u8]) {
        {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, AmiState::Disconnected | AmiState::Closed) {
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
    fn handle_line(&mut self, line: String) -> Result<Vec<Effect>> {
        match &mut self.parse {
            Parse::Banner => {
                let Some(version) = line.strip_prefix(AMI_BANNER_PREFIX) else {
                    return Err(Error::protocol(format!(
                        "expected AMI banner, got {line:?}"
                    )));
                };
                self.server_version = Some(version.trim().to_string());
                self.state = AmiState::Unauthenticated;
                self.parse = Parse::Idle;
                info!(version = version.trim(), "AMI banner received");
                Ok(Vec::new())
            }
            Parse::Idle => {
                if line.is_empty() {
                    return Ok(Vec::new());
                }
                let (name, value) = match split_header_line(&line) {
                    Ok(pair) => pair,
                    Err(err) => {
                        return self.malformed(err, line);
                    }
                };
                if name.eq_ignore_ascii_case("Response") {
                    self.parse = Parse::InResponse {
                        kind: ResponseKind::parse(value),
                        headers: Headers::new(),
                    };
                    Ok(Vec::new())
                } else if name.eq_ignore_ascii_case("Event") {
                    self.parse = Parse::InEvent {
                        name: value.to_string(),
                        headers: Headers::new(),
                    };
                    Ok(Vec::new())
                } else {
                    Err(Error::protocol(format!(
                        "unexpected first message line {line:?}"
                    )))
                }
            }
            Parse::InResponse { kind, headers } => {
                if line.is_empty() {
                    let kind = kind.clone();
                    let headers = std::mem::take(headers);
                    self.parse = Parse::Idle;
                    return Ok(self.route_response(kind, headers, Vec::new()));
                }
                match split_header_line(&line) {
                    Ok((name, value)) => {
                        headers.push(name, value);
                        // The payload of a Follows response starts after
                        // the framing headers.
                        if *kind == ResponseKind::Follows
                            && headers.contains("ActionID")
                            && headers.contains("Privilege")
                        {
                            let headers = std::mem::take(headers);
                            self.parse = Parse::FollowsPayload {
                                headers,
                                payload: Vec::new(),
                            };
                        }
                        Ok(Vec::new())
                    }
                    Err(err) => {
                        if *kind == ResponseKind::Follows {
                            // Payload started without the usual header
                            // set; this line is the first payload line.
                            let headers = std::mem::take(headers);
                            self.parse = Parse::FollowsPayload {
                                headers,
                                payload: vec![line],
                            };
                            Ok(Vec::new())
                        } else {
                            self.malformed(err, line)
                        }
                    }
                }
            }
            Parse::FollowsPayload { headers, payload } => {
                if let Some(rest) = line.strip_suffix(END_COMMAND_SENTINEL) {
                    // The sentinel is sometimes glued to the last
                    // payload line without a separator.
                    if !rest.is_empty() {
                        payload.push(rest.to_string());
                    }
                    let headers = std::mem::take(headers);
                    let payload = std::mem::take(payload);
                    self.parse = Parse::Idle;
                    Ok(self.route_response(ResponseKind::Follows, headers, payload))
                } else {
                    payload.push(line);
                    Ok(Vec::new())
                }
            }
            Parse::InEvent { name, headers } => {
                if line.is_empty() {
                    let event = Event {
                        name: std::mem::take(name),
                        headers: std::mem::take(headers),
                    };
                    self.parse = Parse::Idle;
                    return Ok(self.route_event(event));
                }
                match split_header_line(&line) {
                    Ok((name, value)) => {
                        headers.push(name, value);
                        Ok(Vec::new())
                    }
                    Err(err) => self.malformed(err, line),
                }
            }
        }
    }

    fn malformed(&self, err: Error, line: String) -> Result<Vec<Effect>> {
        if self.config.strict_headers {
            Err(err)
        } else {
            Ok(vec![Effect::Fault(Fault::MalformedLine { line })])
        }
    }

    fn route_response(
        &mut self,
        kind: ResponseKind,
        headers: Headers,
        payload: Vec<String>,
    ) -> Vec<Effect> {
        let Some(id) = headers.get("ActionID").map(str::to_string) else {
            return vec![Effect::Fault(Fault::UnmatchedResponse { action_id: None })];
        };
        if !self.pending.contains_key(&id) {
            return vec![Effect::Fault(Fault::UnmatchedResponse {
                action_id: Some(id),
            })];
        }
        let response = Response {
            kind: kind.clone(),
            headers,
            payload,
        };
        if kind == ResponseKind::Error {
            let record = match self.pending.remove(&id) {
                Some(record) => record,
                None => return Vec::new(),
            };
            let err = Error::Action {
                message: response.message().unwrap_or_default().to_string(),
            };
            let mut effects = vec![Effect::Reject(record.handle, err.clone())];
            if record.is_login {
                effects.push(Effect::AuthTeardown(err));
            }
            return effects;
        }
        let is_list = self
            .pending
            .get(&id)
            .is_some_and(|record| record.list.is_some());
        if is_list {
            if let Some(list) = self.pending.get_mut(&id).and_then(|r| r.list.as_mut()) {
                list.response = Some(response);
            }
            return Vec::new();
        }
        let record = match self.pending.remove(&id) {
            Some(record) => record,
            None => return Vec::new(),
        };
        if record.is_login
            && kind == ResponseKind::Success
            && self.state == AmiState::Unauthenticated
        {
            self.state = AmiState::Authenticated;
            info!("AMI authentication accepted");
        }
        vec![Effect::Resolve(
            record.handle,
            ActionReply::Response(response),
        )]
    }

    fn route_event(&mut self, event: Event) -> Vec<Effect> {
        let list_id = event.action_id().and_then(|id| {
            self.pending
                .get(id)
                .is_some_and(|record| record.list.is_some())
                .then(|| id.to_string())
        });
        let Some(id) = list_id else {
            return vec![Effect::Dispatch(event)];
        };
        let is_terminator = self
            .pending
            .get(&id)
            .and_then(|record| record.list.as_ref())
            .is_some_and(|list| {
                list.response.is_some() && event.name.eq_ignore_ascii_case(&list.terminator)
            });
        if !is_terminator {
            if let Some(list) = self.pending.get_mut(&id).and_then(|r| r.list.as_mut()) {
                list.events.push(event);
            }
            return Vec::new();
        }
        let record = match self.pending.remove(&id) {
            Some(record) => record,
            None => return Vec::new(),
        };
        let Some(mut list) = record.list else {
            return Vec::new();
        };
        let Some(mut response) = list.response.take() else {
            return Vec::new();
        };
        if self.config.include_list_terminator {
            list.events.push(event);
        } else {
            response.headers.merge(&event.headers);
        }
        vec![Effect::Resolve(
            record.handle,
            ActionReply::EventList(EventList {
                response,
                events: list.events,
            }),
        )]
    }
}

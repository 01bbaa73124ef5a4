//! AGI sessions tunnelled over an AMI carrier (Async AGI).
//!
//! Asterisk announces an Async-AGI channel with an `AsyncAGI`/`Start`
//! event whose `Env` header carries the percent-encoded environment
//! block. Commands travel as `AGI` actions; each result comes back in
//! an `AsyncAGI`/`Exec` event. The executor reconstitutes the ordinary
//! AGI byte stream from those events, so [`AgiProtocol`] runs
//! unchanged: its transport just happens to write AMI frames.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use percent_encoding::percent_decode_str;
use tracing::{error, warn};
use uuid::Uuid;

use crate::ami::{Action, AmiProtocol, Event, EventHandlerToken};
use crate::config::{AgiConfig, Encoding, Fault, FaultSink};
use crate::transport::{Engine, Transport};

use super::protocol::{AgiProtocol, AgiState};

type SessionFactory = Rc<RefCell<dyn FnMut(&str, AgiProtocol)>>;

struct ChannelBinding {
    agi: AgiProtocol,
    /// Command ids sent for this channel and not yet answered by an
    /// `Exec` event.
    pending: HashSet<String>,
}

struct ExecInner {
    agi_config: AgiConfig,
    channels: HashMap<String, ChannelBinding>,
    next_command_id: u64,
    stem: String,
    factory: SessionFactory,
}

/// Dispatches between one AMI engine and any number of Async-AGI
/// channels.
///
/// The session factory is invoked for every `AsyncAGI Start` with the
/// channel id and a fresh [`AgiProtocol`], before the environment is
/// fed; attach ready hooks and command sinks there. Bind at most one
/// executor per AMI engine.
pub struct AsyncAgiExecutor {
    ami: AmiProtocol,
    inner: Rc<RefCell<ExecInner>>,
    tokens: Vec<EventHandlerToken>,
}

impl AsyncAgiExecutor {
    /// Bind an executor to `ami`. Sessions use `agi_config`.
    pub fn bind(
        ami: &AmiProtocol,
        agi_config: AgiConfig,
        factory: impl FnMut(&str, AgiProtocol) + 'static,
    ) -> Self {
        let stem: String = Uuid::new_v4().simple().to_string().chars().take(10).collect();
        let inner = Rc::new(RefCell::new(ExecInner {
            agi_config,
            channels: HashMap::new(),
            next_command_id: 1,
            stem,
            factory: Rc::new(RefCell::new(factory)),
        }));
        let mut tokens = Vec::new();

        let state = inner.clone();
        let carrier = ami.clone();
        let sink = ami.fault_sink();
        tokens.push(
            ami.register_event_handler("AsyncAGI", move |event| match event.header("SubEvent") {
                Some("Start") => on_start(&state, &carrier, event, &sink),
                Some("Exec") => on_exec(&state, event, &sink),
                Some("End") => on_end(&state, event, &sink),
                other => warn!(?other, "unknown AsyncAGI subevent"),
            }),
        );

        let state = inner.clone();
        tokens.push(ami.register_event_handler("Hangup", move |event| {
            let Some(channel) = event.header("Channel") else {
                return;
            };
            let agi = state
                .borrow()
                .channels
                .get(channel)
                .map(|binding| binding.agi.clone());
            if let Some(agi) = agi {
                synthesize_dead(&agi, "Channel hung up");
            }
        }));

        let state = inner.clone();
        ami.on_connection_lost(move |cause| {
            let sessions: Vec<AgiProtocol> = state
                .borrow_mut()
                .channels
                .drain()
                .map(|(_, binding)| binding.agi)
                .collect();
            for agi in sessions {
                agi.connection_lost(cause.cloned());
            }
        });

        Self {
            ami: ami.clone(),
            inner,
            tokens,
        }
    }

    /// Number of live Async-AGI sessions.
    pub fn active_sessions(&self) -> usize {
        self.inner.borrow().channels.len()
    }

    /// The session bound to `channel`, if any.
    pub fn session(&self, channel: &str) -> Option<AgiProtocol> {
        self.inner
            .borrow()
            .channels
            .get(channel)
            .map(|binding| binding.agi.clone())
    }
}

impl Drop for AsyncAgiExecutor {
    fn drop(&mut self) {
        for token in self.tokens.drain(..) {
            self.ami.unregister_event_handler(token);
        }
    }
}

/// Feed a synthetic `511` when a command is awaiting its reply, so a
/// dead carrier channel looks exactly like a dead FastAGI channel.
fn synthesize_dead(agi: &AgiProtocol, reason: &str) {
    if agi.pending_commands() > 0 && !agi.is_channel_dead() {
        agi.data_received(format!("511 result=-1 {reason}\n").as_bytes());
    }
}

fn decode_agi_payload(value: &str) -> Vec<u8> {
    percent_decode_str(value).collect()
}

fn on_start(state: &Rc<RefCell<ExecInner>>, ami: &AmiProtocol, event: &Event, sink: &FaultSink) {
    let Some(channel) = event.header("Channel") else {
        return;
    };
    let Some(env) = event.header("Env") else {
        warn!(channel, "AsyncAGI start without Env header");
        return;
    };
    if state.borrow().channels.contains_key(channel) {
        error!(channel, "AsyncAGI start for an already bound channel");
        return;
    }
    let (agi, factory, encoding) = {
        let inner = state.borrow();
        (
            AgiProtocol::new(inner.agi_config.clone()),
            inner.factory.clone(),
            inner.agi_config.encoding,
        )
    };
    agi.connection_made(Box::new(AsyncAgiTransport {
        ami: ami.clone(),
        exec: Rc::downgrade(state),
        channel: channel.to_string(),
        encoding,
    }));
    state.borrow_mut().channels.insert(
        channel.to_string(),
        ChannelBinding {
            agi: agi.clone(),
            pending: HashSet::new(),
        },
    );
    {
        let session = agi.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (factory.borrow_mut())(channel, session);
        }));
        if outcome.is_err() {
            sink(&Fault::HandlerPanic {
                context: "Async AGI session factory".to_string(),
            });
        }
    }
    agi.data_received(&decode_agi_payload(env));
    if agi.state() != AgiState::Ready {
        error!(channel, "AsyncAGI environment block did not complete");
    }
}

fn on_exec(state: &Rc<RefCell<ExecInner>>, event: &Event, sink: &FaultSink) {
    let Some(channel) = event.header("Channel") else {
        return;
    };
    let Some(command_id) = event.header("CommandID") else {
        return;
    };
    let Some(result) = event.header("Result") else {
        return;
    };
    let agi = {
        let mut inner = state.borrow_mut();
        let Some(binding) = inner.channels.get_mut(channel) else {
            // Could be from a stale session.
            sink(&Fault::UnknownChannel {
                channel: channel.to_string(),
            });
            return;
        };
        if !binding.pending.remove(command_id) {
            sink(&Fault::UnknownCommandId {
                command_id: command_id.to_string(),
            });
            return;
        }
        binding.agi.clone()
    };
    agi.data_received(&decode_agi_payload(result));
}

fn on_end(state: &Rc<RefCell<ExecInner>>, event: &Event, sink: &FaultSink) {
    let Some(channel) = event.header("Channel") else {
        return;
    };
    let binding = state.borrow_mut().channels.remove(channel);
    let Some(binding) = binding else {
        sink(&Fault::UnknownChannel {
            channel: channel.to_string(),
        });
        return;
    };
    synthesize_dead(&binding.agi, "Channel hung up");
    binding.agi.connection_lost(None);
}

/// Transport presenting the AMI carrier as an AGI byte sink.
struct AsyncAgiTransport {
    ami: AmiProtocol,
    exec: Weak<RefCell<ExecInner>>,
    channel: String,
    encoding: Encoding,
}

impl Transport for AsyncAgiTransport {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let Some(exec) = self.exec.upgrade() else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "Async AGI executor dropped",
            ));
        };
        let line = self
            .encoding
            .decode(data)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        let command = line.trim_end_matches(['\r', '\n']).to_string();
        let command_id = {
            let mut inner = exec.borrow_mut();
            let id = format!("{}-{}", inner.next_command_id, inner.stem);
            inner.next_command_id += 1;
            if let Some(binding) = inner.channels.get_mut(&self.channel) {
                binding.pending.insert(id.clone());
            }
            id
        };
        let action = Action::new("AGI")
            .header("Channel", &self.channel)
            .and_then(|a| a.header("Command", &command))
            .and_then(|a| a.header("CommandID", &command_id))
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;

        // The AGI action is acknowledged synchronously; the command
        // result arrives later as an Exec event. A refused action means
        // the channel is unusable: surface it as a dead channel.
        let handle = self.ami.send_action(action);
        let exec = self.exec.clone();
        let channel = self.channel.clone();
        let _ = handle.on_exception(move |err| {
            warn!(%channel, %err, "AGI carrier action refused");
            let Some(exec) = exec.upgrade() else {
                return;
            };
            let agi = {
                let mut inner = exec.borrow_mut();
                inner.channels.get_mut(&channel).map(|binding| {
                    binding.pending.remove(&command_id);
                    binding.agi.clone()
                })
            };
            if let Some(agi) = agi {
                synthesize_dead(&agi, "carrier action refused");
            }
        });
        Ok(())
    }

    fn close(&mut self) {
        if let Some(exec) = self.exec.upgrade() {
            exec.borrow_mut().channels.remove(&self.channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AmiConfig;
    use crate::error::Error;
    use crate::transport::BufferTransport;

    const CHANNEL: &str = "Local/678@default-00000012;2";

    // "agi_request: async\nagi_channel: <CHANNEL>\n\n"
    const START_EVENT: &[u8] = b"Event: AsyncAGI\r\n\
        Privilege: agi,all\r\n\
        SubEvent: Start\r\n\
        Channel: Local/678@default-00000012;2\r\n\
        Env: agi_request%3A%20async%0Aagi_channel%3A%20Local%2F678%40default-00000012%3B2%0A%0A\r\n\
        \r\n";

    fn authenticated_ami() -> (AmiProtocol, BufferTransport) {
        let ami = AmiProtocol::new(AmiConfig::default());
        let wire = BufferTransport::new();
        ami.connection_made(Box::new(wire.clone()));
        ami.data_received(b"Asterisk Call Manager/2.10.3\r\n");
        ami.login("admin", "secret");
        ami.data_received(b"Response: Success\r\nActionID: 1\r\n\r\n");
        wire.drain();
        (ami, wire)
    }

    fn bound() -> (AmiProtocol, BufferTransport, AsyncAgiExecutor, Rc<RefCell<Vec<AgiProtocol>>>) {
        let (ami, wire) = authenticated_ami();
        let sessions = Rc::new(RefCell::new(Vec::new()));
        let sessions2 = sessions.clone();
        let executor = AsyncAgiExecutor::bind(&ami, AgiConfig::default(), move |_, agi| {
            sessions2.borrow_mut().push(agi);
        });
        (ami, wire, executor, sessions)
    }

    fn header_value(wire_text: &str, name: &str) -> String {
        wire_text
            .lines()
            .find_map(|line| line.strip_prefix(&format!("{name}: ")))
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn start_event_opens_session_with_environment() {
        let (ami, _wire, executor, sessions) = bound();
        ami.data_received(START_EVENT);
        assert_eq!(executor.active_sessions(), 1);
        let agi = sessions.borrow()[0].clone();
        assert_eq!(agi.state(), AgiState::Ready);
        assert_eq!(agi.env_get("request").as_deref(), Some("async"));
        assert_eq!(agi.env_get("channel").as_deref(), Some(CHANNEL));
        assert!(executor.session(CHANNEL).is_some());
    }

    #[test]
    fn command_round_trip_over_carrier() {
        let (ami, wire, _executor, sessions) = bound();
        ami.data_received(START_EVENT);
        let agi = sessions.borrow()[0].clone();

        let handle = agi.send_command(["EXEC", "Playback", "welcome"]);
        let written = String::from_utf8(wire.drain()).unwrap();
        assert!(written.contains("Action: AGI"));
        assert_eq!(header_value(&written, "Channel"), CHANNEL);
        assert_eq!(header_value(&written, "Command"), "EXEC Playback welcome");
        let command_id = header_value(&written, "CommandID");
        assert!(!command_id.is_empty());

        // Synchronous acknowledgement of the AGI action.
        ami.data_received(b"Response: Success\r\nActionID: 2\r\nMessage: Added AGI command to queue\r\n\r\n");
        assert!(!handle.is_completed());

        // The actual result arrives as an Exec event:
        // "200 result=0 (foobar) endpos=1234\n", percent-encoded.
        let exec = format!(
            "Event: AsyncAGI\r\nSubEvent: Exec\r\nChannel: {CHANNEL}\r\n\
             CommandID: {command_id}\r\n\
             Result: 200%20result%3D0%20%28foobar%29%20endpos%3D1234%0A\r\n\r\n"
        );
        ami.data_received(exec.as_bytes());
        let reply = handle.outcome().unwrap().unwrap();
        assert_eq!(reply.code, 200);
        assert_eq!(reply.value.as_deref(), Some("foobar"));
        assert_eq!(agi.state(), AgiState::Ready);
    }

    #[test]
    fn exec_with_unknown_command_id_is_reported() {
        let faults = Rc::new(RefCell::new(Vec::new()));
        let faults2 = faults.clone();
        let (ami, _wire) = {
            let ami = AmiProtocol::new({
                let mut config = AmiConfig::default();
                config.fault_sink = Rc::new(move |fault: &Fault| faults2.borrow_mut().push(fault.clone()));
                config
            });
            let wire = BufferTransport::new();
            ami.connection_made(Box::new(wire.clone()));
            ami.data_received(b"Asterisk Call Manager/2.10.3\r\n");
            ami.login("admin", "secret");
            ami.data_received(b"Response: Success\r\nActionID: 1\r\n\r\n");
            wire.drain();
            (ami, wire)
        };
        let _executor = AsyncAgiExecutor::bind(&ami, AgiConfig::default(), |_, _| {});
        ami.data_received(START_EVENT);
        let exec = format!(
            "Event: AsyncAGI\r\nSubEvent: Exec\r\nChannel: {CHANNEL}\r\n\
             CommandID: bogus\r\nResult: 200%20result%3D0%0A\r\n\r\n"
        );
        ami.data_received(exec.as_bytes());
        assert!(faults
            .borrow()
            .iter()
            .any(|fault| matches!(fault, Fault::UnknownCommandId { .. })));
    }

    #[test]
    fn hangup_synthesizes_dead_channel() {
        let (ami, wire, _executor, sessions) = bound();
        ami.data_received(START_EVENT);
        let agi = sessions.borrow()[0].clone();
        let handle = agi.send_command(["ANSWER"]);
        wire.drain();
        ami.data_received(b"Response: Success\r\nActionID: 2\r\n\r\n");
        let hangup = format!("Event: Hangup\r\nChannel: {CHANNEL}\r\nCause: 16\r\n\r\n");
        ami.data_received(hangup.as_bytes());
        assert!(matches!(
            handle.outcome(),
            Some(Err(Error::AgiChannelDead { .. }))
        ));
        assert!(agi.is_channel_dead());
    }

    #[test]
    fn end_event_closes_session() {
        let (ami, _wire, executor, sessions) = bound();
        ami.data_received(START_EVENT);
        let agi = sessions.borrow()[0].clone();
        let closed = Rc::new(std::cell::Cell::new(false));
        let closed2 = closed.clone();
        agi.on_connection_lost(move |_| closed2.set(true));
        let end = format!("Event: AsyncAGI\r\nSubEvent: End\r\nChannel: {CHANNEL}\r\n\r\n");
        ami.data_received(end.as_bytes());
        assert_eq!(executor.active_sessions(), 0);
        assert_eq!(agi.state(), AgiState::Closed);
        assert!(closed.get());
    }

    #[test]
    fn refused_carrier_action_fails_command_as_dead_channel() {
        let (ami, wire, _executor, sessions) = bound();
        ami.data_received(START_EVENT);
        let agi = sessions.borrow()[0].clone();
        let handle = agi.send_command(["ANSWER"]);
        wire.drain();
        ami.data_received(
            b"Response: Error\r\nActionID: 2\r\nMessage: Channel does not exist.\r\n\r\n",
        );
        assert!(matches!(
            handle.outcome(),
            Some(Err(Error::AgiChannelDead { .. }))
        ));
    }

    #[test]
    fn ami_connection_loss_sweeps_sessions() {
        let (ami, _wire, executor, sessions) = bound();
        ami.data_received(START_EVENT);
        let agi = sessions.borrow()[0].clone();
        let handle = agi.send_command(["ANSWER"]);
        ami.connection_lost(Some(Error::Io {
            message: "reset".into(),
        }));
        assert_eq!(executor.active_sessions(), 0);
        assert_eq!(agi.state(), AgiState::Closed);
        // The carrier action failed first, so the command observed the
        // dead-channel path before the session itself was torn down.
        assert!(matches!(
            handle.outcome(),
            Some(Err(Error::AgiChannelDead { .. }))
        ));
    }
}

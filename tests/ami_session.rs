//! End-to-end AMI sessions driven through the public engine contract,
//! with an in-memory transport standing in for the socket.

use std::cell::RefCell;
use std::rc::Rc;

use asterisk_control::ami::{Action, AmiProtocol, AmiState, ResponseKind};
use asterisk_control::{AmiConfig, BufferTransport, Encoding, Engine, Error, LineFramer};

const BANNER: &[u8] = b"Asterisk Call Manager/2.10.3\r\n";

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn connected(config: AmiConfig) -> (AmiProtocol, BufferTransport) {
    init_tracing();
    let ami = AmiProtocol::new(config);
    let wire = BufferTransport::new();
    ami.connection_made(Box::new(wire.clone()));
    ami.data_received(BANNER);
    (ami, wire)
}

#[test]
fn login_success_reaches_authenticated() {
    let (ami, wire) = connected(AmiConfig::default());
    assert_eq!(ami.server_version().as_deref(), Some("2.10.3"));

    let login = ami.login("admin", "secret");
    let written = String::from_utf8(wire.drain()).unwrap();
    assert!(written.starts_with("Action: Login\r\nActionID: 1\r\n"));
    assert!(written.contains("Username: admin\r\n"));
    assert!(written.ends_with("\r\n\r\n"));

    ami.data_received(
        b"Response: Success\r\nActionID: 1\r\nMessage: Authentication accepted\r\n\r\n",
    );
    let reply = login.outcome().unwrap().unwrap();
    assert_eq!(reply.response().kind, ResponseKind::Success);
    assert_eq!(
        reply.response().message(),
        Some("Authentication accepted")
    );
    assert_eq!(ami.state(), AmiState::Authenticated);
}

fn authenticated(config: AmiConfig) -> (AmiProtocol, BufferTransport) {
    let (ami, wire) = connected(config);
    ami.login("admin", "secret");
    ami.data_received(b"Response: Success\r\nActionID: 1\r\n\r\n");
    wire.drain();
    (ami, wire)
}

#[test]
fn list_action_from_configured_terminators() {
    let mut config = AmiConfig::default();
    config
        .list_action_terminators
        .insert("CoreShowChannels".into(), "CoreShowChannelsComplete".into());
    let (ami, _wire) = authenticated(config);

    let handle = ami.send_action(Action::new("CoreShowChannels"));
    ami.data_received(
        b"Response: Success\r\nActionID: 2\r\nMessage: Channels will follow\r\n\r\n\
          Event: CoreShowChannel\r\nActionID: 2\r\nChannel: SIP/a-0001\r\n\r\n\
          Event: CoreShowChannel\r\nActionID: 2\r\nChannel: SIP/b-0002\r\n\r\n",
    );
    // Interleaved unrelated event goes to the registry, not the list.
    let stray = Rc::new(RefCell::new(Vec::new()));
    let stray2 = stray.clone();
    ami.register_event_handler("Hangup", move |event| {
        stray2
            .borrow_mut()
            .push(event.header("Uniqueid").unwrap_or("").to_string());
    });
    ami.data_received(b"Event: Hangup\r\nUniqueid: 42.1\r\n\r\n");
    assert!(!handle.is_completed());

    ami.data_received(
        b"Event: CoreShowChannelsComplete\r\nActionID: 2\r\nListItems: 2\r\n\r\n",
    );
    let reply = handle.outcome().unwrap().unwrap();
    let events = reply.events();
    assert_eq!(events.len(), 3);
    assert_eq!(events[0].header("Channel"), Some("SIP/a-0001"));
    assert_eq!(events[1].header("Channel"), Some("SIP/b-0002"));
    assert_eq!(events[2].name, "CoreShowChannelsComplete");
    assert_eq!(*stray.borrow(), vec!["42.1"]);
}

#[test]
fn command_action_with_follows_payload() {
    let (ami, _wire) = authenticated(AmiConfig::default());
    let handle = ami.send_action(
        Action::new("Command")
            .header("Command", "core show version")
            .unwrap(),
    );
    ami.data_received(
        b"Response: Follows\r\nActionID: 2\r\nPrivilege: Command\r\n\
          line1\r\nline2\r\n--END COMMAND--\r\n\r\n",
    );
    let reply = handle.outcome().unwrap().unwrap();
    assert_eq!(reply.response().payload_text().as_deref(), Some("line1\nline2"));
}

#[test]
fn connection_lost_fails_every_pending_action() {
    let (ami, _wire) = authenticated(AmiConfig::default());
    let handles = [
        ami.send_action(Action::new("Ping")),
        ami.send_action(Action::new("Ping")),
        ami.send_action(Action::new("Ping")),
    ];
    let failures = Rc::new(RefCell::new(Vec::new()));
    for handle in &handles {
        let failures2 = failures.clone();
        handle
            .on_exception(move |err| failures2.borrow_mut().push(err))
            .unwrap();
    }

    ami.connection_lost(Some(Error::Io {
        message: "reset".into(),
    }));
    assert_eq!(ami.state(), AmiState::Closed);
    assert_eq!(failures.borrow().len(), 3);
    for err in failures.borrow().iter() {
        assert_eq!(
            *err,
            Error::ConnectionLost {
                cause: Some("I/O error: reset".into())
            }
        );
    }

    let late = ami.send_action(Action::new("Ping"));
    assert_eq!(late.outcome(), Some(Err(Error::NotConnected)));
}

#[test]
fn whole_session_survives_byte_at_a_time_delivery() {
    init_tracing();
    let ami = AmiProtocol::new(AmiConfig::default());
    let wire = BufferTransport::new();
    ami.connection_made(Box::new(wire.clone()));

    for byte in BANNER {
        ami.data_received(&[*byte]);
    }
    let login = ami.login("admin", "secret");
    let frame = b"Response: Success\r\nActionID: 1\r\nMessage: ok\r\n\r\n";
    for byte in frame {
        ami.data_received(&[*byte]);
    }
    assert!(login.outcome().unwrap().is_ok());
    assert_eq!(ami.state(), AmiState::Authenticated);
}

#[test]
fn events_dispatch_before_authentication() {
    let (ami, _wire) = connected(AmiConfig::default());
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = seen.clone();
    ami.register_event_handler("FullyBooted", move |event| {
        seen2.borrow_mut().push(event.name.clone());
    });
    ami.data_received(b"Event: FullyBooted\r\nStatus: Fully Booted\r\n\r\n");
    assert_eq!(*seen.borrow(), vec!["FullyBooted"]);
    assert_eq!(ami.state(), AmiState::Unauthenticated);
}

#[test]
fn emitted_frames_parse_back_to_the_same_headers() {
    // Emit an action, then run the emitted bytes through the framer:
    // the parsed block must reproduce the emitted key/value list.
    let (ami, wire) = authenticated(AmiConfig::default());
    ami.send_action(
        Action::new("Originate")
            .header("Channel", "SIP/100")
            .unwrap()
            .header("CallerID", "Some One <100>")
            .unwrap()
            .variable("foo", "1")
            .unwrap()
            .variable("bar", "2")
            .unwrap(),
    );

    let mut framer = LineFramer::new(Encoding::Utf8);
    framer.feed(&wire.drain());
    let block = framer.next_block().unwrap().unwrap();
    let pairs: Vec<(String, String)> = block.into();
    assert_eq!(
        pairs,
        vec![
            ("Action".to_string(), "Originate".to_string()),
            ("ActionID".to_string(), "2".to_string()),
            ("Channel".to_string(), "SIP/100".to_string()),
            ("CallerID".to_string(), "Some One <100>".to_string()),
            ("Variable".to_string(), "foo=1".to_string()),
            ("Variable".to_string(), "bar=2".to_string()),
        ]
    );
}

#[test]
fn goodbye_response_completes_logoff() {
    let (ami, _wire) = authenticated(AmiConfig::default());
    let handle = ami.logoff();
    ami.data_received(
        b"Response: Goodbye\r\nActionID: 2\r\nMessage: Thanks for all the fish.\r\n\r\n",
    );
    assert_eq!(
        handle.outcome().unwrap().unwrap().response().kind,
        ResponseKind::Goodbye
    );
    ami.connection_lost(None);
    assert_eq!(ami.state(), AmiState::Closed);
}

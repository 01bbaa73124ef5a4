//! End-to-end AGI sessions: FastAGI-style over an in-memory transport,
//! and Async AGI tunnelled through an AMI engine.

use std::cell::RefCell;
use std::rc::Rc;

use asterisk_control::agi::asyncagi::AsyncAgiExecutor;
use asterisk_control::agi::{AgiProtocol, AgiState};
use asterisk_control::ami::AmiProtocol;
use asterisk_control::{AgiConfig, AmiConfig, BufferTransport, Engine, Error};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn session() -> (AgiProtocol, BufferTransport) {
    init_tracing();
    let agi = AgiProtocol::new(AgiConfig::default());
    let wire = BufferTransport::new();
    agi.connection_made(Box::new(wire.clone()));
    agi.data_received(b"agi_channel: SIP/x-0001\nagi_uniqueid: 123.45\n\n");
    (agi, wire)
}

#[test]
fn environment_then_answer() {
    let (agi, wire) = session();
    assert_eq!(agi.state(), AgiState::Ready);
    assert_eq!(agi.env_get("channel").as_deref(), Some("SIP/x-0001"));
    assert_eq!(agi.env_get("uniqueid").as_deref(), Some("123.45"));

    let handle = agi.send_command(["ANSWER"]);
    assert_eq!(wire.drain(), b"ANSWER\n");
    agi.data_received(b"200 result=0\n");
    let reply = handle.outcome().unwrap().unwrap();
    assert_eq!(reply.code, 200);
    assert_eq!(reply.result.as_deref(), Some("0"));
    assert_eq!(agi.state(), AgiState::Ready);
}

#[test]
fn hangup_mid_session_kills_channel() {
    let (agi, wire) = session();
    let inflight = agi.send_command(["STREAM", "FILE", "welcome", "#"]);
    wire.drain();
    agi.data_received(b"511 result=-1\n");
    assert!(matches!(
        inflight.outcome(),
        Some(Err(Error::AgiChannelDead { .. }))
    ));

    // Subsequent commands fail immediately, nothing hits the wire.
    let late = agi.send_command(["SAY", "DIGITS", "42", "#"]);
    assert!(matches!(
        late.outcome(),
        Some(Err(Error::AgiChannelDead { .. }))
    ));
    assert!(wire.drain().is_empty());
    assert!(agi.is_channel_dead());
    assert_eq!(agi.state(), AgiState::AwaitingReply);
}

#[test]
fn scripted_dialog_through_sinks() {
    // An IVR-ish flow driven entirely from result sinks, the way a
    // FastAGI session runs under the Tokio driver.
    let (agi, wire) = session();
    let log = Rc::new(RefCell::new(Vec::new()));

    let log2 = log.clone();
    let agi2 = agi.clone();
    agi.send_command(["ANSWER"])
        .on_result(move |reply| {
            log2.borrow_mut().push(format!("answered {:?}", reply.result_code()));
            let log3 = log2.clone();
            agi2.send_command(["GET", "DATA", "enter-ext", "5000", "4"])
                .on_result(move |reply| {
                    log3.borrow_mut()
                        .push(format!("digits {:?}", reply.result.as_deref()));
                })
                .unwrap();
        })
        .unwrap();

    assert_eq!(wire.drain(), b"ANSWER\n");
    agi.data_received(b"200 result=0\n");
    assert_eq!(wire.drain(), b"GET DATA enter-ext 5000 4\n");
    agi.data_received(b"200 result=1234\n");
    assert_eq!(
        *log.borrow(),
        vec!["answered Some(0)".to_string(), "digits Some(\"1234\")".to_string()]
    );
}

#[test]
fn async_agi_session_over_ami_carrier() {
    init_tracing();
    let ami = AmiProtocol::new(AmiConfig::default());
    let wire = BufferTransport::new();
    ami.connection_made(Box::new(wire.clone()));
    ami.data_received(b"Asterisk Call Manager/2.10.3\r\n");
    ami.login("admin", "secret");
    ami.data_received(b"Response: Success\r\nActionID: 1\r\n\r\n");
    wire.drain();

    let sessions: Rc<RefCell<Vec<AgiProtocol>>> = Rc::new(RefCell::new(Vec::new()));
    let sessions2 = sessions.clone();
    let executor = AsyncAgiExecutor::bind(&ami, AgiConfig::default(), move |channel, agi| {
        assert_eq!(channel, "Local/678@default-0000001;2");
        sessions2.borrow_mut().push(agi);
    });

    ami.data_received(
        b"Event: AsyncAGI\r\nSubEvent: Start\r\nChannel: Local/678@default-0000001;2\r\n\
          Env: agi_request%3A%20async%0Aagi_channel%3A%20Local%2F678%40default-0000001%3B2%0A%0A\r\n\r\n",
    );
    assert_eq!(executor.active_sessions(), 1);
    let agi = sessions.borrow()[0].clone();
    assert_eq!(agi.state(), AgiState::Ready);

    let handle = agi.send_command(["SAY", "ALPHA", "HELLO WORLD", ""]);
    let written = String::from_utf8(wire.drain()).unwrap();
    assert!(written.contains("Action: AGI\r\n"));
    assert!(written.contains("Command: SAY ALPHA \"HELLO WORLD\" \"\"\r\n"));
    let command_id = written
        .lines()
        .find_map(|line| line.strip_prefix("CommandID: "))
        .unwrap()
        .to_string();

    ami.data_received(b"Response: Success\r\nActionID: 2\r\n\r\n");
    let exec = format!(
        "Event: AsyncAGI\r\nSubEvent: Exec\r\nChannel: Local/678@default-0000001;2\r\n\
         CommandID: {command_id}\r\nResult: 200%20result%3D1%0A\r\n\r\n"
    );
    ami.data_received(exec.as_bytes());
    assert_eq!(handle.outcome().unwrap().unwrap().result_code(), Some(1));

    ami.data_received(
        b"Event: AsyncAGI\r\nSubEvent: End\r\nChannel: Local/678@default-0000001;2\r\n\r\n",
    );
    assert_eq!(executor.active_sessions(), 0);
    assert_eq!(agi.state(), AgiState::Closed);
}

//! Tokio drivers for the sans-I/O engines.
//!
//! The engines own no socket; these drivers pump a [`TcpStream`] into
//! an engine and flush whatever the engine wrote back out. Because the
//! engines are `!Send`, everything runs inside one task; use a
//! [`tokio::task::LocalSet`] when sessions must run concurrently.

use std::rc::Rc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::agi::AgiProtocol;
use crate::ami::{AmiProtocol, AmiState};
use crate::config::{AgiConfig, AmiConfig};
use crate::constants::SOCKET_BUF_SIZE;
use crate::error::{Error, Result};
use crate::transport::{BufferTransport, Engine, Transport};

/// TCP connect timeout in milliseconds.
const CONNECT_TIMEOUT_MS: u64 = 2000;

/// Outbound buffer that wakes the driver whenever the engine writes.
#[derive(Clone)]
struct DriverTransport {
    buffer: BufferTransport,
    notify: Rc<Notify>,
}

impl DriverTransport {
    fn new() -> Self {
        Self {
            buffer: BufferTransport::new(),
            notify: Rc::new(Notify::new()),
        }
    }
}

impl Transport for DriverTransport {
    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.buffer.write(data)?;
        self.notify.notify_one();
        Ok(())
    }

    fn close(&mut self) {
        self.buffer.close();
        self.notify.notify_one();
    }
}

/// Establish a TCP connection with a timeout.
async fn tcp_connect_with_timeout(host: &str, port: u16) -> Result<TcpStream> {
    match timeout(
        Duration::from_millis(CONNECT_TIMEOUT_MS),
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(stream)) => {
            debug!("TCP connection established");
            Ok(stream)
        }
        Ok(Err(err)) => {
            warn!("TCP connect failed: {err}");
            Err(Error::from(err))
        }
        Err(_) => {
            warn!("TCP connect timed out after {CONNECT_TIMEOUT_MS}ms");
            Err(Error::Io {
                message: format!("connect timed out after {CONNECT_TIMEOUT_MS}ms"),
            })
        }
    }
}

/// Pump `stream` into `engine` and engine output back, until the
/// connection or the engine ends.
async fn drive<E: Engine>(
    mut stream: TcpStream,
    engine: E,
    outbound: DriverTransport,
) -> Result<()> {
    let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
    loop {
        let pending = outbound.buffer.drain();
        if !pending.is_empty() {
            if let Err(err) = stream.write_all(&pending).await {
                let err = Error::from(err);
                engine.connection_lost(Some(err.clone()));
                return Err(err);
            }
        }
        if outbound.buffer.is_closed() {
            let _ = stream.shutdown().await;
            engine.connection_lost(None);
            return Ok(());
        }
        tokio::select! {
            read = stream.read(&mut read_buffer) => match read {
                Ok(0) => {
                    info!("connection closed (EOF)");
                    engine.connection_lost(None);
                    return Ok(());
                }
                Ok(n) => engine.data_received(&read_buffer[..n]),
                Err(err) => {
                    warn!("read error: {err}");
                    let err = Error::from(err);
                    engine.connection_lost(Some(err.clone()));
                    return Err(err);
                }
            },
            // The engine wrote (or closed) from outside this task;
            // loop around to flush.
            _ = outbound.notify.notified() => {}
        }
    }
}

/// AMI client connection: a TCP stream plus the engine driving it.
///
/// ```no_run
/// use asterisk_control::net::AmiConnection;
/// use asterisk_control::AmiConfig;
///
/// # async fn example() -> asterisk_control::Result<()> {
/// let connection = AmiConnection::connect("pbx.example.com", 5038, AmiConfig::default()).await?;
/// let ami = connection.protocol();
/// let login = ami.login("admin", "secret");
/// login.on_result(|_| println!("authenticated")).unwrap();
/// connection.run().await
/// # }
/// ```
pub struct AmiConnection {
    stream: TcpStream,
    protocol: AmiProtocol,
    outbound: DriverTransport,
}

impl AmiConnection {
    /// Connect and consume the greeting banner; the returned
    /// connection is ready for a `Login` action.
    pub async fn connect(host: &str, port: u16, config: AmiConfig) -> Result<Self> {
        info!("connecting to AMI at {host}:{port}");
        let mut stream = tcp_connect_with_timeout(host, port).await?;
        let protocol = AmiProtocol::new(config);
        let outbound = DriverTransport::new();
        protocol.connection_made(Box::new(outbound.clone()));

        let mut read_buffer = vec![0u8; SOCKET_BUF_SIZE];
        let banner = timeout(Duration::from_millis(CONNECT_TIMEOUT_MS), async {
            while protocol.state() == AmiState::AwaitingBanner {
                let n = stream.read(&mut read_buffer).await.map_err(Error::from)?;
                if n == 0 {
                    protocol.connection_lost(None);
                    return Err(Error::protocol("connection closed before banner"));
                }
                protocol.data_received(&read_buffer[..n]);
            }
            Ok(())
        })
        .await
        .map_err(|_| Error::Io {
            message: format!("no banner within {CONNECT_TIMEOUT_MS}ms"),
        })?;
        banner?;
        if protocol.state() == AmiState::Closed {
            return Err(Error::protocol("server did not send an AMI banner"));
        }
        info!(
            version = protocol.server_version().as_deref().unwrap_or("?"),
            "AMI banner received"
        );
        Ok(Self {
            stream,
            protocol,
            outbound,
        })
    }

    /// Shared handle to the engine, for sends and handler
    /// registration.
    pub fn protocol(&self) -> AmiProtocol {
        self.protocol.clone()
    }

    /// Drive the connection until it closes. Resolves `Ok` on orderly
    /// shutdown (EOF or engine-initiated close) and `Err` on I/O
    /// failure; pending actions are failed either way.
    pub async fn run(self) -> Result<()> {
        drive(self.stream, self.protocol, self.outbound).await
    }
}

/// Accept FastAGI connections forever, one engine per connection.
///
/// `session` is invoked with each fresh [`AgiProtocol`] before any
/// bytes are processed; attach ready hooks and command sinks there.
/// Connections are driven on [`tokio::task::spawn_local`], so this
/// must run inside a [`tokio::task::LocalSet`].
///
/// ```no_run
/// use asterisk_control::net::serve_fastagi;
/// use asterisk_control::AgiConfig;
/// use tokio::net::TcpListener;
///
/// # async fn example() -> asterisk_control::Result<()> {
/// let listener = TcpListener::bind(("0.0.0.0", asterisk_control::DEFAULT_FASTAGI_PORT))
///     .await
///     .map_err(asterisk_control::Error::from)?;
/// let local = tokio::task::LocalSet::new();
/// local.run_until(serve_fastagi(listener, AgiConfig::default(), |agi| {
///     let session = agi.clone();
///     agi.on_ready(move || {
///         session.send_command(["ANSWER"]);
///     });
/// })).await
/// # }
/// ```
pub async fn serve_fastagi(
    listener: TcpListener,
    config: AgiConfig,
    mut session: impl FnMut(AgiProtocol),
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await.map_err(Error::from)?;
        info!(%peer, "accepted FastAGI connection");
        let agi = AgiProtocol::new(config.clone());
        let outbound = DriverTransport::new();
        agi.connection_made(Box::new(outbound.clone()));
        session(agi.clone());
        tokio::task::spawn_local(async move {
            if let Err(err) = drive(stream, agi, outbound).await {
                warn!("FastAGI session ended with error: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agi::AgiState;
    use std::cell::RefCell;
    use tokio::task::LocalSet;

    async fn wait_until(mut done: impl FnMut() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn ami_connect_login_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(b"Asterisk Call Manager/2.10.3\r\n")
                .await
                .unwrap();
            let mut buf = vec![0u8; 4096];
            let mut received = Vec::new();
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "client hung up before logging in");
                received.extend_from_slice(&buf[..n]);
            }
            let text = String::from_utf8(received).unwrap();
            assert!(text.contains("Action: Login"));
            assert!(text.contains("Username: admin"));
            socket
                .write_all(
                    b"Response: Success\r\nActionID: 1\r\nMessage: Authentication accepted\r\n\r\n",
                )
                .await
                .unwrap();
            // Wait for the client to shut the connection down.
            while socket.read(&mut buf).await.unwrap() > 0 {}
        });

        let local = LocalSet::new();
        local
            .run_until(async move {
                let connection = AmiConnection::connect(
                    &addr.ip().to_string(),
                    addr.port(),
                    AmiConfig::default(),
                )
                .await
                .unwrap();
                let ami = connection.protocol();
                assert_eq!(ami.state(), AmiState::Unauthenticated);
                assert_eq!(ami.server_version().as_deref(), Some("2.10.3"));

                let login = ami.login("admin", "secret");
                let driver = tokio::task::spawn_local(connection.run());

                let login_probe = login.clone();
                wait_until(move || login_probe.is_completed()).await;
                assert!(login.outcome().unwrap().is_ok());
                assert_eq!(ami.state(), AmiState::Authenticated);

                ami.close();
                driver.await.unwrap().unwrap();
                assert_eq!(ami.state(), AmiState::Closed);
            })
            .await;

        server.await.unwrap();
    }

    #[tokio::test]
    async fn fastagi_session_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let local = LocalSet::new();
        local
            .run_until(async move {
                let sessions: Rc<RefCell<Vec<AgiProtocol>>> = Rc::new(RefCell::new(Vec::new()));
                let sessions2 = sessions.clone();
                tokio::task::spawn_local(serve_fastagi(
                    listener,
                    AgiConfig::default(),
                    move |agi| sessions2.borrow_mut().push(agi),
                ));

                let mut client = TcpStream::connect(addr).await.unwrap();
                client
                    .write_all(b"agi_request: fastagi\nagi_channel: SIP/x-1\n\n")
                    .await
                    .unwrap();

                let probe = sessions.clone();
                wait_until(move || {
                    probe
                        .borrow()
                        .first()
                        .is_some_and(|agi| agi.state() == AgiState::Ready)
                })
                .await;
                let agi = sessions.borrow()[0].clone();
                assert_eq!(agi.env_get("request").as_deref(), Some("fastagi"));

                let handle = agi.send_command(["ANSWER"]);
                let mut buf = [0u8; 64];
                let n = client.read(&mut buf).await.unwrap();
                assert_eq!(&buf[..n], b"ANSWER\n");
                client.write_all(b"200 result=0\n").await.unwrap();

                let handle_probe = handle.clone();
                wait_until(move || handle_probe.is_completed()).await;
                let reply = handle.outcome().unwrap().unwrap();
                assert_eq!(reply.result_code(), Some(0));

                drop(client);
                let agi_probe = agi.clone();
                wait_until(move || agi_probe.state() == AgiState::Closed).await;
            })
            .await;
    }
}

//! KATCP protocol session
//!
//! One `KatcpSession` owns one TCP connection to a KATCP endpoint:
//! - A background reader task keeps the connection drained between requests
//! - `request()` sends one request and waits for its reply plus informs
//! - Requests on a session are serialized, never interleaved
//! - Each request carries a message id; replies and informs tagged with
//!   another id are dropped, so a late reply never completes a newer request
//! - `close()` (or dropping the session) releases the reader task

pub mod message;

use crate::error::{PollError, Result};
use message::{Message, MessageKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Target of one protocol session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Same host, different port (secondary array/sensor ports)
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = PollError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| PollError::Config(format!("expected ip:port, got {s:?}")))?;
        if host.is_empty() {
            return Err(PollError::Config(format!("missing host in {s:?}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| PollError::Config(format!("invalid port in {s:?}: {e}")))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = PollError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Server announced its protocol version
    Synced,
    Failed,
}

/// Outcome of one request/reply exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    /// Reply arguments after the status token
    pub arguments: Vec<String>,
    /// Argument lists of the informs received before the reply
    pub informs: Vec<Vec<String>>,
}

struct Pending {
    name: String,
    mid: u32,
    informs: Vec<Vec<String>>,
    done: oneshot::Sender<Result<Reply>>,
}

struct Shared {
    state: SessionState,
    pending: Option<Pending>,
}

pub struct KatcpSession {
    endpoint: Endpoint,
    shared: Arc<Mutex<Shared>>,
    // Holding this lock for a whole exchange serializes requests
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    next_mid: AtomicU32,
}

impl KatcpSession {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            shared: Arc::new(Mutex::new(Shared {
                state: SessionState::Connecting,
                pending: None,
            })),
            writer: tokio::sync::Mutex::new(None),
            reader_task: Mutex::new(None),
            next_mid: AtomicU32::new(1),
        }
    }

    /// Connect and start the background reader; fails if the transport is
    /// not running within `timeout`. A failed attempt is closed before the
    /// error is returned.
    pub async fn connect(endpoint: &Endpoint, timeout: Duration) -> Result<Self> {
        info!("Establishing KATCP connection on {}", endpoint);
        let session = Self::new(endpoint.clone());

        let attempt = tokio::time::timeout(
            timeout,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await;

        match attempt {
            Ok(Ok(stream)) => {
                session.start(stream).await;
                info!("KATCP client connected to {}", endpoint);
                Ok(session)
            }
            Ok(Err(e)) => {
                session.close().await;
                session.shared.lock().state = SessionState::Failed;
                warn!("Could not connect to {}: {}", endpoint, e);
                Err(PollError::Io(e))
            }
            Err(_) => {
                session.close().await;
                session.shared.lock().state = SessionState::Failed;
                warn!("Could not connect to {}, timed out", endpoint);
                Err(PollError::ConnectTimeout {
                    endpoint: endpoint.clone(),
                    timeout,
                })
            }
        }
    }

    async fn start(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed on {}: {}", self.endpoint, e);
        }
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);
        self.shared.lock().state = SessionState::Connected;

        let task = tokio::spawn(read_loop(reader, self.shared.clone(), self.endpoint.clone()));
        *self.reader_task.lock() = Some(task);
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), SessionState::Connected | SessionState::Synced)
    }

    /// Send `?name [arg]` and wait for `!name` plus the `#name` informs
    /// that precede it.
    pub async fn request(&self, name: &str, arg: Option<&str>, timeout: Duration) -> Result<Reply> {
        let mut writer_guard = self.writer.lock().await;
        let writer = match writer_guard.as_mut() {
            Some(writer) if self.is_connected() => writer,
            _ => return Err(PollError::Disconnected(self.endpoint.clone())),
        };

        let mid = self.next_mid.fetch_add(1, Ordering::Relaxed);
        let (done, receiver) = oneshot::channel();
        self.shared.lock().pending = Some(Pending {
            name: name.to_string(),
            mid,
            informs: Vec::new(),
            done,
        });

        let arguments = arg.map(|a| vec![a.to_string()]).unwrap_or_default();
        let line = Message::request(name, arguments).with_mid(mid).encode();
        debug!("-> {} {}", self.endpoint, line.trim_end());

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            self.shared.lock().pending = None;
            warn!("Failed to send ?{} to {}: {}", name, self.endpoint, e);
            return Err(PollError::Disconnected(self.endpoint.clone()));
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PollError::Disconnected(self.endpoint.clone())),
            Err(_) => {
                self.shared.lock().pending = None;
                Err(PollError::protocol(name, format!("no reply within {timeout:?}")))
            }
        }
    }

    /// Like `request`, but a reply that is not ok becomes a protocol error
    pub async fn request_ok(&self, name: &str, arg: Option<&str>, timeout: Duration) -> Result<Reply> {
        let reply = self.request(name, arg, timeout).await?;
        if !reply.ok {
            return Err(PollError::protocol(
                name,
                format!("reply not ok: {}", reply.arguments.join(" ")),
            ));
        }
        Ok(reply)
    }

    /// Stop the reader and release the connection. Safe to call repeatedly
    /// and on sessions that never connected.
    pub async fn close(&self) {
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
            debug!("Closed KATCP session to {}", self.endpoint);
        }
        let mut shared = self.shared.lock();
        if shared.state != SessionState::Failed {
            shared.state = SessionState::Disconnected;
        }
        if let Some(pending) = shared.pending.take() {
            let _ = pending.done.send(Err(PollError::Disconnected(self.endpoint.clone())));
        }
    }
}

impl Drop for KatcpSession {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn read_loop(reader: OwnedReadHalf, shared: Arc<Mutex<Shared>>, endpoint: Endpoint) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                debug!("Connection closed by {}", endpoint);
                break;
            }
            Ok(_) => {
                // Arguments are byte strings; invalid UTF-8 is replaced, not fatal
                let line = String::from_utf8_lossy(&buf);
                if line.trim().is_empty() {
                    continue;
                }
                match Message::parse(&line) {
                    Ok(message) => dispatch(&shared, message),
                    Err(e) => warn!("Dropping undecodable line from {}: {}", endpoint, e),
                }
            }
            Err(e) => {
                warn!("Read error on {}: {}", endpoint, e);
                break;
            }
        }
    }

    let mut guard = shared.lock();
    guard.state = SessionState::Disconnected;
    if let Some(pending) = guard.pending.take() {
        let _ = pending.done.send(Err(PollError::Disconnected(endpoint)));
    }
}

impl Pending {
    /// Same name, and the same id when the server echoes one
    fn answers(&self, message: &Message) -> bool {
        self.name == message.name && message.mid.map_or(true, |mid| mid == self.mid)
    }
}

fn dispatch(shared: &Mutex<Shared>, message: Message) {
    let mut guard = shared.lock();
    match message.kind {
        MessageKind::Inform => {
            if message.name == "version-connect"
                && message.arguments.first().map(String::as_str) == Some("katcp-protocol")
                && guard.state == SessionState::Connected
            {
                guard.state = SessionState::Synced;
            }
            match guard.pending.as_mut() {
                Some(pending) if pending.answers(&message) => pending.informs.push(message.arguments),
                _ => debug!("Ignoring asynchronous inform #{}", message.name),
            }
        }
        MessageKind::Reply => {
            let matches = guard.pending.as_ref().map(|p| p.answers(&message)).unwrap_or(false);
            if !matches {
                warn!("Unexpected reply {}", message);
                return;
            }
            if let Some(pending) = guard.pending.take() {
                let ok = message.reply_ok();
                let arguments = message.arguments.into_iter().skip(1).collect();
                let _ = pending.done.send(Ok(Reply {
                    ok,
                    arguments,
                    informs: pending.informs,
                }));
            }
        }
        MessageKind::Request => debug!("Ignoring request ?{} from server", message.name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Accepts one client, answers each request line with the scripted lines
    async fn scripted_server(script: Vec<(&'static str, Vec<&'static str>)>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            writer
                .write_all(b"#version-connect katcp-protocol 5.0-MI\n")
                .await
                .unwrap();
            let mut lines = BufReader::new(reader).lines();
            for (expected, answer) in script {
                let line = lines.next_line().await.unwrap().unwrap();
                assert!(line.starts_with(expected), "unexpected request {line}");
                for out in answer {
                    writer.write_all(out.as_bytes()).await.unwrap();
                    writer.write_all(b"\n").await.unwrap();
                }
            }
        });
        Endpoint::new("127.0.0.1", port)
    }

    #[test]
    fn test_endpoint_parsing() {
        let endpoint: Endpoint = "10.103.254.6:7147".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("10.103.254.6", 7147));
        assert_eq!(endpoint.with_port(7148).to_string(), "10.103.254.6:7148");
        assert!("10.103.254.6".parse::<Endpoint>().is_err());
        assert!(":7147".parse::<Endpoint>().is_err());
        assert!("host:port".parse::<Endpoint>().is_err());
    }

    #[tokio::test]
    async fn test_request_collects_informs() {
        let endpoint = scripted_server(vec![(
            "?array-list",
            vec![
                "#log info 0 root unrelated",
                "#array-list array0 7148,7149",
                "#array-list array1 7150,7151",
                "!array-list ok 2",
            ],
        )])
        .await;

        let session = KatcpSession::connect(&endpoint, TIMEOUT).await.unwrap();
        let reply = session.request("array-list", None, TIMEOUT).await.unwrap();
        assert!(reply.ok);
        assert_eq!(reply.arguments, vec!["2"]);
        assert_eq!(reply.informs.len(), 2);
        assert_eq!(reply.informs[0], vec!["array0", "7148,7149"]);
        assert_eq!(session.state(), SessionState::Synced);
        session.close().await;
    }

    #[tokio::test]
    async fn test_failed_reply_is_not_ok() {
        let endpoint = scripted_server(vec![(
            "?sensor-value input-labelling",
            vec!["!sensor-value fail Unknown\\_sensor"],
        )])
        .await;

        let session = KatcpSession::connect(&endpoint, TIMEOUT).await.unwrap();
        let reply = session
            .request("sensor-value", Some("input-labelling"), TIMEOUT)
            .await
            .unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.arguments, vec!["Unknown sensor"]);
    }

    #[tokio::test]
    async fn test_peer_hangup_fails_pending_request() {
        // Server reads the request and then drops the connection
        let endpoint = scripted_server(vec![("?array-list", vec![])]).await;
        let session = KatcpSession::connect(&endpoint, TIMEOUT).await.unwrap();
        let err = session.request("array-list", None, TIMEOUT).await.unwrap_err();
        assert!(err.is_connection_lost(), "got {err:?}");
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_connect_refused_reports_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = KatcpSession::connect(&Endpoint::new("127.0.0.1", port), TIMEOUT).await;
        assert!(result.is_err());
    }

    fn request_mid(line: &str) -> String {
        let open = line.find('[').unwrap();
        let close = line.find(']').unwrap();
        line[open + 1..close].to_string()
    }

    #[tokio::test]
    async fn test_late_reply_does_not_complete_next_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            let first = request_mid(&lines.next_line().await.unwrap().unwrap());
            let second = request_mid(&lines.next_line().await.unwrap().unwrap());
            assert_ne!(first, second);
            let answer = format!(
                "#sensor-value[{first}] 1.0 1 stale.sensor nominal OLD\n!sensor-value[{first}] ok 1\n\
                 #sensor-value[{second}] 2.0 1 fresh.sensor nominal NEW\n!sensor-value[{second}] ok 1\n"
            );
            writer.write_all(answer.as_bytes()).await.unwrap();
            // Hold the connection open until the client is done
            let _ = lines.next_line().await;
        });

        let session = KatcpSession::connect(&Endpoint::new("127.0.0.1", port), TIMEOUT)
            .await
            .unwrap();
        let first = session.request("sensor-value", None, Duration::from_millis(200)).await;
        assert!(matches!(first, Err(PollError::Protocol { .. })), "got {first:?}");

        let second = session.request("sensor-value", None, TIMEOUT).await.unwrap();
        assert!(second.ok);
        assert_eq!(second.informs, vec![vec!["2.0", "1", "fresh.sensor", "nominal", "NEW"]]);
        assert!(session.is_connected());
        session.close().await;
    }

    #[tokio::test]
    async fn test_invalid_utf8_value_keeps_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            for _ in 0..2 {
                lines.next_line().await.unwrap().unwrap();
                writer
                    .write_all(b"#sensor-value 1.0 1 fhost00.label nominal caf\xe9\n!sensor-value ok 1\n")
                    .await
                    .unwrap();
            }
            let _ = lines.next_line().await;
        });

        let session = KatcpSession::connect(&Endpoint::new("127.0.0.1", port), TIMEOUT)
            .await
            .unwrap();
        let reply = session.request("sensor-value", None, TIMEOUT).await.unwrap();
        assert_eq!(reply.informs[0][4], "caf\u{FFFD}");
        assert!(session.is_connected());

        let again = session.request("sensor-value", None, TIMEOUT).await.unwrap();
        assert_eq!(again.informs.len(), 1);
        session.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let endpoint = scripted_server(vec![]).await;
        let session = KatcpSession::connect(&endpoint, TIMEOUT).await.unwrap();
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        let err = session.request("array-list", None, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, PollError::Disconnected(_)));
    }
}

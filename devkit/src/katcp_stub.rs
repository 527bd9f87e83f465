/*!
Mock KATCP server for tests without a correlator

Listens on a loopback port, greets every client with `#version-connect`,
and answers each `?request` with the lines scripted for it. A message id
on the request (`?name[7]`) is echoed on the scripted lines of the same
name. Every request received is recorded so tests can assert on what the poller asked for.
*/

use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const GREETING: &str = "#version-connect katcp-protocol 5.0-IM\n";

#[derive(Default)]
struct ServerState {
    /// `"name"` or `"name arg"` -> lines sent back, reply last
    scripts: HashMap<String, Vec<String>>,
    requests: Vec<String>,
    connections: usize,
    clients: Vec<JoinHandle<()>>,
}

impl ServerState {
    fn answer(&self, name: &str, arg: Option<&str>) -> Vec<String> {
        let keyed = arg.and_then(|a| self.scripts.get(&format!("{name} {a}")));
        match keyed.or_else(|| self.scripts.get(name)) {
            Some(lines) => lines.clone(),
            None => vec![format!("!{name} fail unknown-request")],
        }
    }
}

pub struct MockKatcpServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    accept_task: Option<JoinHandle<()>>,
}

impl MockKatcpServer {
    /// Bind `127.0.0.1:0` and start accepting clients
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(ServerState::default()));

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                log::debug!("🔌 [MOCK] {} connected to {}", peer, addr);
                let mut state = accept_state.lock().unwrap();
                state.connections += 1;
                state.clients.push(tokio::spawn(serve_client(stream, accept_state.clone())));
            }
        });

        log::info!("🛰️ [MOCK] KATCP server listening on {}", addr);
        Ok(Self {
            addr,
            state,
            accept_task: Some(accept_task),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `127.0.0.1:<port>`
    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Script the answer to `request`, given as `"name"` (any argument) or
    /// `"name arg"`. The last line should be the `!name` reply.
    pub fn on_request(&self, request: &str, lines: Vec<String>) -> &Self {
        self.state.lock().unwrap().scripts.insert(request.to_string(), lines);
        self
    }

    /// Raw request lines received so far, in order
    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }

    /// How many received requests were `?name`
    pub fn request_count(&self, name: &str) -> usize {
        let prefix = format!("?{name}");
        self.requests()
            .iter()
            .filter(|r| {
                let head = r.split_whitespace().next().unwrap_or_default();
                head.split('[').next() == Some(prefix.as_str())
            })
            .count()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    /// Hang up on every connected client; new clients are still accepted
    pub fn disconnect_clients(&self) {
        let clients: Vec<_> = self.state.lock().unwrap().clients.drain(..).collect();
        log::info!("✂️ [MOCK] Dropping {} client(s) on {}", clients.len(), self.addr);
        for client in clients {
            client.abort();
        }
    }

    /// Close the listener and every client; later connects are refused
    pub fn shutdown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.disconnect_clients();
    }
}

impl Drop for MockKatcpServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve_client(stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let (reader, mut writer) = stream.into_split();
    if writer.write_all(GREETING.as_bytes()).await.is_err() {
        return;
    }

    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        let Some(request) = line.strip_prefix('?') else {
            continue;
        };
        let mut parts = request.split_whitespace();
        let head = parts.next().unwrap_or_default();
        let (name, mid) = match head.split_once('[') {
            Some((name, rest)) => (name.to_string(), rest.strip_suffix(']').map(str::to_string)),
            None => (head.to_string(), None),
        };
        let arg = parts.next();

        let answer = {
            let mut state = state.lock().unwrap();
            state.requests.push(line.clone());
            state.answer(&name, arg)
        };

        for out in answer {
            let out = match &mid {
                Some(mid) => tag_mid(&out, &name, mid),
                None => out,
            };
            if writer.write_all(out.as_bytes()).await.is_err() || writer.write_all(b"\n").await.is_err() {
                return;
            }
        }
    }
}

/// `#name args` -> `#name[mid] args` for lines of the requested name
fn tag_mid(line: &str, name: &str, mid: &str) -> String {
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    if head.len() < 2 || &head[1..] != name {
        return line.to_string();
    }
    let mut tagged = format!("{head}[{mid}]");
    if !rest.is_empty() {
        tagged.push(' ');
        tagged.push_str(rest);
    }
    tagged
}

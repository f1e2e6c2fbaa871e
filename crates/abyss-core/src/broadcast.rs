//! WebSocket telemetry broadcaster.
//!
//! Owns the subscriber set. An accept thread performs handshakes and greets
//! each client; `broadcast` serializes the frame once and fans it out under
//! the client mutex, servicing any inbound control messages on the way.
//! Client sockets are non-blocking after the handshake, so a stalled
//! subscriber can never hold up the frame cadence; loopback peers are the
//! only expected audience.

use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use tungstenite::{Message, WebSocket};

use crate::telemetry::TelemetryFrame;

/// Version of the hello control message, independent of the frame schema.
pub const HELLO_SCHEMA: u32 = 2;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("WebSocket server failed to listen on 127.0.0.1:{port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

type Client = WebSocket<TcpStream>;

pub struct WsBroadcaster {
    port: u16,
    bound_port: Option<u16>,
    clients: Arc<Mutex<Vec<Client>>>,
    frames_sent: AtomicU64,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WsBroadcaster {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bound_port: None,
            clients: Arc::new(Mutex::new(Vec::new())),
            frames_sent: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
        }
    }

    /// Bind the loopback listener and spawn the accept thread.
    pub fn start(&mut self) -> Result<(), BroadcastError> {
        let listener = TcpListener::bind(("127.0.0.1", self.port)).map_err(|source| {
            BroadcastError::Listen {
                port: self.port,
                source,
            }
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| BroadcastError::Listen {
                port: self.port,
                source,
            })?;
        self.bound_port = listener.local_addr().ok().map(|addr| addr.port());

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let clients = Arc::clone(&self.clients);
        *self.accept_thread.lock().expect("accept thread slot") =
            Some(thread::spawn(move || accept_loop(listener, running, clients)));

        info!(
            port = self.bound_port.unwrap_or(self.port),
            "WebSocket server listening on loopback"
        );
        Ok(())
    }

    /// The port actually bound, once started. Differs from the configured
    /// port only when that was 0.
    pub fn port(&self) -> Option<u16> {
        self.bound_port
    }

    /// Send one frame to every connected client, dropping any that fail.
    pub fn broadcast(&self, frame: &TelemetryFrame) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let payload = frame.to_json();
        let mut clients = self.clients.lock().expect("client set lock");
        clients.retain_mut(|client| service_client(client, &payload));
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().expect("client set lock").len()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop accepting, close every client and join the accept thread.
    /// Idempotent; also runs on drop.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(thread) = self.accept_thread.lock().expect("accept thread slot").take() {
            let _ = thread.join();
        }
        let mut clients = self.clients.lock().expect("client set lock");
        for client in clients.iter_mut() {
            let _ = client.close(None);
        }
        clients.clear();
        info!("WebSocket server stopped");
    }
}

impl Drop for WsBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: TcpListener, running: Arc<AtomicBool>, clients: Arc<Mutex<Vec<Client>>>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Some(client) = attach_client(stream) {
                    info!(%peer, "client connected");
                    clients.lock().expect("client set lock").push(client);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!(%err, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Handshake, greet, and switch the socket to non-blocking.
fn attach_client(stream: TcpStream) -> Option<Client> {
    if let Err(err) = stream.set_nonblocking(false) {
        warn!(%err, "client socket setup failed");
        return None;
    }

    let mut client = match tungstenite::accept(stream) {
        Ok(client) => client,
        Err(err) => {
            warn!(%err, "WebSocket handshake failed");
            return None;
        }
    };

    let hello = json!({
        "type": "hello",
        "schema": HELLO_SCHEMA,
        "server": "abyss-sniffer",
        "version": env!("CARGO_PKG_VERSION"),
    });
    if let Err(err) = client.send(Message::text(hello.to_string())) {
        warn!(%err, "hello send failed");
        return None;
    }

    if let Err(err) = client.get_ref().set_nonblocking(true) {
        warn!(%err, "client socket setup failed");
        return None;
    }

    Some(client)
}

/// Drain inbound control messages, then deliver the frame. Returns `false`
/// when the client should be dropped.
fn service_client(client: &mut Client, payload: &str) -> bool {
    loop {
        match client.read() {
            Ok(msg) if msg.is_close() => return false,
            Ok(msg) => {
                if let Some(reply) = control_reply(&msg) {
                    if client.send(Message::text(reply)).is_err() {
                        return false;
                    }
                }
            }
            Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => break,
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                return false;
            }
            Err(err) => {
                debug!(%err, "client read error");
                return false;
            }
        }
    }

    match client.send(Message::text(payload.to_string())) {
        Ok(()) => true,
        // The frame is queued inside tungstenite; a later send flushes it.
        Err(tungstenite::Error::Io(err)) if err.kind() == ErrorKind::WouldBlock => true,
        Err(err) => {
            debug!(%err, "client send error");
            false
        }
    }
}

/// `{"type":"ping","t":X}` gets `{"type":"pong","t":X}`; everything else is
/// silently ignored.
fn control_reply(msg: &Message) -> Option<String> {
    if !msg.is_text() {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(msg.to_text().ok()?).ok()?;
    if value.get("type")?.as_str()? != "ping" {
        return None;
    }
    let t = value.get("t").cloned().unwrap_or_else(|| json!(0.0));
    Some(json!({ "type": "pong", "t": t }).to_string())
}

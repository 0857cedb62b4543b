//! Client connections and command dispatch.
//!
//! The network side (tokio) only frames bytes and applies admission; every
//! admitted packet is handled on the worker pool. Outbound frames go through
//! a per-client queue drained by that client's writer task, so frames queued
//! from one thread reach the client in the order they were queued.

mod dispatch;

pub use dispatch::{Callback, CallbackHandle, Handler, HandlerHandle};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pool::WorkerPool;
use crate::task::registry::ClientId;
use crate::transport::protocol::{self, Command, PayloadReader, HEADER_LEN};
use crate::transport::{read_frame, write_frame};
use dispatch::Registries;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("client {0} is not connected")]
    UnknownClient(ClientId),

    #[error("client {0} has not completed the handshake")]
    NotHandshaked(ClientId),

    #[error("client {0} connection is closing")]
    Closed(ClientId),
}

struct Client {
    handshaked: bool,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

#[derive(Default)]
struct State {
    next_client: ClientId,
    clients: HashMap<ClientId, Client>,
    dispatch: Registries,
}

struct Inner {
    key: Vec<u8>,
    pool: Arc<WorkerPool>,
    state: Mutex<State>,
}

/// Shared handle to the client table and dispatch registries.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(key: impl Into<Vec<u8>>, pool: Arc<WorkerPool>) -> Self {
        Self {
            inner: Arc::new(Inner {
                key: key.into(),
                pool,
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a one-shot callback for the next frame carrying `command`.
    pub fn add_callback<F>(&self, command: Command, callback: F) -> CallbackHandle
    where
        F: FnOnce(ClientId, &mut PayloadReader<'_>) + Send + 'static,
    {
        self.state().dispatch.add_callback(command, Box::new(callback))
    }

    pub fn remove_callback(&self, handle: CallbackHandle) -> bool {
        self.state().dispatch.remove_callback(handle)
    }

    /// Register a handler fired for every frame carrying `command`.
    pub fn add_handler<F>(&self, command: Command, handler: F) -> HandlerHandle
    where
        F: Fn(ClientId, &mut PayloadReader<'_>) + Send + Sync + 'static,
    {
        self.state().dispatch.add_handler(command, Arc::new(handler))
    }

    pub fn remove_handler(&self, handle: HandlerHandle) -> bool {
        self.state().dispatch.remove_handler(handle)
    }

    /// Queue `frame` for one handshaked client.
    pub fn send(&self, client_id: ClientId, frame: Vec<u8>) -> Result<(), SendError> {
        let state = self.state();
        let client = state
            .clients
            .get(&client_id)
            .ok_or(SendError::UnknownClient(client_id))?;
        if !client.handshaked {
            return Err(SendError::NotHandshaked(client_id));
        }
        client
            .outbound
            .send(frame)
            .map_err(|_| SendError::Closed(client_id))
    }

    pub fn client_count(&self) -> usize {
        self.state().clients.len()
    }

    pub fn is_handshaked(&self, client_id: ClientId) -> bool {
        self.state()
            .clients
            .get(&client_id)
            .is_some_and(|client| client.handshaked)
    }

    /// Add a client whose outbound frames go to `outbound`.
    pub fn connect(&self, outbound: mpsc::UnboundedSender<Vec<u8>>) -> ClientId {
        let mut state = self.state();
        state.next_client += 1;
        let client_id = state.next_client;
        state.clients.insert(
            client_id,
            Client {
                handshaked: false,
                outbound,
            },
        );
        client_id
    }

    pub fn disconnect(&self, client_id: ClientId) {
        if self.state().clients.remove(&client_id).is_some() {
            debug!(client = client_id, "Client removed");
        }
    }

    /// Whether a raw packet from `client_id` may be handled at all.
    ///
    /// Handshaked clients are trusted. Anyone else may only send a
    /// well-formed handshake frame.
    pub fn admit(&self, client_id: ClientId, packet: &[u8]) -> bool {
        if self.is_handshaked(client_id) {
            return true;
        }
        packet.len() >= HEADER_LEN
            && protocol::declared_len(packet) == Some(packet.len())
            && protocol::command_byte(packet) == Some(Command::Handshake as u8)
    }

    /// Apply admission and hand an accepted packet to the worker pool.
    pub fn dispatch(&self, client_id: ClientId, packet: Vec<u8>) {
        if !self.admit(client_id, &packet) {
            debug!(client = client_id, len = packet.len(), "Dropped packet before handshake");
            return;
        }
        let manager = self.clone();
        if let Err(e) = self
            .inner
            .pool
            .execute(move || manager.handle_packet(client_id, &packet))
        {
            warn!(client = client_id, error = %e, "Dropped packet");
        }
    }

    /// Process one admitted packet. Runs on a pool worker.
    pub fn handle_packet(&self, client_id: ClientId, packet: &[u8]) {
        let Some(raw) = protocol::command_byte(packet) else {
            return;
        };
        let Some(command) = Command::from_u8(raw) else {
            debug!(client = client_id, command = raw, "Ignored unknown command");
            return;
        };
        if packet.len() < HEADER_LEN {
            return;
        }
        let payload = &packet[HEADER_LEN..];

        if command == Command::Handshake {
            self.handshake(client_id, &mut PayloadReader::new(payload));
            return;
        }
        if !self.is_handshaked(client_id) {
            debug!(client = client_id, ?command, "Ignored command before handshake");
            return;
        }

        // Run outside the lock: callbacks and handlers may call `send`.
        let (callbacks, handlers) = {
            let mut state = self.state();
            (state.dispatch.take_callbacks(command), state.dispatch.handlers(command))
        };
        debug!(
            client = client_id,
            ?command,
            callbacks = callbacks.len(),
            handlers = handlers.len(),
            "Dispatching"
        );
        for callback in callbacks {
            callback(client_id, &mut PayloadReader::new(payload));
        }
        for handler in handlers {
            handler(client_id, &mut PayloadReader::new(payload));
        }
    }

    fn handshake(&self, client_id: ClientId, reader: &mut PayloadReader<'_>) {
        let ok = reader
            .read_bytes()
            .is_ok_and(|secret| secret == self.inner.key.as_slice());

        let mut state = self.state();
        let Some(client) = state.clients.get_mut(&client_id) else {
            return;
        };
        if ok {
            client.handshaked = true;
            info!(client = client_id, "Handshake accepted");
        } else {
            warn!(client = client_id, "Handshake rejected");
        }
        if client.outbound.send(protocol::handshake_reply(ok)).is_err() {
            debug!(client = client_id, "Handshake reply dropped");
        }
    }
}

/// Handle to a running accept loop.
///
/// Dropping this handle does not stop the listener; use `abort()`.
pub struct ServerHandle {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ServerHandle {
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections. Established connections stay open.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Bind `addr` and accept clients on the current tokio runtime.
pub async fn listen(addr: &str, manager: ConnectionManager, max_frame_size: usize) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "Listening");

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        serve_connection(stream, peer, manager, max_frame_size).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept error");
                    break;
                }
            }
        }
    });

    Ok(ServerHandle { local_addr, handle })
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, manager: ConnectionManager, max_frame_size: usize) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let client_id = manager.connect(tx);
    info!(client = client_id, peer = %peer, "Client connected");

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(client = client_id, error = %e, "Write failed");
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(packet)) => manager.dispatch(client_id, packet),
            Ok(None) => break,
            Err(e) => {
                warn!(client = client_id, error = %e, "Closing connection");
                break;
            }
        }
    }

    // Dropping the client's sender ends the writer once queued frames are flushed.
    manager.disconnect(client_id);
    let _ = writer_task.await;
    info!(client = client_id, "Client disconnected");
}

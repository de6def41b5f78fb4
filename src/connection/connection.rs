//! Connection state, frame writing, and the read loop.

use crate::auth::handshake::{self, Authenticator, HandshakeIo};
use crate::channel::blueprint::{ChannelDef, ChannelRegistry};
use crate::channel::instance::ChannelInstance;
use crate::channel::packet::AnyPacket;
use crate::codec::{WireReader, WireWriter};
use crate::error::{reason, Disconnect, NetError, Result};
use crate::utils::metrics;
use std::any::Any;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Which end of the link this connection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSide {
    Client,
    Server,
}

/// Who the peer turned out to be after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// Handshake did not establish an identity (e.g. insecure client side).
    Unknown,
    /// The peer is a game server with a known identity.
    Server { server_id: String },
    /// The peer is a player. `trusted` is false for insecure-mode claims,
    /// which are spoofable; permission grants must treat them accordingly.
    Player {
        account_id: String,
        display_name: String,
        trusted: bool,
    },
}

type DisconnectHandler = Arc<dyn Fn(&Disconnect) + Send + Sync>;
type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One peer-to-peer duplex link.
///
/// Either fully open (handshake complete, channels bound) or closed; no
/// partial state is observable. Closing is idempotent and emits exactly
/// one disconnect signal.
pub struct Connection {
    side: ConnectionSide,
    debug_mode: bool,
    connected: watch::Sender<bool>,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    channels: RwLock<Vec<Arc<ChannelInstance>>>,
    /// Sidecar context store: logical objects (player, game client, ...)
    /// stashed against this transport link. Not part of the protocol.
    bindings: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    identity: RwLock<PeerIdentity>,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
    disconnect: Mutex<Option<Disconnect>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("side", &self.side)
            .field("debug_mode", &self.debug_mode)
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn new(side: ConnectionSide, debug_mode: bool) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            side,
            debug_mode,
            connected,
            writer: tokio::sync::Mutex::new(None),
            channels: RwLock::new(Vec::new()),
            bindings: RwLock::new(HashMap::new()),
            identity: RwLock::new(PeerIdentity::Unknown),
            disconnect_handlers: Mutex::new(Vec::new()),
            disconnect: Mutex::new(None),
        })
    }

    pub fn side(&self) -> ConnectionSide {
        self.side
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Non-blocking state probe.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Watch receiver that flips to `false` when the connection dies.
    pub(crate) fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// The peer identity established by the handshake.
    pub fn identity(&self) -> PeerIdentity {
        self.identity
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_identity(&self, identity: PeerIdentity) {
        *self
            .identity
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = identity;
    }

    /// The channel instance bound for definition `C`.
    pub fn channel<C: ChannelDef>(&self) -> Result<Arc<ChannelInstance>> {
        let channels = self
            .channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        channels
            .iter()
            .find(|c| c.def_type() == std::any::TypeId::of::<C>())
            .cloned()
            .ok_or(NetError::UnknownChannel(C::NAME))
    }

    /// Stash a sidecar object against this connection.
    pub fn set_binding<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: Arc<T>) {
        self.bindings
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.into(), value);
    }

    /// Fetch a sidecar object by key and type.
    pub fn binding<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        self.bindings
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    /// Remove a sidecar object. Returns whether it existed.
    pub fn remove_binding(&self, key: &str) -> bool {
        self.bindings
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Register a callback for the disconnect signal. If the connection is
    /// already closed, the callback fires immediately with the stored
    /// reason.
    pub fn on_disconnect<F>(&self, f: F)
    where
        F: Fn(&Disconnect) + Send + Sync + 'static,
    {
        let mut handlers = self
            .disconnect_handlers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let already = self
            .disconnect
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match already {
            Some(d) => f(&d),
            None => handlers.push(Arc::new(f)),
        }
    }

    /// The disconnect signal, once the connection has closed.
    pub fn disconnect_reason(&self) -> Option<Disconnect> {
        self.disconnect
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Serialize and write one frame: `i32` registry index, then the
    /// packet's own payload. The writer lock makes the frame atomic with
    /// respect to concurrent senders.
    pub async fn send_frame(&self, index: i32, packet: &dyn AnyPacket) -> Result<()> {
        let mut w = WireWriter::new();
        w.write_i32(index)?;
        packet.write(&mut w)?;
        let frame = w.into_bytes();

        let write_result = {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(NetError::ConnectionClosed)?;
            write_frame(writer, &frame).await
        };

        match write_result {
            Ok(()) => {
                metrics::global().frame_sent(frame.len() as u64);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "frame write failed, closing connection");
                let err = NetError::Io(e);
                self.close(err.to_disconnect()).await;
                Err(err)
            }
        }
    }

    /// Close the connection: idempotent, stops the read loop, releases the
    /// stream, and fires the disconnect signal exactly once.
    pub async fn close(&self, disconnect: Disconnect) {
        {
            let mut slot = self
                .disconnect
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if slot.is_some() {
                return;
            }
            *slot = Some(disconnect.clone());
        }

        self.connected.send_replace(false);

        // Shut down the write side so the peer's read loop sees EOF
        // instead of hanging until its next write.
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let handlers: Vec<DisconnectHandler> = self
            .disconnect_handlers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for handler in &handlers {
            handler(&disconnect);
        }

        metrics::global().connection_closed();
        info!(side = ?self.side, reason = %disconnect, "connection closed");
    }

    fn route(&self, index: i32) -> Option<(Arc<ChannelInstance>, usize)> {
        let channels = self
            .channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for ch in channels.iter() {
            let base = ch.base_index();
            let len = ch.packet_count() as i32;
            if index >= base && index < base + len {
                return Some((ch.clone(), (index - base) as usize));
            }
        }
        None
    }
}

async fn write_frame(writer: &mut BoxWriter, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Run the full open sequence over an already-connected duplex stream and
/// return a live connection.
///
/// Sequence: magic token exchange, authentication handshake, channel
/// bind, then the read loop starts. Any failure returns an error with the
/// stream dropped; a half-open connection is never observable.
///
/// This is the transport-provider entry point: `tcp` and `loopback` call
/// it, and custom transports can too.
pub async fn establish<S>(
    side: ConnectionSide,
    stream: S,
    authenticator: &dyn Authenticator,
    channels: &ChannelRegistry,
    debug_mode: bool,
) -> Result<Arc<Connection>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    metrics::global().handshake_attempt();

    let (r, w) = tokio::io::split(stream);
    let mut reader: BoxReader = Box::new(r);
    let mut writer: BoxWriter = Box::new(w);

    handshake::exchange_magic(&mut reader, &mut writer).await?;

    let outcome = {
        let mut io = HandshakeIo::new(&mut reader, &mut writer);
        match authenticator.authenticate(&mut io).await {
            Ok(outcome) => outcome,
            Err(e) => {
                metrics::global().handshake_failed();
                return Err(e);
            }
        }
    };

    let conn = Connection::new(side, debug_mode);
    conn.set_identity(outcome.peer);

    let instances = channels.bind(&conn);
    *conn
        .channels
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = instances;

    *conn.writer.lock().await = Some(writer);
    conn.connected.send_replace(true);

    metrics::global().handshake_success();
    metrics::global().connection_established();
    debug!(side = ?side, "connection established, starting read loop");

    tokio::spawn(read_loop(conn.clone(), reader));
    Ok(conn)
}

/// Decode `(index, payload)` frames until the stream dies or the
/// connection closes. Dispatch is sequential per connection.
async fn read_loop(conn: Arc<Connection>, mut reader: BoxReader) {
    loop {
        if !conn.is_connected() {
            break;
        }

        let mut r = WireReader::new(&mut *reader);

        let index = match r.read_i32().await {
            Ok(i) => i,
            Err(NetError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                // Orderly EOF between frames.
                conn.close(Disconnect::new(reason::CLOSED)).await;
                break;
            }
            Err(e) => {
                warn!(error = %e, "read loop failed reading frame index");
                conn.close(e.to_disconnect()).await;
                break;
            }
        };

        // Without an outer length prefix an unknown index leaves the
        // stream position undefined, so this is unrecoverable.
        let Some((channel, local)) = conn.route(index) else {
            metrics::global().desync_error();
            error!(index, "frame carries unknown packet index");
            conn.close(NetError::UnknownPacketIndex(index).to_disconnect())
                .await;
            break;
        };

        let Some(mut packet) = channel.instantiate(local) else {
            metrics::global().desync_error();
            error!(index, "template missing for routed packet index");
            conn.close(NetError::UnknownPacketIndex(index).to_disconnect())
                .await;
            break;
        };

        if let Err(e) = packet.read(&mut r).await {
            warn!(error = %e, channel = channel.name(), "payload parse failed");
            conn.close(e.to_disconnect()).await;
            break;
        }

        metrics::global().frame_received();
        trace!(index, channel = channel.name(), "frame dispatched");
        channel.dispatch(&conn, packet);
    }
}

//! TCP transport provider.

use crate::auth::handshake::Authenticator;
use crate::channel::blueprint::ChannelRegistry;
use crate::config::ConnectionConfig;
use crate::connection::{establish, Connection, ConnectionSide};
use crate::error::{reason, NetError, Result};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, instrument};

/// Connect to `addr` and run the full open sequence as the client side.
///
/// Fails by dropping the socket and returning the error — callers decide
/// whether to retry; this layer never does.
#[instrument(skip(registry, authenticator, config))]
pub async fn connect(
    addr: &str,
    registry: &ChannelRegistry,
    authenticator: &dyn Authenticator,
    config: &ConnectionConfig,
) -> Result<Arc<Connection>> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| NetError::Transport(format!("connect {addr}: {e}")))?;
    stream.set_nodelay(true).ok();

    let opened = tokio::time::timeout(
        config.handshake_timeout,
        establish(
            ConnectionSide::Client,
            stream,
            authenticator,
            registry,
            config.debug_mode,
        ),
    )
    .await;

    match opened {
        Ok(Ok(conn)) => {
            info!(peer = addr, "outbound connection open");
            Ok(conn)
        }
        Ok(Err(e)) => {
            error!(peer = addr, reason = reason::CONNECT_ERROR, error = %e, "connect failed");
            Err(e)
        }
        Err(_) => {
            error!(peer = addr, reason = reason::CONNECT_ERROR, "handshake timed out");
            Err(NetError::Handshake("handshake timed out".into()))
        }
    }
}

/// Accepting side of the TCP transport.
///
/// Each accepted socket runs the full open sequence as the server side
/// before it is handed out; a failed handshake only loses that one socket.
pub struct ConnectionListener {
    inner: TcpListener,
    registry: Arc<ChannelRegistry>,
    authenticator: Arc<dyn Authenticator>,
    config: ConnectionConfig,
}

impl ConnectionListener {
    /// Bind the listener. The registry and authenticator are shared by all
    /// accepted connections.
    pub async fn bind(
        addr: &str,
        registry: Arc<ChannelRegistry>,
        authenticator: Arc<dyn Authenticator>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|e| NetError::Transport(format!("bind {addr}: {e}")))?;
        info!(address = addr, "listening");
        Ok(Self {
            inner,
            registry,
            authenticator,
            config,
        })
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.inner
            .local_addr()
            .map_err(|e| NetError::Transport(format!("local addr: {e}")))
    }

    /// Accept one socket and run it through the open sequence.
    pub async fn accept(&self) -> Result<Arc<Connection>> {
        let (stream, peer) = self
            .inner
            .accept()
            .await
            .map_err(|e| NetError::Transport(format!("accept: {e}")))?;
        stream.set_nodelay(true).ok();

        let opened = tokio::time::timeout(
            self.config.handshake_timeout,
            establish(
                ConnectionSide::Server,
                stream,
                self.authenticator.as_ref(),
                &self.registry,
                self.config.debug_mode,
            ),
        )
        .await;

        match opened {
            Ok(Ok(conn)) => {
                info!(peer = %peer, "inbound connection open");
                Ok(conn)
            }
            Ok(Err(e)) => {
                error!(peer = %peer, reason = reason::CONNECT_ERROR, error = %e, "inbound handshake failed");
                Err(e)
            }
            Err(_) => {
                error!(peer = %peer, reason = reason::CONNECT_ERROR, "inbound handshake timed out");
                Err(NetError::Handshake("handshake timed out".into()))
            }
        }
    }
}

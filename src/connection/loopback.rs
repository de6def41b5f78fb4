//! In-process loopback transport for integrated client/server pairs.
//!
//! The backing transport is a bounded in-memory duplex with blocking
//! reads and a closed flag (`tokio::io::duplex`), so shutdown behaves the
//! same way it does for a real socket: dropping one end EOFs the other.
//!
//! Both ends still run the full open sequence — magic exchange and
//! authentication handshake — exactly like a network connection.

use crate::auth::handshake::Authenticator;
use crate::channel::blueprint::ChannelRegistry;
use crate::config::ConnectionConfig;
use crate::connection::{establish, Connection, ConnectionSide};
use crate::error::{reason, Disconnect, Result};
use std::sync::Arc;
use tracing::{error, info};

/// Open a connected client/server pair inside this process.
///
/// The two sides may use distinct channel registries (they usually share
/// one) but must define the same packet index space. Both handshakes run
/// concurrently; if either side fails, the surviving side is closed and
/// the error is returned.
pub async fn pair(
    client_registry: &ChannelRegistry,
    server_registry: &ChannelRegistry,
    client_auth: &dyn Authenticator,
    server_auth: &dyn Authenticator,
    config: &ConnectionConfig,
) -> Result<(Arc<Connection>, Arc<Connection>)> {
    let (client_stream, server_stream) = tokio::io::duplex(config.loopback_buffer);

    let client_fut = establish(
        ConnectionSide::Client,
        client_stream,
        client_auth,
        client_registry,
        config.debug_mode,
    );
    let server_fut = establish(
        ConnectionSide::Server,
        server_stream,
        server_auth,
        server_registry,
        config.debug_mode,
    );

    match tokio::join!(client_fut, server_fut) {
        (Ok(client), Ok(server)) => {
            info!("loopback pair open");
            Ok((client, server))
        }
        (Ok(client), Err(e)) => {
            error!(reason = reason::CONNECT_ERROR, error = %e, "loopback server side failed");
            client.close(Disconnect::new(reason::CONNECT_ERROR)).await;
            Err(e)
        }
        (Err(e), Ok(server)) => {
            error!(reason = reason::CONNECT_ERROR, error = %e, "loopback client side failed");
            server.close(Disconnect::new(reason::CONNECT_ERROR)).await;
            Err(e)
        }
        (Err(e), Err(server_err)) => {
            error!(
                reason = reason::CONNECT_ERROR,
                client_error = %e,
                server_error = %server_err,
                "loopback pair failed on both sides"
            );
            Err(e)
        }
    }
}

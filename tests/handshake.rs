//! End-to-end handshake behavior over in-process transports: magic
//! mismatch, insecure round trip, secure acceptance and rejection.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use common::{test_config, test_credentials, FakeIdentity, PingChannel};
use phoenix_net::auth::handshake::{
    deny, AuthOutcome, Authenticator, HandshakeIo, InsecureClientAuth, InsecureServerAuth,
    SecureClientAuth, SecureServerAuth, SessionContext,
};
use phoenix_net::auth::CredentialStore;
use phoenix_net::channel::ChannelRegistry;
use phoenix_net::connection::{establish, loopback, ConnectionSide, PeerIdentity};
use phoenix_net::error::NetError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

fn test_session() -> SessionContext {
    SessionContext {
        account_id: "acc1".into(),
        display_name: "Disp".into(),
        session_token: Some("session-token".into()),
        token_expires_at: 0,
        game_id: "game-1".into(),
    }
}

/// Records whether mode selection was ever reached.
struct TracingAuth {
    invoked: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl Authenticator for TracingAuth {
    async fn authenticate(&self, _io: &mut HandshakeIo<'_>) -> phoenix_net::Result<AuthOutcome> {
        self.invoked.store(true, Ordering::SeqCst);
        Ok(AuthOutcome {
            peer: PeerIdentity::Unknown,
        })
    }
}

#[tokio::test]
async fn magic_mismatch_closes_before_mode_selection() {
    let registry = ChannelRegistry::new();
    registry.register::<PingChannel>().unwrap();

    let (ours, mut theirs) = tokio::io::duplex(64 * 1024);

    // Hostile peer: wrong first bytes on the wire.
    let peer = tokio::spawn(async move {
        theirs.write_all(b"XXNOTTHEPROTOCOL").await.unwrap();
        theirs.flush().await.unwrap();
        // Keep the stream open long enough for the other side to fail.
        tokio::time::sleep(Duration::from_millis(500)).await;
    });

    let invoked = Arc::new(AtomicBool::new(false));
    let auth = TracingAuth {
        invoked: invoked.clone(),
    };

    let result = establish(ConnectionSide::Client, ours, &auth, &registry, false).await;

    assert!(matches!(result, Err(NetError::ProtocolDesync(_))));
    assert!(
        !invoked.load(Ordering::SeqCst),
        "authentication must never run after a magic mismatch"
    );
    peer.await.unwrap();
}

#[tokio::test]
async fn insecure_roundtrip_establishes_untrusted_player() {
    let registry = ChannelRegistry::new();
    registry.register::<PingChannel>().unwrap();

    let client_auth = InsecureClientAuth::new("acc1", "Disp");
    let server_auth = InsecureServerAuth::new();
    let (client, server) = loopback::pair(
        &registry,
        &registry,
        &client_auth,
        &server_auth,
        &test_config(),
    )
    .await
    .unwrap();

    assert!(client.is_connected());
    assert!(server.is_connected());

    // Server sees the claimed identity, explicitly untrusted.
    assert_eq!(
        server.identity(),
        PeerIdentity::Player {
            account_id: "acc1".into(),
            display_name: "Disp".into(),
            trusted: false,
        }
    );

    // No disconnect fired on either side.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.disconnect_reason().is_none());
    assert!(server.disconnect_reason().is_none());
}

#[tokio::test]
async fn insecure_rejection_carries_reason_to_client() {
    let registry = ChannelRegistry::new();
    registry.register::<PingChannel>().unwrap();

    let client_auth = InsecureClientAuth::new("banned", "Disp");
    let server_auth =
        InsecureServerAuth::with_acceptor(Arc::new(|account_id, _| account_id != "banned"));

    let result = loopback::pair(
        &registry,
        &registry,
        &client_auth,
        &server_auth,
        &test_config(),
    )
    .await;

    match result {
        Err(NetError::AuthRejected(d)) => {
            assert_eq!(d.reason, deny::LOGIN_REJECTED);
            assert!(d.args.is_empty());
        }
        other => panic!("expected auth rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn secure_handshake_accepts_valid_secret() {
    let registry = ChannelRegistry::new();
    registry.register::<PingChannel>().unwrap();

    let identity = Arc::new(FakeIdentity::accepting());
    let credentials = CredentialStore::new(test_credentials(vec![]));

    let client_auth = SecureClientAuth::new(identity.clone(), test_session(), "srv-1");
    let server_auth = SecureServerAuth::new(identity, credentials);

    let (client, server) = loopback::pair(
        &registry,
        &registry,
        &client_auth,
        &server_auth,
        &test_config(),
    )
    .await
    .unwrap();

    assert_eq!(
        server.identity(),
        PeerIdentity::Player {
            account_id: "acc1".into(),
            display_name: "Disp".into(),
            trusted: true,
        }
    );
    assert_eq!(
        client.identity(),
        PeerIdentity::Server {
            server_id: "srv-1".into()
        }
    );
}

#[tokio::test]
async fn secure_rejection_surfaces_structured_reason_unchanged() {
    let registry = ChannelRegistry::new();
    registry.register::<PingChannel>().unwrap();

    let identity = Arc::new(FakeIdentity::rejecting());
    let credentials = CredentialStore::new(test_credentials(vec![]));

    let client_auth = SecureClientAuth::new(identity.clone(), test_session(), "srv-1");
    let server_auth = SecureServerAuth::new(identity, credentials);

    let result = loopback::pair(
        &registry,
        &registry,
        &client_auth,
        &server_auth,
        &test_config(),
    )
    .await;

    match result {
        Err(NetError::AuthRejected(d)) => {
            // The reason key the server wrote, with zero args, unchanged.
            assert_eq!(d.reason, deny::JOIN_SECRET_REJECTED);
            assert_eq!(d.args.len(), 0);
        }
        other => panic!("expected auth rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn close_propagates_to_peer_as_disconnect() {
    let registry = ChannelRegistry::new();
    registry.register::<PingChannel>().unwrap();

    let client_auth = InsecureClientAuth::new("acc1", "Disp");
    let server_auth = InsecureServerAuth::new();
    let (client, server) = loopback::pair(
        &registry,
        &registry,
        &client_auth,
        &server_auth,
        &test_config(),
    )
    .await
    .unwrap();

    let server_saw_disconnect = Arc::new(AtomicBool::new(false));
    let flag = server_saw_disconnect.clone();
    server.on_disconnect(move |_| flag.store(true, Ordering::SeqCst));

    client
        .close(phoenix_net::error::Disconnect::new("closed"))
        .await;
    assert!(!client.is_connected());

    // The server's read loop observes EOF and closes its side.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!server.is_connected());
    assert!(server_saw_disconnect.load(Ordering::SeqCst));
    assert!(server.disconnect_reason().is_some());
}

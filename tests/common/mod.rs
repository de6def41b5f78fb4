//! Shared fixtures for the integration suites.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use phoenix_net::auth::{
    AuthenticateResponse, Certificate, IdentityService, JoinSecret, PlayerProfile,
    ServerCredentials,
};
use phoenix_net::channel::{ChannelBuilder, ChannelDef, Packet};
use phoenix_net::codec::{WireReader, WireWriter};
use phoenix_net::config::ConnectionConfig;
use phoenix_net::error::{NetError, Result};

/// Round-trip test packet: a request with a sequence number.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Ping {
    pub seq: i32,
}

#[async_trait]
impl Packet for Ping {
    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_i32(self.seq)
    }

    async fn read(&mut self, r: &mut WireReader<'_>) -> Result<()> {
        self.seq = r.read_i32().await?;
        Ok(())
    }
}

/// Round-trip test packet: the reply.
#[derive(Default, Debug, PartialEq, Eq, Clone)]
pub struct Pong {
    pub seq: i32,
}

#[async_trait]
impl Packet for Pong {
    fn write(&self, w: &mut WireWriter) -> Result<()> {
        w.write_i32(self.seq)
    }

    async fn read(&mut self, r: &mut WireReader<'_>) -> Result<()> {
        self.seq = r.read_i32().await?;
        Ok(())
    }
}

/// Test channel carrying [`Ping`] and [`Pong`].
pub struct PingChannel;

impl ChannelDef for PingChannel {
    const NAME: &'static str = "ping";

    fn make_registry(builder: &mut ChannelBuilder) {
        builder.register_packet::<Ping>().register_packet::<Pong>();
    }
}

/// Connection config tuned for tests: tight timeouts, debug off.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout: std::time::Duration::from_secs(5),
        ..ConnectionConfig::default()
    }
}

/// Scripted identity service: one valid join secret, fixed profile.
pub struct FakeIdentity {
    pub valid_secret: String,
    pub profile: PlayerProfile,
    /// When set, `authenticate_player` rejects everything.
    pub reject_all: bool,
}

impl FakeIdentity {
    pub fn accepting() -> Self {
        Self {
            valid_secret: "join-secret-1".into(),
            profile: PlayerProfile {
                account_id: "acc1".into(),
                display_name: "Disp".into(),
            },
            reject_all: false,
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject_all: true,
            ..Self::accepting()
        }
    }
}

#[async_trait]
impl IdentityService for FakeIdentity {
    async fn authenticate(&self, _login: &serde_json::Value) -> Result<AuthenticateResponse> {
        Ok(AuthenticateResponse::Success {
            account_id: self.profile.account_id.clone(),
            display_name: self.profile.display_name.clone(),
            session_token: "session-token".into(),
        })
    }

    async fn join_server(&self, _server_id: &str, _bearer: &str) -> Result<JoinSecret> {
        Ok(JoinSecret {
            secret: self.valid_secret.clone(),
        })
    }

    async fn authenticate_player(&self, secret: &str, _bearer: &str) -> Result<PlayerProfile> {
        if self.reject_all || secret != self.valid_secret {
            return Err(NetError::IdentityService("unknown join secret".into()));
        }
        Ok(self.profile.clone())
    }

    async fn refresh_server(
        &self,
        addresses: &[String],
        _bearer: &str,
    ) -> Result<ServerCredentials> {
        Ok(test_credentials(addresses.to_vec()))
    }

    async fn refresh_token(&self, _bearer: &str) -> Result<String> {
        Ok("refreshed-token".into())
    }

    async fn pull_current_identity(&self, _bearer: &str) -> Result<PlayerProfile> {
        Ok(self.profile.clone())
    }
}

/// Server credentials far from expiry.
pub fn test_credentials(addresses: Vec<String>) -> ServerCredentials {
    let now = phoenix_net::auth::unix_now();
    ServerCredentials {
        identity: "srv-1".into(),
        token: "server-token".into(),
        token_issued_at: now,
        certificate: Certificate {
            game_id: "game-1".into(),
            server_id: "srv-1".into(),
            addresses,
            last_update: now,
            expiry: now + 90 * 24 * 60 * 60,
            public_key: "pub-key".into(),
            private_key: Some("priv-key".into()),
        },
    }
}

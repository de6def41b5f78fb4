//! Identity service interface.
//!
//! The identity service is an external collaborator: an HTTP JSON API
//! with bearer-token auth that issues session tokens and certificates and
//! resolves one-time join secrets to player identities. This module
//! defines it as a typed async trait — everything above the handshake
//! depends on the trait, so tests and embedded deployments can supply
//! their own implementation — plus the HTTP client implementation.

use crate::auth::certificate::{unix_now, Certificate, ServerCredentials};
use crate::error::{Disconnect, NetError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// A player identity as the identity service reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerProfile {
    #[serde(rename = "accountID")]
    pub account_id: String,

    #[serde(rename = "displayName")]
    pub display_name: String,
}

/// One-time secret authorizing a single server join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSecret {
    pub secret: String,
}

/// Login outcome envelope. `deferred` drives a retry loop with the
/// supplied data-request key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum AuthenticateResponse {
    Success {
        #[serde(rename = "accountID")]
        account_id: String,
        #[serde(rename = "displayName")]
        display_name: String,
        #[serde(rename = "sessionToken")]
        session_token: String,
    },
    Deferred {
        #[serde(rename = "dataRequestKey")]
        data_request_key: String,
    },
    Failure {
        error: String,
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

/// A completed login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    pub account_id: String,
    pub display_name: String,
    pub session_token: String,
}

/// The identity service surface this crate consumes.
#[async_trait]
pub trait IdentityService: Send + Sync {
    /// `POST /auth/authenticate` — exchange a login payload for a session.
    async fn authenticate(&self, login: &serde_json::Value) -> Result<AuthenticateResponse>;

    /// `POST /auth/joinserver` — obtain a one-time join secret for
    /// `server_id`, authorized by the client's session token.
    async fn join_server(&self, server_id: &str, bearer: &str) -> Result<JoinSecret>;

    /// `POST /authenticateplayer` — resolve a presented join secret to a
    /// player, authorized by the server's token.
    async fn authenticate_player(&self, secret: &str, bearer: &str) -> Result<PlayerProfile>;

    /// `POST /servers/refreshserver` — re-issue the server's token and
    /// certificate for the given address list.
    async fn refresh_server(&self, addresses: &[String], bearer: &str)
        -> Result<ServerCredentials>;

    /// `GET /api/tokens/refresh` — re-issue the caller's session token.
    async fn refresh_token(&self, bearer: &str) -> Result<String>;

    /// `GET /api/identities/pullcurrent` — the identity behind a token.
    async fn pull_current_identity(&self, bearer: &str) -> Result<PlayerProfile>;
}

/// Drive a login to completion, following `deferred` responses with the
/// returned data-request key.
///
/// A `failure` response maps to [`NetError::AuthRejected`] carrying the
/// service's error key and message unchanged.
#[instrument(skip(identity, payload))]
pub async fn login_with_retry(
    identity: &dyn IdentityService,
    mut payload: serde_json::Value,
    max_attempts: u32,
) -> Result<LoginSuccess> {
    for attempt in 0..max_attempts {
        match identity.authenticate(&payload).await? {
            AuthenticateResponse::Success {
                account_id,
                display_name,
                session_token,
            } => {
                debug!(account_id = %account_id, "login complete");
                return Ok(LoginSuccess {
                    account_id,
                    display_name,
                    session_token,
                });
            }
            AuthenticateResponse::Deferred { data_request_key } => {
                debug!(attempt, "login deferred, retrying with data request key");
                if let Some(obj) = payload.as_object_mut() {
                    obj.insert(
                        "dataRequestKey".into(),
                        serde_json::Value::String(data_request_key),
                    );
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            AuthenticateResponse::Failure {
                error,
                error_message,
            } => {
                warn!(error = %error, "login rejected");
                return Err(NetError::AuthRejected(Disconnect::with_args(
                    error,
                    vec![error_message],
                )));
            }
        }
    }
    Err(NetError::Handshake(format!(
        "login still deferred after {max_attempts} attempts"
    )))
}

#[derive(Serialize)]
struct JoinServerRequest<'a> {
    #[serde(rename = "serverID")]
    server_id: &'a str,
}

#[derive(Serialize)]
struct AuthenticatePlayerRequest<'a> {
    secret: &'a str,
}

#[derive(Serialize)]
struct RefreshServerRequest<'a> {
    addresses: &'a [String],
}

#[derive(Deserialize)]
struct RefreshServerResponse {
    identity: String,
    token: String,
    certificate: Certificate,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

/// HTTP implementation of [`IdentityService`].
pub struct HttpIdentityService {
    base: String,
    http: reqwest::Client,
}

impl HttpIdentityService {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Use a preconfigured client (timeouts, proxies, pinned roots).
    pub fn with_client(base: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base: base.into(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base.trim_end_matches('/'), path)
    }

    async fn post_json<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<T> {
        let mut req = self.http.post(self.url(path)).json(body);
        if let Some(token) = bearer {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| NetError::IdentityService(format!("{path}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NetError::IdentityService(format!("{path}: HTTP {status}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| NetError::IdentityService(format!("{path}: bad response body: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, bearer: &str) -> Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .bearer_auth(bearer)
            .send()
            .await
            .map_err(|e| NetError::IdentityService(format!("{path}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(NetError::IdentityService(format!("{path}: HTTP {status}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| NetError::IdentityService(format!("{path}: bad response body: {e}")))
    }
}

#[async_trait]
impl IdentityService for HttpIdentityService {
    async fn authenticate(&self, login: &serde_json::Value) -> Result<AuthenticateResponse> {
        self.post_json("/auth/authenticate", None, login).await
    }

    async fn join_server(&self, server_id: &str, bearer: &str) -> Result<JoinSecret> {
        self.post_json(
            "/auth/joinserver",
            Some(bearer),
            &JoinServerRequest { server_id },
        )
        .await
    }

    async fn authenticate_player(&self, secret: &str, bearer: &str) -> Result<PlayerProfile> {
        self.post_json(
            "/authenticateplayer",
            Some(bearer),
            &AuthenticatePlayerRequest { secret },
        )
        .await
    }

    async fn refresh_server(
        &self,
        addresses: &[String],
        bearer: &str,
    ) -> Result<ServerCredentials> {
        let resp: RefreshServerResponse = self
            .post_json(
                "/servers/refreshserver",
                Some(bearer),
                &RefreshServerRequest { addresses },
            )
            .await?;
        Ok(ServerCredentials {
            identity: resp.identity,
            token: resp.token,
            token_issued_at: unix_now(),
            certificate: resp.certificate,
        })
    }

    async fn refresh_token(&self, bearer: &str) -> Result<String> {
        let resp: TokenResponse = self.get_json("/api/tokens/refresh", bearer).await?;
        Ok(resp.token)
    }

    async fn pull_current_identity(&self, bearer: &str) -> Result<PlayerProfile> {
        self.get_json("/api/identities/pullcurrent", bearer).await
    }
}

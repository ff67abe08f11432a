//! HTTP/JSON [`Transport`] for the remote storage service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::credential::Credential;
use super::error::AuthError;
use super::pkce::{CodeChallenge, CodeVerifier};
use super::transport::{
    ClientContext, DeviceAuthorization, DeviceGrantStatus, IssuedPairing, PairingReport,
    RemotePairingStatus, TokenExchange, Transport,
};

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// [`Transport`] over `reqwest`.
///
/// Every endpoint derives from one base URL and can be overridden on its own.
///
/// # Example
/// ```no_run
/// use pairlink::auth::HttpTransport;
///
/// let transport = HttpTransport::new("https://storage.example.com/api")
///     .with_token_url("https://login.example.com/oauth/token");
/// ```
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    pairing_session_url: String,
    pairing_status_url: String,
    device_code_url: String,
    device_status_url: String,
    token_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl AsRef<str>) -> Self {
        let base = base_url.as_ref().trim_end_matches('/');
        Self {
            client: reqwest::Client::new(),
            pairing_session_url: format!("{base}/pairing/sessions"),
            pairing_status_url: format!("{base}/pairing/sessions/status"),
            device_code_url: format!("{base}/oauth/device/code"),
            device_status_url: format!("{base}/oauth/device/status"),
            token_url: format!("{base}/oauth/token"),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_pairing_session_url(mut self, url: impl Into<String>) -> Self {
        self.pairing_session_url = url.into();
        self
    }

    pub fn with_pairing_status_url(mut self, url: impl Into<String>) -> Self {
        self.pairing_status_url = url.into();
        self
    }

    pub fn with_device_code_url(mut self, url: impl Into<String>) -> Self {
        self.device_code_url = url.into();
        self
    }

    pub fn with_device_status_url(mut self, url: impl Into<String>) -> Self {
        self.device_status_url = url.into();
        self
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    /// Send and classify the response.
    ///
    /// 429 and 5xx become transient errors. Other non-success statuses are
    /// returned as a decoded OAuth error body when one is present.
    async fn send(&self, request: RequestBuilder) -> Result<Reply, AuthError> {
        let resp = request.header("Accept", "application/json").send().await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000));
            return Err(AuthError::RateLimited { retry_after_ms });
        }
        if status.is_server_error() {
            return Err(AuthError::Server {
                status: status.as_u16(),
            });
        }

        let body = resp.text().await?;
        if status.is_success() {
            return Ok(Reply::Success(body));
        }
        let error = serde_json::from_str::<OAuthErrorBody>(&body).unwrap_or_else(|_| {
            OAuthErrorBody {
                error: format!("http_{}", status.as_u16()),
                error_description: (!body.trim().is_empty()).then(|| body.trim().to_string()),
                interval: None,
            }
        });
        Ok(Reply::Error(status, error))
    }
}

enum Reply {
    Success(String),
    /// Non-success status with its OAuth error body, or an `http_NNN` code
    /// when the body did not decode.
    Error(StatusCode, OAuthErrorBody),
}

/// Codes a pairing server uses for a session it no longer knows about.
/// The engine treats these like expiry and issues a fresh code.
fn is_stale_session(code: &str) -> bool {
    matches!(
        code,
        "expired" | "expired_token" | "invalid" | "invalid_session" | "invalid_token" | "not_found"
    )
}

fn decode<T: DeserializeOwned>(body: &str, what: &str) -> Result<T, AuthError> {
    serde_json::from_str(body).map_err(|e| AuthError::Protocol(format!("{what}: {e}")))
}

fn seconds(secs: Option<u64>) -> Option<Duration> {
    secs.filter(|s| *s > 0).map(Duration::from_secs)
}

#[async_trait]
impl Transport for HttpTransport {
    async fn issue_pairing_session(&self) -> Result<IssuedPairing, AuthError> {
        let request = self.client.post(&self.pairing_session_url).json(&serde_json::json!({}));
        let body = match self.send(request).await? {
            Reply::Success(body) => body,
            Reply::Error(_, error) => return Err(error.into_rejection()),
        };
        let payload: PairingSessionResponse = decode(&body, "pairing session")?;
        if payload.session_token.is_empty() || payload.display_code.is_empty() {
            return Err(AuthError::Protocol(
                "pairing session response missing token or code".to_string(),
            ));
        }
        Ok(IssuedPairing {
            session_token: SecretString::new(payload.session_token),
            display_code: payload.display_code,
            ttl: seconds(payload.expires_in),
        })
    }

    async fn check_pairing_status(
        &self,
        session_token: &SecretString,
    ) -> Result<PairingReport, AuthError> {
        let request = self.client.post(&self.pairing_status_url).json(&serde_json::json!({
            "session_token": session_token.expose_secret(),
        }));
        let body = match self.send(request).await? {
            Reply::Success(body) => body,
            Reply::Error(status, error)
                if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE)
                    || is_stale_session(&error.error) =>
            {
                return Ok(PairingReport::new(RemotePairingStatus::Expired))
            }
            Reply::Error(_, error) => {
                return Ok(PairingReport::new(RemotePairingStatus::Error {
                    code: error.error,
                    message: error.error_description,
                }))
            }
        };
        let payload: PairingStatusResponse = decode(&body, "pairing status")?;
        let status = match payload.status.as_str() {
            "waiting" | "pending" => RemotePairingStatus::Waiting,
            "scanned" => RemotePairingStatus::Scanned,
            "confirmed" => {
                let grant = payload.credential.ok_or_else(|| {
                    AuthError::Protocol("confirmed pairing without credential".to_string())
                })?;
                return Ok(PairingReport::confirmed(grant.into_credential()?));
            }
            code if is_stale_session(code) => RemotePairingStatus::Expired,
            "cancelled" | "canceled" => RemotePairingStatus::Cancelled,
            "error" => match payload.error {
                Some(code) if is_stale_session(&code) => RemotePairingStatus::Expired,
                code => RemotePairingStatus::Error {
                    code: code.unwrap_or_else(|| "unknown".to_string()),
                    message: payload.message,
                },
            },
            other => {
                return Err(AuthError::Protocol(format!(
                    "unknown pairing status '{other}'"
                )))
            }
        };
        Ok(PairingReport::new(status))
    }

    async fn issue_device_authorization(
        &self,
        context: &ClientContext,
        challenge: &CodeChallenge,
    ) -> Result<DeviceAuthorization, AuthError> {
        let scope = context.scope_param();
        let mut form = vec![
            ("client_id", context.client_id.as_str()),
            ("scope", scope.as_str()),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", CodeChallenge::METHOD),
        ];
        if let Some(name) = context.device_name.as_deref() {
            form.push(("device_name", name));
        }
        let request = self.client.post(&self.device_code_url).form(&form);
        let body = match self.send(request).await? {
            Reply::Success(body) => body,
            Reply::Error(_, error) => return Err(error.into_rejection()),
        };
        let payload: DeviceCodeResponse = decode(&body, "device authorization")?;
        Ok(DeviceAuthorization {
            device_code: payload.device_code,
            user_code: payload.user_code,
            verification_uri: payload.verification_uri,
            verification_uri_complete: payload.verification_uri_complete,
            interval: seconds(payload.interval),
            expires_in: Duration::from_secs(payload.expires_in),
        })
    }

    async fn check_device_authorization(
        &self,
        context: &ClientContext,
        device_code: &str,
    ) -> Result<DeviceGrantStatus, AuthError> {
        let request = self.client.post(&self.device_status_url).form(&[
            ("client_id", context.client_id.as_str()),
            ("device_code", device_code),
        ]);
        let payload: DeviceStatusResponse = match self.send(request).await? {
            Reply::Success(body) => decode(&body, "device status")?,
            Reply::Error(_, error) => DeviceStatusResponse {
                status: None,
                error: Some(error.error),
                error_description: error.error_description,
                interval: error.interval,
            },
        };
        let code = payload
            .status
            .as_deref()
            .or(payload.error.as_deref())
            .ok_or_else(|| AuthError::Protocol("device status missing status".to_string()))?;
        match code {
            "pending" | "authorization_pending" => Ok(DeviceGrantStatus::Pending),
            "approved" | "authorized" => Ok(DeviceGrantStatus::Approved),
            "slow_down" => Ok(DeviceGrantStatus::SlowDown {
                interval: seconds(payload.interval),
            }),
            "denied" | "access_denied" | "authorization_declined" => Ok(DeviceGrantStatus::Denied),
            "expired" | "expired_token" => Ok(DeviceGrantStatus::Expired),
            other => Err(AuthError::rejected(other, payload.error_description)),
        }
    }

    async fn exchange_device_token(
        &self,
        context: &ClientContext,
        device_code: &str,
        code_verifier: &CodeVerifier,
    ) -> Result<TokenExchange, AuthError> {
        let request = self.client.post(&self.token_url).form(&[
            ("grant_type", DEVICE_CODE_GRANT),
            ("client_id", context.client_id.as_str()),
            ("device_code", device_code),
            ("code_verifier", code_verifier.expose()),
        ]);
        let body = match self.send(request).await? {
            Reply::Success(body) => body,
            Reply::Error(_, error) => return error.into_token_exchange(),
        };
        let mut grant: GrantPayload = decode(&body, "token response")?;
        if grant.access_token.is_none() {
            // Some servers answer 200 with an RFC 8628 error body.
            if let Ok(error) = serde_json::from_str::<OAuthErrorBody>(&body) {
                return error.into_token_exchange();
            }
        }
        if grant.scope.is_none() && !context.scopes.is_empty() {
            grant.scope = Some(context.scope_param());
        }
        Ok(TokenExchange::Authorized(grant.into_credential()?))
    }
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default, alias = "message")]
    error_description: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
}

impl OAuthErrorBody {
    fn into_rejection(self) -> AuthError {
        AuthError::rejected(self.error, self.error_description)
    }

    fn into_token_exchange(self) -> Result<TokenExchange, AuthError> {
        match self.error.as_str() {
            "authorization_pending" => Ok(TokenExchange::Pending),
            "slow_down" => Ok(TokenExchange::SlowDown {
                interval: seconds(self.interval),
            }),
            "access_denied" | "authorization_declined" => Ok(TokenExchange::Denied),
            "expired_token" => Ok(TokenExchange::Expired),
            _ => Err(self.into_rejection()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PairingSessionResponse {
    session_token: String,
    #[serde(alias = "qr_code", alias = "code")]
    display_code: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PairingStatusResponse {
    status: String,
    #[serde(default)]
    credential: Option<GrantPayload>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    #[serde(alias = "verification_url")]
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DeviceStatusResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    interval: Option<u64>,
}

/// Token material shared by the pairing and device-grant responses.
#[derive(Debug, Deserialize)]
struct GrantPayload {
    #[serde(default, alias = "account_id", alias = "sub")]
    identity_id: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    space_id: Option<String>,
    #[serde(default)]
    space_name: Option<String>,
}

impl GrantPayload {
    fn into_credential(self) -> Result<Credential, AuthError> {
        let identity_id = self
            .identity_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AuthError::Protocol("credential missing identity_id".to_string()))?;
        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Protocol("credential missing access_token".to_string()))?;

        let mut credential = Credential::new(identity_id, SecretString::new(access_token));
        if let Some(refresh) = self.refresh_token {
            credential = credential.with_refresh_token(SecretString::new(refresh));
        }
        if let Some(secs) = self.expires_in.filter(|s| *s > 0) {
            credential = credential.with_expires_at(Utc::now() + chrono::Duration::seconds(secs));
        }
        if let Some(scope) = self.scope {
            credential = credential.with_scopes(
                scope
                    .split([' ', ','])
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            );
        }
        if let Some(space_id) = self.space_id {
            credential = credential.with_metadata("space_id", space_id);
        }
        if let Some(space_name) = self.space_name {
            credential = credential.with_metadata("space_name", space_name);
        }
        Ok(credential)
    }
}

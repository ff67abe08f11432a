//! Transport boundary: the five request/response exchanges the engine needs.
//!
//! The wire format belongs to the remote service; implementations only have
//! to map it onto these types. [`super::http::HttpTransport`] is the built-in
//! HTTP/JSON implementation.

use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use secrecy::SecretString;

use super::credential::Credential;
use super::error::AuthError;
use super::pkce::{CodeChallenge, CodeVerifier};

/// A freshly issued pairing session.
#[derive(Debug)]
pub struct IssuedPairing {
    pub session_token: SecretString,
    /// Payload to render as a scannable code (often a URI).
    pub display_code: String,
    pub ttl: Option<Duration>,
}

/// Server-side view of a pairing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemotePairingStatus {
    Waiting,
    Scanned,
    Confirmed,
    Expired,
    /// The companion device declined the request.
    Cancelled,
    /// The server reported an explicit error code.
    Error { code: String, message: Option<String> },
}

/// Result of one pairing status check.
#[derive(Debug)]
pub struct PairingReport {
    pub status: RemotePairingStatus,
    /// Present when `status` is `Confirmed`.
    pub credential: Option<Credential>,
}

impl PairingReport {
    pub fn new(status: RemotePairingStatus) -> Self {
        Self {
            status,
            credential: None,
        }
    }

    pub fn confirmed(credential: Credential) -> Self {
        Self {
            status: RemotePairingStatus::Confirmed,
            credential: Some(credential),
        }
    }
}

/// Caller-supplied details for a device authorization request.
///
/// # Example
/// ```no_run
/// use pairlink::auth::ClientContext;
///
/// let context = ClientContext::builder()
///     .client_id("pairlink-cli")
///     .scopes(vec!["files.read".to_string()])
///     .build();
/// assert_eq!(context.scope_param(), "files.read");
/// ```
#[derive(Debug, Clone, Builder)]
pub struct ClientContext {
    #[builder(into)]
    pub client_id: String,
    #[builder(default)]
    pub scopes: Vec<String>,
    #[builder(into)]
    pub device_name: Option<String>,
}

impl ClientContext {
    pub fn scope_param(&self) -> String {
        self.scopes.join(" ")
    }
}

/// Device/user code pair returned when a device authorization starts.
#[derive(Debug, Clone)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    /// Server's preferred polling interval, if it sent one.
    pub interval: Option<Duration>,
    pub expires_in: Duration,
}

/// Status-only answer while the user has not finished on the other device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceGrantStatus {
    Pending,
    /// Approved out of band; the client may now exchange the device code.
    Approved,
    SlowDown { interval: Option<Duration> },
    Denied,
    Expired,
}

/// Answer to the final token exchange.
#[derive(Debug)]
pub enum TokenExchange {
    Pending,
    SlowDown { interval: Option<Duration> },
    Authorized(Credential),
    Denied,
    Expired,
}

/// Remote storage service operations used by the engine.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn issue_pairing_session(&self) -> Result<IssuedPairing, AuthError>;

    async fn check_pairing_status(
        &self,
        session_token: &SecretString,
    ) -> Result<PairingReport, AuthError>;

    async fn issue_device_authorization(
        &self,
        context: &ClientContext,
        challenge: &CodeChallenge,
    ) -> Result<DeviceAuthorization, AuthError>;

    /// Status poll. Never carries the PKCE verifier.
    async fn check_device_authorization(
        &self,
        context: &ClientContext,
        device_code: &str,
    ) -> Result<DeviceGrantStatus, AuthError>;

    /// Final exchange, the only call that sends the verifier.
    async fn exchange_device_token(
        &self,
        context: &ClientContext,
        device_code: &str,
        code_verifier: &CodeVerifier,
    ) -> Result<TokenExchange, AuthError>;
}

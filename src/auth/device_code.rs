use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use strum::{Display, EnumString};

use super::credential::Credential;
use super::error::AuthError;
use super::events::{AuthEvent, EventEmitter};
use super::pkce::CodeVerifier;
use super::polling::{PollTick, Probe, ProbeOutcome};
use super::transport::{
    ClientContext, DeviceAuthorization, DeviceGrantStatus, TokenExchange, Transport,
};

/// Interval bump applied on `slow_down` when the server sends no hint
/// (RFC 8628 §3.5).
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceAuthStatus {
    Pending,
    Authorized,
    Denied,
    Error,
    Expired,
}

impl DeviceAuthStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// What the flow wants to happen after a response.
#[derive(Debug)]
pub enum DeviceStep {
    Wait,
    SlowDown(Duration),
    /// Approved; run the token exchange now.
    Exchange,
    Authorized(Credential),
    Expired,
    Denied,
    Failed(AuthError),
}

/// OAuth device authorization grant in progress.
///
/// Owns the PKCE verifier for the lifetime of the flow. The verifier is only
/// handed out for the token exchange and is dropped on any terminal state.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use pairlink::auth::{ClientContext, CodeVerifier, DeviceAuthorization, DeviceAuthorizationFlow};
///
/// let authorization = DeviceAuthorization {
///     device_code: "device-123".to_string(),
///     user_code: "ABCD-EFGH".to_string(),
///     verification_uri: "https://example.com/device".to_string(),
///     verification_uri_complete: None,
///     interval: Some(Duration::from_secs(5)),
///     expires_in: Duration::from_secs(900),
/// };
/// let context = ClientContext::builder().client_id("pairlink").build();
/// let flow = DeviceAuthorizationFlow::new(context, authorization, CodeVerifier::generate(), Duration::from_secs(2));
/// assert_eq!(flow.poll_interval(), Duration::from_secs(5));
/// ```
#[derive(Debug)]
pub struct DeviceAuthorizationFlow {
    context: ClientContext,
    device_code: String,
    user_code: String,
    verification_uri: String,
    verification_uri_complete: Option<String>,
    code_verifier: Option<CodeVerifier>,
    poll_interval: Duration,
    expires_at: DateTime<Utc>,
    status: DeviceAuthStatus,
    attempt_count: u32,
}

impl DeviceAuthorizationFlow {
    /// `min_interval` is the configured poll interval; a larger server hint
    /// wins.
    pub fn new(
        context: ClientContext,
        authorization: DeviceAuthorization,
        code_verifier: CodeVerifier,
        min_interval: Duration,
    ) -> Self {
        let poll_interval = authorization
            .interval
            .map(|hint| hint.max(min_interval))
            .unwrap_or(min_interval);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(authorization.expires_in)
                .unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            context,
            device_code: authorization.device_code,
            user_code: authorization.user_code,
            verification_uri: authorization.verification_uri,
            verification_uri_complete: authorization.verification_uri_complete,
            code_verifier: Some(code_verifier),
            poll_interval,
            expires_at,
            status: DeviceAuthStatus::Pending,
            attempt_count: 0,
        }
    }

    pub fn context(&self) -> &ClientContext {
        &self.context
    }

    pub fn device_code(&self) -> &str {
        &self.device_code
    }

    pub fn user_code(&self) -> &str {
        &self.user_code
    }

    pub fn verification_uri(&self) -> &str {
        &self.verification_uri
    }

    pub fn verification_uri_complete(&self) -> Option<&str> {
        self.verification_uri_complete.as_deref()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Server-advertised expiry, for display only.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn status(&self) -> DeviceAuthStatus {
        self.status
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Verifier for the token exchange; `None` once the flow is over.
    pub fn code_verifier(&self) -> Option<&CodeVerifier> {
        self.code_verifier.as_ref()
    }

    /// Apply a status-only poll result.
    pub fn on_status(&mut self, result: Result<DeviceGrantStatus, AuthError>) -> DeviceStep {
        if self.status.is_terminal() {
            return DeviceStep::Wait;
        }
        match result {
            Ok(DeviceGrantStatus::Pending) => {
                self.attempt_count += 1;
                DeviceStep::Wait
            }
            Ok(DeviceGrantStatus::Approved) => DeviceStep::Exchange,
            Ok(DeviceGrantStatus::SlowDown { interval }) => DeviceStep::SlowDown(self.slow_down(interval)),
            Ok(DeviceGrantStatus::Denied) => self.deny(),
            Ok(DeviceGrantStatus::Expired) => self.expire(),
            Err(error) => self.on_error(error),
        }
    }

    /// Apply the token exchange result.
    pub fn on_exchange(&mut self, result: Result<TokenExchange, AuthError>) -> DeviceStep {
        if self.status.is_terminal() {
            return DeviceStep::Wait;
        }
        match result {
            Ok(TokenExchange::Authorized(credential)) => {
                self.attempt_count += 1;
                self.status = DeviceAuthStatus::Authorized;
                self.discard();
                DeviceStep::Authorized(credential)
            }
            Ok(TokenExchange::Pending) => {
                self.attempt_count += 1;
                DeviceStep::Wait
            }
            Ok(TokenExchange::SlowDown { interval }) => DeviceStep::SlowDown(self.slow_down(interval)),
            Ok(TokenExchange::Denied) => self.deny(),
            Ok(TokenExchange::Expired) => self.expire(),
            Err(error) => self.on_error(error),
        }
    }

    /// Mark the flow expired (server report or poll timeout).
    pub fn expire(&mut self) -> DeviceStep {
        self.status = DeviceAuthStatus::Expired;
        self.discard();
        DeviceStep::Expired
    }

    /// Drop the verifier. Called on every terminal path and on cancel.
    pub fn discard(&mut self) {
        self.code_verifier = None;
    }

    fn deny(&mut self) -> DeviceStep {
        self.status = DeviceAuthStatus::Denied;
        self.discard();
        DeviceStep::Denied
    }

    fn slow_down(&mut self, hint: Option<Duration>) -> Duration {
        let bumped = self.poll_interval + SLOW_DOWN_STEP;
        self.poll_interval = hint.filter(|h| *h > self.poll_interval).unwrap_or(bumped);
        self.poll_interval
    }

    fn on_error(&mut self, error: AuthError) -> DeviceStep {
        self.attempt_count += 1;
        if error.is_transient() {
            tracing::warn!(
                flow = "device_authorization",
                attempt = self.attempt_count,
                error = %error,
                "device authorization poll failed; will retry"
            );
            return DeviceStep::Wait;
        }
        self.status = DeviceAuthStatus::Error;
        self.discard();
        DeviceStep::Failed(error)
    }
}

/// Terminal outcome of a device flow's polling loop.
#[derive(Debug)]
pub enum DeviceResolution {
    Authorized(Credential),
    Expired,
    Denied,
    Failed(AuthError),
}

/// Probe that polls status and, once approved, performs the exchange.
pub(crate) struct DeviceProbe {
    transport: Arc<dyn Transport>,
    flow: DeviceAuthorizationFlow,
    emitter: EventEmitter<AuthEvent>,
}

impl DeviceProbe {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        flow: DeviceAuthorizationFlow,
        emitter: EventEmitter<AuthEvent>,
    ) -> Self {
        Self {
            transport,
            flow,
            emitter,
        }
    }

    fn settle(&mut self, step: DeviceStep) -> ProbeOutcome<DeviceResolution> {
        match step {
            DeviceStep::Wait | DeviceStep::Exchange => ProbeOutcome::Continue,
            DeviceStep::SlowDown(interval) => {
                self.emitter.emit(AuthEvent::IntervalIncreased { interval });
                ProbeOutcome::SlowDown { interval }
            }
            DeviceStep::Authorized(credential) => {
                ProbeOutcome::Done(DeviceResolution::Authorized(credential))
            }
            DeviceStep::Expired => ProbeOutcome::Done(DeviceResolution::Expired),
            DeviceStep::Denied => ProbeOutcome::Done(DeviceResolution::Denied),
            DeviceStep::Failed(error) => ProbeOutcome::Done(DeviceResolution::Failed(error)),
        }
    }
}

#[async_trait]
impl Probe for DeviceProbe {
    type Output = DeviceResolution;

    async fn probe(&mut self, tick: PollTick) -> ProbeOutcome<DeviceResolution> {
        let status = self
            .transport
            .check_device_authorization(self.flow.context(), self.flow.device_code())
            .await;
        let step = self.flow.on_status(status);
        if !matches!(step, DeviceStep::Exchange) {
            return self.settle(step);
        }

        tracing::debug!(flow = "device_authorization", attempt = tick.attempt, "approved; exchanging device code");
        let Some(verifier) = self.flow.code_verifier() else {
            return ProbeOutcome::Done(DeviceResolution::Failed(AuthError::Cancelled));
        };
        let exchange = self
            .transport
            .exchange_device_token(self.flow.context(), self.flow.device_code(), verifier)
            .await;
        let step = self.flow.on_exchange(exchange);
        self.settle(step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn authorization(interval: Option<u64>) -> DeviceAuthorization {
        DeviceAuthorization {
            device_code: "device-1".to_string(),
            user_code: "WDJB-MJHT".to_string(),
            verification_uri: "https://example.com/device".to_string(),
            verification_uri_complete: Some("https://example.com/device?user_code=WDJB-MJHT".to_string()),
            interval: interval.map(Duration::from_secs),
            expires_in: Duration::from_secs(900),
        }
    }

    fn flow(interval: Option<u64>) -> DeviceAuthorizationFlow {
        DeviceAuthorizationFlow::new(
            ClientContext::builder().client_id("pairlink-test").build(),
            authorization(interval),
            CodeVerifier::generate(),
            Duration::from_secs(2),
        )
    }

    fn credential() -> Credential {
        Credential::new("user-9", SecretString::new("access".to_string()))
    }

    #[test]
    fn server_hint_raises_initial_interval_but_never_lowers_it() {
        assert_eq!(flow(Some(5)).poll_interval(), Duration::from_secs(5));
        assert_eq!(flow(Some(1)).poll_interval(), Duration::from_secs(2));
        assert_eq!(flow(None).poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn pending_counts_an_attempt() {
        let mut flow = flow(None);
        assert!(matches!(flow.on_status(Ok(DeviceGrantStatus::Pending)), DeviceStep::Wait));
        assert_eq!(flow.attempt_count(), 1);
        assert_eq!(flow.status(), DeviceAuthStatus::Pending);
    }

    #[test]
    fn slow_down_without_hint_adds_five_seconds_and_is_not_an_attempt() {
        let mut flow = flow(Some(5));
        let step = flow.on_status(Ok(DeviceGrantStatus::SlowDown { interval: None }));
        assert!(matches!(step, DeviceStep::SlowDown(d) if d == Duration::from_secs(10)));
        assert_eq!(flow.poll_interval(), Duration::from_secs(10));
        assert_eq!(flow.attempt_count(), 0);
        assert_eq!(flow.status(), DeviceAuthStatus::Pending);
    }

    #[test]
    fn slow_down_uses_larger_server_hint() {
        let mut flow = flow(Some(5));
        let step = flow.on_status(Ok(DeviceGrantStatus::SlowDown {
            interval: Some(Duration::from_secs(30)),
        }));
        assert!(matches!(step, DeviceStep::SlowDown(d) if d == Duration::from_secs(30)));
    }

    #[test]
    fn approval_requests_exchange_and_success_drops_verifier() {
        let mut flow = flow(None);
        assert!(matches!(flow.on_status(Ok(DeviceGrantStatus::Approved)), DeviceStep::Exchange));
        assert!(flow.code_verifier().is_some());

        let step = flow.on_exchange(Ok(TokenExchange::Authorized(credential())));
        assert!(matches!(step, DeviceStep::Authorized(c) if c.identity_id == "user-9"));
        assert_eq!(flow.status(), DeviceAuthStatus::Authorized);
        assert!(flow.code_verifier().is_none());
    }

    #[test]
    fn denial_is_terminal() {
        let mut flow = flow(None);
        assert!(matches!(flow.on_status(Ok(DeviceGrantStatus::Denied)), DeviceStep::Denied));
        assert_eq!(flow.status(), DeviceAuthStatus::Denied);
        assert!(flow.code_verifier().is_none());
        assert!(matches!(flow.on_status(Ok(DeviceGrantStatus::Approved)), DeviceStep::Wait));
    }

    #[test]
    fn expiry_from_exchange_is_terminal() {
        let mut flow = flow(None);
        assert!(matches!(flow.on_exchange(Ok(TokenExchange::Expired)), DeviceStep::Expired));
        assert_eq!(flow.status(), DeviceAuthStatus::Expired);
    }

    #[test]
    fn transient_errors_wait_and_protocol_errors_fail() {
        let mut flow = flow(None);
        assert!(matches!(
            flow.on_status(Err(AuthError::Network("timeout".into()))),
            DeviceStep::Wait
        ));
        assert_eq!(flow.status(), DeviceAuthStatus::Pending);

        let step = flow.on_status(Err(AuthError::Protocol("garbage".into())));
        assert!(matches!(step, DeviceStep::Failed(AuthError::Protocol(_))));
        assert_eq!(flow.status(), DeviceAuthStatus::Error);
        assert!(flow.code_verifier().is_none());
    }

    #[test]
    fn exchange_pending_keeps_polling() {
        let mut flow = flow(None);
        flow.on_status(Ok(DeviceGrantStatus::Approved));
        assert!(matches!(flow.on_exchange(Ok(TokenExchange::Pending)), DeviceStep::Wait));
        assert_eq!(flow.status(), DeviceAuthStatus::Pending);
        assert!(flow.code_verifier().is_some());
    }
}

//! Façade that runs pairing and device-authorization flows.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::device_code::{DeviceAuthorizationFlow, DeviceProbe, DeviceResolution};
use super::error::AuthError;
use super::events::{
    event_stream, AuthEvent, AuthEvents, EventEmitter, ExpiryCause, FlowKind, PairingEvent,
    PairingEvents,
};
use super::pairing::{PairingProbe, PairingResolution, PairingSession};
use super::pkce::CodeVerifier;
use super::polling::{LoopEnd, PollConfig, PollingLoop};
use super::transport::{ClientContext, Transport};
use crate::util::retry::RetryPolicy;

/// Tuning for an [`AuthEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub pairing_poll: PollConfig,
    pub device_poll: PollConfig,
    /// Applied to every code-issuing request, including pairing restarts.
    pub issue_retry: RetryPolicy,
    /// `None` restarts expired pairing sessions without limit.
    pub max_pairing_restarts: Option<u32>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pairing_poll: PollConfig::default(),
            device_poll: PollConfig::default(),
            issue_retry: RetryPolicy::default(),
            max_pairing_restarts: None,
        }
    }
}

#[derive(Debug)]
struct ActiveFlow {
    generation: u64,
    token: CancellationToken,
}

#[derive(Debug, Default)]
struct FlowSlots {
    next_generation: u64,
    pairing: Option<ActiveFlow>,
    device: Option<ActiveFlow>,
}

impl FlowSlots {
    fn slot(&mut self, kind: FlowKind) -> &mut Option<ActiveFlow> {
        match kind {
            FlowKind::Pairing => &mut self.pairing,
            FlowKind::DeviceAuthorization => &mut self.device,
        }
    }
}

/// Shared bookkeeping of which flow currently owns each kind.
#[derive(Debug, Clone, Default)]
struct FlowRegistry {
    slots: Arc<Mutex<FlowSlots>>,
}

impl FlowRegistry {
    fn lock(&self) -> MutexGuard<'_, FlowSlots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `kind` for a new flow, cancelling whatever held it.
    fn register(&self, kind: FlowKind) -> (u64, CancellationToken) {
        let mut slots = self.lock();
        slots.next_generation += 1;
        let generation = slots.next_generation;
        let token = CancellationToken::new();
        let previous = slots.slot(kind).replace(ActiveFlow {
            generation,
            token: token.clone(),
        });
        if let Some(previous) = previous {
            tracing::info!(%kind, generation = previous.generation, "superseding active flow");
            previous.token.cancel();
        }
        (generation, token)
    }

    /// Clear `kind` if it is still owned by `generation`.
    fn release(&self, kind: FlowKind, generation: u64) {
        let mut slots = self.lock();
        let slot = slots.slot(kind);
        if slot.as_ref().map(|f| f.generation) == Some(generation) {
            *slot = None;
        }
    }

    fn cancel(&self, kind: FlowKind) -> bool {
        let taken = self.lock().slot(kind).take();
        match taken {
            Some(flow) => {
                tracing::info!(%kind, generation = flow.generation, "cancelling flow");
                flow.token.cancel();
                true
            }
            None => false,
        }
    }

    fn is_active(&self, kind: FlowKind) -> bool {
        self.lock()
            .slot(kind)
            .as_ref()
            .map(|f| !f.token.is_cancelled())
            .unwrap_or(false)
    }
}

/// Runs "link this account" flows against one [`Transport`].
///
/// At most one flow of each [`FlowKind`] is active; beginning a new one
/// cancels the previous flow of that kind, whose stream then ends with
/// `Cancelled`. Credentials are moved into the terminal event and never kept.
///
/// Each flow runs on its own tokio task, so the engine must be used inside a
/// tokio runtime.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use futures::StreamExt;
/// use pairlink::auth::{AuthEngine, HttpTransport, PairingEvent};
///
/// # async fn run() {
/// let engine = AuthEngine::new(Arc::new(HttpTransport::new("https://storage.example.com")));
/// let mut events = engine.begin_pairing();
/// while let Some(event) = events.next().await {
///     if let PairingEvent::Confirmed { credential } = event {
///         println!("linked {}", credential.identity_id);
///     }
/// }
/// # }
/// ```
pub struct AuthEngine {
    transport: Arc<dyn Transport>,
    options: EngineOptions,
    registry: FlowRegistry,
}

impl AuthEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_options(transport, EngineOptions::default())
    }

    pub fn with_options(transport: Arc<dyn Transport>, options: EngineOptions) -> Self {
        Self {
            transport,
            options,
            registry: FlowRegistry::default(),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Start session-code pairing. Expired codes are replaced automatically.
    pub fn begin_pairing(&self) -> PairingEvents {
        let (generation, token) = self.registry.register(FlowKind::Pairing);
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = PairingDriver {
            transport: self.transport.clone(),
            options: self.options.clone(),
            emitter: EventEmitter::new(tx, token.clone()),
            token: token.clone(),
            generation,
            registry: self.registry.clone(),
        };
        tracing::info!(flow = "pairing", generation, "pairing started");
        tokio::spawn(driver.run());
        event_stream(rx, token)
    }

    /// Start an OAuth device authorization grant for `context`.
    pub fn begin_device_authorization(&self, context: ClientContext) -> AuthEvents {
        let (generation, token) = self.registry.register(FlowKind::DeviceAuthorization);
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = DeviceDriver {
            transport: self.transport.clone(),
            options: self.options.clone(),
            context,
            emitter: EventEmitter::new(tx, token.clone()),
            token: token.clone(),
            generation,
            registry: self.registry.clone(),
        };
        tracing::info!(flow = "device_authorization", generation, "device authorization started");
        tokio::spawn(driver.run());
        event_stream(rx, token)
    }

    /// Cancel the active flow of `kind`, if any.
    ///
    /// Polling stops before this returns; the flow's secrets are dropped as
    /// its task unwinds and any response still in flight is ignored. Safe to
    /// call repeatedly; returns `true` only when a flow was cancelled.
    pub fn cancel(&self, kind: FlowKind) -> bool {
        self.registry.cancel(kind)
    }

    pub fn is_active(&self, kind: FlowKind) -> bool {
        self.registry.is_active(kind)
    }
}

impl Drop for AuthEngine {
    fn drop(&mut self) {
        self.registry.cancel(FlowKind::Pairing);
        self.registry.cancel(FlowKind::DeviceAuthorization);
    }
}

/// Issue a code through the retry policy, giving up early on cancel.
async fn issue_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, AuthError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AuthError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AuthError::Cancelled),
        result = policy.execute(operation) => result,
    }
}

fn expiry_from_ttl(ttl: Option<std::time::Duration>) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    Some(Utc::now() + ttl)
}

struct PairingDriver {
    transport: Arc<dyn Transport>,
    options: EngineOptions,
    emitter: EventEmitter<PairingEvent>,
    token: CancellationToken,
    generation: u64,
    registry: FlowRegistry,
}

impl PairingDriver {
    async fn run(self) {
        let terminal = self.drive().await;
        let terminal = if self.token.is_cancelled() {
            PairingEvent::Cancelled
        } else {
            terminal
        };
        match &terminal {
            PairingEvent::Confirmed { credential } => tracing::info!(
                flow = "pairing",
                generation = self.generation,
                identity = %credential.identity_id,
                "pairing confirmed"
            ),
            PairingEvent::Failed { error } => tracing::warn!(
                flow = "pairing",
                generation = self.generation,
                error = %error,
                "pairing failed"
            ),
            _ => tracing::info!(flow = "pairing", generation = self.generation, "pairing cancelled"),
        }
        self.registry.release(FlowKind::Pairing, self.generation);
        self.emitter.finish(terminal);
    }

    async fn drive(&self) -> PairingEvent {
        let mut restarts = 0u32;
        let mut refresh: Option<ExpiryCause> = None;

        loop {
            let transport = self.transport.clone();
            let issued = match issue_with_retry(&self.options.issue_retry, &self.token, || {
                let transport = transport.clone();
                async move { transport.issue_pairing_session().await }
            })
            .await
            {
                Ok(issued) => issued,
                Err(AuthError::Cancelled) => return PairingEvent::Cancelled,
                Err(error) => return PairingEvent::Failed { error },
            };

            let expires_at = expiry_from_ttl(issued.ttl);
            let session = PairingSession::new(issued);
            let display_code = session.display_code().to_string();
            match refresh {
                None => self.emitter.emit(PairingEvent::CodeIssued {
                    display_code,
                    expires_at,
                }),
                Some(cause) => self.emitter.emit(PairingEvent::CodeRefreshed {
                    display_code,
                    expires_at,
                    cause,
                    restarts,
                }),
            };

            let probe = PairingProbe::new(self.transport.clone(), session, self.emitter.clone());
            let task = PollingLoop::start_with_token(
                self.options.pairing_poll,
                probe,
                self.token.child_token(),
            );
            let cause = match task.finished().await {
                LoopEnd::Done(PairingResolution::Confirmed(credential)) => {
                    return PairingEvent::Confirmed { credential }
                }
                LoopEnd::Done(PairingResolution::Failed(error)) => {
                    return PairingEvent::Failed { error }
                }
                LoopEnd::Cancelled => return PairingEvent::Cancelled,
                LoopEnd::Done(PairingResolution::Expired) => ExpiryCause::Server,
                LoopEnd::Timeout { .. } => ExpiryCause::Timeout,
            };

            restarts += 1;
            if let Some(max) = self.options.max_pairing_restarts {
                if restarts > max {
                    return PairingEvent::Failed {
                        error: AuthError::Expired,
                    };
                }
            }
            tracing::info!(
                flow = "pairing",
                generation = self.generation,
                %cause,
                restarts,
                "pairing code expired; issuing a new one"
            );
            refresh = Some(cause);
        }
    }
}

struct DeviceDriver {
    transport: Arc<dyn Transport>,
    options: EngineOptions,
    context: ClientContext,
    emitter: EventEmitter<AuthEvent>,
    token: CancellationToken,
    generation: u64,
    registry: FlowRegistry,
}

impl DeviceDriver {
    async fn run(self) {
        let terminal = self.drive().await;
        let terminal = if self.token.is_cancelled() {
            AuthEvent::Cancelled
        } else {
            terminal
        };
        match &terminal {
            AuthEvent::Authorized { credential } => tracing::info!(
                flow = "device_authorization",
                generation = self.generation,
                identity = %credential.identity_id,
                "device authorization granted"
            ),
            AuthEvent::Failed { error } => tracing::warn!(
                flow = "device_authorization",
                generation = self.generation,
                error = %error,
                "device authorization failed"
            ),
            other => tracing::info!(
                flow = "device_authorization",
                generation = self.generation,
                outcome = ?other,
                "device authorization ended"
            ),
        }
        self.registry
            .release(FlowKind::DeviceAuthorization, self.generation);
        self.emitter.finish(terminal);
    }

    async fn drive(&self) -> AuthEvent {
        let verifier = CodeVerifier::generate();
        let challenge = verifier.challenge();

        let transport = self.transport.clone();
        let context = self.context.clone();
        let authorization = match issue_with_retry(&self.options.issue_retry, &self.token, || {
            let transport = transport.clone();
            let context = context.clone();
            let challenge = challenge.clone();
            async move {
                transport
                    .issue_device_authorization(&context, &challenge)
                    .await
            }
        })
        .await
        {
            Ok(authorization) => authorization,
            Err(AuthError::Cancelled) => return AuthEvent::Cancelled,
            Err(error) => return AuthEvent::Failed { error },
        };

        let flow = DeviceAuthorizationFlow::new(
            self.context.clone(),
            authorization,
            verifier,
            self.options.device_poll.interval(),
        );
        let config = match PollConfig::new(
            flow.poll_interval(),
            self.options.device_poll.max_attempts(),
        ) {
            Ok(config) => config,
            Err(error) => return AuthEvent::Failed { error },
        };
        self.emitter.emit(AuthEvent::CodeIssued {
            user_code: flow.user_code().to_string(),
            verification_uri: flow.verification_uri().to_string(),
            verification_uri_complete: flow.verification_uri_complete().map(str::to_string),
            expires_at: flow.expires_at(),
            interval: flow.poll_interval(),
        });

        let probe = DeviceProbe::new(self.transport.clone(), flow, self.emitter.clone());
        let task = PollingLoop::start_with_token(config, probe, self.token.child_token());
        match task.finished().await {
            LoopEnd::Done(DeviceResolution::Authorized(credential)) => {
                AuthEvent::Authorized { credential }
            }
            LoopEnd::Done(DeviceResolution::Expired) => AuthEvent::Expired {
                cause: ExpiryCause::Server,
            },
            LoopEnd::Timeout { .. } => AuthEvent::Expired {
                cause: ExpiryCause::Timeout,
            },
            LoopEnd::Done(DeviceResolution::Denied) => AuthEvent::Denied,
            LoopEnd::Done(DeviceResolution::Failed(error)) => AuthEvent::Failed { error },
            LoopEnd::Cancelled => AuthEvent::Cancelled,
        }
    }
}

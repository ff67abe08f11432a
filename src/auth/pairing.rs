//! Session-code pairing state machine.
//!
//! A [`PairingSession`] holds one opaque session token and the code rendered
//! for the companion app. Each status report moves it along
//! `Waiting → Scanned → Confirmed`, or into `Expired`/`Error`. Terminal states
//! drop the token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use strum::{Display, EnumString};

use super::credential::Credential;
use super::error::AuthError;
use super::events::{EventEmitter, PairingEvent};
use super::polling::{PollTick, Probe, ProbeOutcome};
use super::transport::{IssuedPairing, PairingReport, RemotePairingStatus, Transport};

/// Malformed responses tolerated in a row before the session fails.
const MAX_MALFORMED_STREAK: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PairingStatus {
    Waiting,
    Scanned,
    Confirmed,
    Expired,
    Error,
}

impl PairingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Expired | Self::Error)
    }
}

/// What applying one status report did to the session.
#[derive(Debug)]
pub enum PairingTransition {
    Unchanged,
    Advanced(PairingStatus),
    Confirmed(Credential),
    Expired,
    Failed(AuthError),
}

#[derive(Debug)]
pub struct PairingSession {
    session_token: Option<SecretString>,
    display_code: String,
    status: PairingStatus,
    created_at: DateTime<Utc>,
    ttl: Option<Duration>,
    attempt_count: u32,
    malformed_streak: u32,
}

impl PairingSession {
    pub fn new(issued: IssuedPairing) -> Self {
        Self {
            session_token: Some(issued.session_token),
            display_code: issued.display_code,
            status: PairingStatus::Waiting,
            created_at: Utc::now(),
            ttl: issued.ttl,
            attempt_count: 0,
            malformed_streak: 0,
        }
    }

    /// `None` once the session reached a terminal state or was discarded.
    pub fn session_token(&self) -> Option<&SecretString> {
        self.session_token.as_ref()
    }

    pub fn display_code(&self) -> &str {
        &self.display_code
    }

    pub fn status(&self) -> PairingStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Server-advertised expiry, for display only.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        Some(self.created_at + ttl)
    }

    /// Apply the result of one status check.
    pub fn apply(&mut self, result: Result<PairingReport, AuthError>) -> PairingTransition {
        if self.status.is_terminal() {
            return PairingTransition::Unchanged;
        }
        self.attempt_count += 1;

        let report = match result {
            Ok(report) => report,
            Err(error) if error.is_transient() => {
                tracing::warn!(
                    flow = "pairing",
                    attempt = self.attempt_count,
                    error = %error,
                    "pairing status check failed; will retry"
                );
                return PairingTransition::Unchanged;
            }
            Err(error) if error.is_protocol() => return self.malformed(error),
            Err(error) => return self.fail(error),
        };

        match report.status {
            RemotePairingStatus::Waiting => {
                self.malformed_streak = 0;
                PairingTransition::Unchanged
            }
            RemotePairingStatus::Scanned => {
                self.malformed_streak = 0;
                if self.status == PairingStatus::Waiting {
                    self.status = PairingStatus::Scanned;
                    PairingTransition::Advanced(PairingStatus::Scanned)
                } else {
                    PairingTransition::Unchanged
                }
            }
            RemotePairingStatus::Confirmed => match report.credential {
                Some(credential) => {
                    self.status = PairingStatus::Confirmed;
                    self.discard();
                    PairingTransition::Confirmed(credential)
                }
                None => self.malformed(AuthError::Protocol(
                    "confirmed pairing carried no credential".to_string(),
                )),
            },
            RemotePairingStatus::Expired => self.expire(),
            RemotePairingStatus::Cancelled => self.fail(AuthError::rejected(
                "cancelled",
                Some("declined on companion device".to_string()),
            )),
            RemotePairingStatus::Error { code, message } => {
                self.fail(AuthError::rejected(code, message))
            }
        }
    }

    /// Mark the session expired (server report or poll timeout).
    pub fn expire(&mut self) -> PairingTransition {
        if self.status.is_terminal() {
            return PairingTransition::Unchanged;
        }
        self.status = PairingStatus::Expired;
        self.discard();
        PairingTransition::Expired
    }

    /// Drop the session token. Called on every terminal path and on cancel.
    pub fn discard(&mut self) {
        self.session_token = None;
    }

    fn malformed(&mut self, error: AuthError) -> PairingTransition {
        self.malformed_streak += 1;
        if self.malformed_streak >= MAX_MALFORMED_STREAK {
            return self.fail(error);
        }
        tracing::warn!(
            flow = "pairing",
            attempt = self.attempt_count,
            error = %error,
            "malformed pairing status response"
        );
        PairingTransition::Unchanged
    }

    fn fail(&mut self, error: AuthError) -> PairingTransition {
        self.status = PairingStatus::Error;
        self.discard();
        PairingTransition::Failed(error)
    }
}

/// Terminal outcome of one pairing session's polling loop.
#[derive(Debug)]
pub enum PairingResolution {
    Confirmed(Credential),
    Expired,
    Failed(AuthError),
}

/// Probe that checks one session per tick and owns that session.
pub(crate) struct PairingProbe {
    transport: Arc<dyn Transport>,
    session: PairingSession,
    emitter: EventEmitter<PairingEvent>,
}

impl PairingProbe {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        session: PairingSession,
        emitter: EventEmitter<PairingEvent>,
    ) -> Self {
        Self {
            transport,
            session,
            emitter,
        }
    }
}

#[async_trait]
impl Probe for PairingProbe {
    type Output = PairingResolution;

    async fn probe(&mut self, tick: PollTick) -> ProbeOutcome<PairingResolution> {
        let Some(token) = self.session.session_token() else {
            return ProbeOutcome::Done(PairingResolution::Failed(AuthError::Cancelled));
        };
        let result = self.transport.check_pairing_status(token).await;

        match self.session.apply(result) {
            PairingTransition::Unchanged => ProbeOutcome::Continue,
            PairingTransition::Advanced(status) => {
                tracing::debug!(flow = "pairing", attempt = tick.attempt, %status, "pairing advanced");
                self.emitter.emit(PairingEvent::StatusChanged { status });
                ProbeOutcome::Continue
            }
            PairingTransition::Confirmed(credential) => {
                ProbeOutcome::Done(PairingResolution::Confirmed(credential))
            }
            PairingTransition::Expired => ProbeOutcome::Done(PairingResolution::Expired),
            PairingTransition::Failed(error) => ProbeOutcome::Done(PairingResolution::Failed(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> PairingSession {
        PairingSession::new(IssuedPairing {
            session_token: SecretString::new("token-1".to_string()),
            display_code: "pairlink://pair?uid=abc".to_string(),
            ttl: Some(Duration::from_secs(300)),
        })
    }

    fn credential() -> Credential {
        Credential::new("user-1", SecretString::new("access".to_string()))
    }

    #[test]
    fn waiting_scanned_confirmed_sequence() {
        let mut session = session();
        assert_eq!(session.status(), PairingStatus::Waiting);

        let t = session.apply(Ok(PairingReport::new(RemotePairingStatus::Waiting)));
        assert!(matches!(t, PairingTransition::Unchanged));

        let t = session.apply(Ok(PairingReport::new(RemotePairingStatus::Scanned)));
        assert!(matches!(t, PairingTransition::Advanced(PairingStatus::Scanned)));
        assert_eq!(session.status(), PairingStatus::Scanned);

        let t = session.apply(Ok(PairingReport::confirmed(credential())));
        match t {
            PairingTransition::Confirmed(c) => assert_eq!(c.identity_id, "user-1"),
            other => panic!("expected Confirmed, got {other:?}"),
        }
        assert_eq!(session.status(), PairingStatus::Confirmed);
        assert!(session.session_token().is_none());
        assert_eq!(session.attempt_count(), 3);
    }

    #[test]
    fn confirmed_directly_from_waiting() {
        let mut session = session();
        let t = session.apply(Ok(PairingReport::confirmed(credential())));
        assert!(matches!(t, PairingTransition::Confirmed(_)));
    }

    #[test]
    fn repeated_scanned_reports_do_not_re_advance() {
        let mut session = session();
        session.apply(Ok(PairingReport::new(RemotePairingStatus::Scanned)));
        let t = session.apply(Ok(PairingReport::new(RemotePairingStatus::Scanned)));
        assert!(matches!(t, PairingTransition::Unchanged));
        let t = session.apply(Ok(PairingReport::new(RemotePairingStatus::Waiting)));
        assert!(matches!(t, PairingTransition::Unchanged));
        assert_eq!(session.status(), PairingStatus::Scanned);
    }

    #[test]
    fn transient_failure_keeps_state_and_token() {
        let mut session = session();
        let t = session.apply(Err(AuthError::Network("connection reset".into())));
        assert!(matches!(t, PairingTransition::Unchanged));
        let t = session.apply(Err(AuthError::Server { status: 502 }));
        assert!(matches!(t, PairingTransition::Unchanged));
        assert_eq!(session.status(), PairingStatus::Waiting);
        assert!(session.session_token().is_some());
    }

    #[test]
    fn server_expiry_is_terminal_and_drops_token() {
        let mut session = session();
        let t = session.apply(Ok(PairingReport::new(RemotePairingStatus::Expired)));
        assert!(matches!(t, PairingTransition::Expired));
        assert_eq!(session.status(), PairingStatus::Expired);
        assert!(session.session_token().is_none());

        let t = session.apply(Ok(PairingReport::confirmed(credential())));
        assert!(matches!(t, PairingTransition::Unchanged));
        assert_eq!(session.status(), PairingStatus::Expired);
    }

    #[test]
    fn single_malformed_response_is_tolerated() {
        let mut session = session();
        let t = session.apply(Err(AuthError::Protocol("unexpected body".into())));
        assert!(matches!(t, PairingTransition::Unchanged));
        let t = session.apply(Ok(PairingReport::new(RemotePairingStatus::Waiting)));
        assert!(matches!(t, PairingTransition::Unchanged));
        let t = session.apply(Err(AuthError::Protocol("unexpected body".into())));
        assert!(matches!(t, PairingTransition::Unchanged));
        assert_eq!(session.status(), PairingStatus::Waiting);
    }

    #[test]
    fn two_consecutive_malformed_responses_fail() {
        let mut session = session();
        session.apply(Err(AuthError::Protocol("bad".into())));
        let t = session.apply(Ok(PairingReport::new(RemotePairingStatus::Confirmed)));
        assert!(matches!(t, PairingTransition::Failed(AuthError::Protocol(_))));
        assert_eq!(session.status(), PairingStatus::Error);
        assert!(session.session_token().is_none());
    }

    #[test]
    fn explicit_server_error_fails_immediately() {
        let mut session = session();
        let t = session.apply(Ok(PairingReport::new(RemotePairingStatus::Error {
            code: "session_revoked".into(),
            message: None,
        })));
        match t {
            PairingTransition::Failed(AuthError::Rejected { code, .. }) => {
                assert_eq!(code, "session_revoked")
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn companion_cancel_is_reported_as_rejection() {
        let mut session = session();
        let t = session.apply(Ok(PairingReport::new(RemotePairingStatus::Cancelled)));
        assert!(matches!(
            t,
            PairingTransition::Failed(AuthError::Rejected { .. })
        ));
    }

    #[test]
    fn expire_after_terminal_is_a_no_op() {
        let mut session = session();
        session.apply(Ok(PairingReport::confirmed(credential())));
        assert!(matches!(session.expire(), PairingTransition::Unchanged));
        assert_eq!(session.status(), PairingStatus::Confirmed);
    }

    #[test]
    fn expires_at_derives_from_ttl() {
        let session = session();
        let expires_at = session.expires_at().unwrap();
        assert_eq!((expires_at - session.created_at()).num_seconds(), 300);
    }

    #[test]
    fn status_names_are_snake_case() {
        assert_eq!(PairingStatus::Scanned.to_string(), "scanned");
        assert_eq!("confirmed".parse::<PairingStatus>().unwrap(), PairingStatus::Confirmed);
    }
}

//! Observable events emitted by [`super::AuthEngine`] flows.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use strum::{Display, EnumString};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::credential::Credential;
use super::error::AuthError;
use super::pairing::PairingStatus;

/// The two link protocols an engine can run side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum FlowKind {
    Pairing,
    DeviceAuthorization,
}

/// Why a code stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ExpiryCause {
    /// The server reported the code as expired or invalid.
    Server,
    /// The poll budget ran out first.
    Timeout,
}

/// Events from a session-code pairing flow.
///
/// The stream ends right after the single terminal event
/// (`Confirmed`, `Failed` or `Cancelled`).
#[derive(Debug)]
pub enum PairingEvent {
    CodeIssued {
        display_code: String,
        expires_at: Option<DateTime<Utc>>,
    },
    /// The previous code expired and a new one replaced it.
    CodeRefreshed {
        display_code: String,
        expires_at: Option<DateTime<Utc>>,
        cause: ExpiryCause,
        restarts: u32,
    },
    StatusChanged {
        status: PairingStatus,
    },
    Confirmed {
        credential: Credential,
    },
    Failed {
        error: AuthError,
    },
    Cancelled,
}

impl PairingEvent {
    /// Session status this event reflects, if any.
    pub fn status(&self) -> Option<PairingStatus> {
        match self {
            Self::CodeIssued { .. } | Self::CodeRefreshed { .. } => Some(PairingStatus::Waiting),
            Self::StatusChanged { status } => Some(*status),
            Self::Confirmed { .. } => Some(PairingStatus::Confirmed),
            Self::Failed { .. } => Some(PairingStatus::Error),
            Self::Cancelled => None,
        }
    }

    pub fn display_code(&self) -> Option<&str> {
        match self {
            Self::CodeIssued { display_code, .. } | Self::CodeRefreshed { display_code, .. } => {
                Some(display_code)
            }
            _ => None,
        }
    }
}

/// Events from an OAuth device authorization flow.
///
/// The stream ends right after the single terminal event
/// (`Authorized`, `Expired`, `Denied`, `Failed` or `Cancelled`).
#[derive(Debug)]
pub enum AuthEvent {
    CodeIssued {
        user_code: String,
        verification_uri: String,
        verification_uri_complete: Option<String>,
        expires_at: DateTime<Utc>,
        interval: Duration,
    },
    IntervalIncreased {
        interval: Duration,
    },
    Authorized {
        credential: Credential,
    },
    /// Terminal; the caller has to start a new flow to show a fresh code.
    Expired {
        cause: ExpiryCause,
    },
    Denied,
    Failed {
        error: AuthError,
    },
    Cancelled,
}

pub type PairingEvents = BoxStream<'static, PairingEvent>;
pub type AuthEvents = BoxStream<'static, AuthEvent>;

pub(crate) trait FlowEvent: Send + 'static {
    fn is_terminal(&self) -> bool;
}

impl FlowEvent for PairingEvent {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Confirmed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

impl FlowEvent for AuthEvent {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Authorized { .. }
                | Self::Expired { .. }
                | Self::Denied
                | Self::Failed { .. }
                | Self::Cancelled
        )
    }
}

/// Sending half of a flow's event channel.
///
/// Progress events are dropped once the flow is cancelled, so a probe that
/// resolves late can never surface a transition.
#[derive(Debug)]
pub(crate) struct EventEmitter<E> {
    tx: mpsc::UnboundedSender<E>,
    token: CancellationToken,
}

impl<E> Clone for EventEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            token: self.token.clone(),
        }
    }
}

impl<E: FlowEvent> EventEmitter<E> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<E>, token: CancellationToken) -> Self {
        Self { tx, token }
    }

    pub(crate) fn emit(&self, event: E) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    /// Emit the flow's final event, bypassing the cancellation gate.
    pub(crate) fn finish(&self, event: E) {
        let _ = self.tx.send(event);
    }
}

/// Turn a flow's receiver into a stream that stops after the terminal event.
///
/// Dropping the stream cancels the flow.
pub(crate) fn event_stream<E: FlowEvent>(
    mut rx: mpsc::UnboundedReceiver<E>,
    token: CancellationToken,
) -> BoxStream<'static, E> {
    let guard = token.drop_guard();
    Box::pin(async_stream::stream! {
        let _guard = guard;
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            yield event;
            if terminal {
                break;
            }
        }
    })
}

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pairlink::auth::{
    AuthError, ClientContext, CodeChallenge, CodeVerifier, Credential, CredentialSink,
    DeviceAuthorization, DeviceGrantStatus, IssuedPairing, PairingReport, RemotePairingStatus,
    TokenExchange, Transport,
};
use secrecy::{ExposeSecret, SecretString};

/// One transport call as the engine made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    IssuePairing,
    PairingStatus { session_token: String },
    IssueDevice { challenge: String },
    DeviceStatus { device_code: String },
    Exchange { device_code: String, verifier: String },
}

/// A queued response plus an optional delay before it is returned.
struct Step<T> {
    delay: Duration,
    result: Result<T, AuthError>,
}

/// Transport that replays queued responses and records every call.
///
/// Empty queues fall back to: a freshly numbered pairing session, `Waiting`,
/// a device code without interval hint, `Pending`, and `Pending`.
#[derive(Default)]
pub struct ScriptedTransport {
    pairing_issues: Mutex<VecDeque<Step<IssuedPairing>>>,
    pairing_statuses: Mutex<VecDeque<Step<PairingReport>>>,
    device_issues: Mutex<VecDeque<Step<DeviceAuthorization>>>,
    device_statuses: Mutex<VecDeque<Step<DeviceGrantStatus>>>,
    exchanges: Mutex<VecDeque<Step<TokenExchange>>>,
    calls: Mutex<Vec<Call>>,
    sessions_issued: AtomicU32,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_pairing_issue(&self, result: Result<IssuedPairing, AuthError>) -> &Self {
        push(&self.pairing_issues, Duration::ZERO, result);
        self
    }

    pub fn push_pairing_status(&self, result: Result<PairingReport, AuthError>) -> &Self {
        push(&self.pairing_statuses, Duration::ZERO, result);
        self
    }

    pub fn push_pairing_status_after(
        &self,
        delay: Duration,
        result: Result<PairingReport, AuthError>,
    ) -> &Self {
        push(&self.pairing_statuses, delay, result);
        self
    }

    pub fn push_device_issue(&self, result: Result<DeviceAuthorization, AuthError>) -> &Self {
        push(&self.device_issues, Duration::ZERO, result);
        self
    }

    pub fn push_device_status(&self, result: Result<DeviceGrantStatus, AuthError>) -> &Self {
        push(&self.device_statuses, Duration::ZERO, result);
        self
    }

    pub fn push_device_status_after(
        &self,
        delay: Duration,
        result: Result<DeviceGrantStatus, AuthError>,
    ) -> &Self {
        push(&self.device_statuses, delay, result);
        self
    }

    pub fn push_exchange(&self, result: Result<TokenExchange, AuthError>) -> &Self {
        push(&self.exchanges, Duration::ZERO, result);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn push<T>(queue: &Mutex<VecDeque<Step<T>>>, delay: Duration, result: Result<T, AuthError>) {
    queue.lock().unwrap().push_back(Step { delay, result });
}

async fn pop_or<T>(
    queue: &Mutex<VecDeque<Step<T>>>,
    fallback: impl FnOnce() -> Result<T, AuthError>,
) -> Result<T, AuthError> {
    let step = queue.lock().unwrap().pop_front();
    match step {
        Some(step) => {
            if !step.delay.is_zero() {
                tokio::time::sleep(step.delay).await;
            }
            step.result
        }
        None => fallback(),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn issue_pairing_session(&self) -> Result<IssuedPairing, AuthError> {
        self.record(Call::IssuePairing);
        let n = self.sessions_issued.fetch_add(1, Ordering::SeqCst) + 1;
        pop_or(&self.pairing_issues, || Ok(issued(&format!("session-{n}"), &format!("code-{n}"))))
            .await
    }

    async fn check_pairing_status(
        &self,
        session_token: &SecretString,
    ) -> Result<PairingReport, AuthError> {
        self.record(Call::PairingStatus {
            session_token: session_token.expose_secret().clone(),
        });
        pop_or(&self.pairing_statuses, || {
            Ok(PairingReport::new(RemotePairingStatus::Waiting))
        })
        .await
    }

    async fn issue_device_authorization(
        &self,
        _context: &ClientContext,
        challenge: &CodeChallenge,
    ) -> Result<DeviceAuthorization, AuthError> {
        self.record(Call::IssueDevice {
            challenge: challenge.as_str().to_string(),
        });
        pop_or(&self.device_issues, || Ok(device_authorization(None))).await
    }

    async fn check_device_authorization(
        &self,
        _context: &ClientContext,
        device_code: &str,
    ) -> Result<DeviceGrantStatus, AuthError> {
        self.record(Call::DeviceStatus {
            device_code: device_code.to_string(),
        });
        pop_or(&self.device_statuses, || Ok(DeviceGrantStatus::Pending)).await
    }

    async fn exchange_device_token(
        &self,
        _context: &ClientContext,
        device_code: &str,
        code_verifier: &CodeVerifier,
    ) -> Result<TokenExchange, AuthError> {
        self.record(Call::Exchange {
            device_code: device_code.to_string(),
            verifier: code_verifier.expose().to_string(),
        });
        pop_or(&self.exchanges, || Ok(TokenExchange::Pending)).await
    }
}

pub fn issued(session_token: &str, display_code: &str) -> IssuedPairing {
    IssuedPairing {
        session_token: SecretString::new(session_token.to_string()),
        display_code: display_code.to_string(),
        ttl: Some(Duration::from_secs(120)),
    }
}

pub fn device_authorization(interval_secs: Option<u64>) -> DeviceAuthorization {
    DeviceAuthorization {
        device_code: "device-code-1".to_string(),
        user_code: "WDJB-MJHT".to_string(),
        verification_uri: "https://example.com/device".to_string(),
        verification_uri_complete: Some("https://example.com/device?user_code=WDJB-MJHT".to_string()),
        interval: interval_secs.map(Duration::from_secs),
        expires_in: Duration::from_secs(600),
    }
}

pub fn credential(identity: &str) -> Credential {
    Credential::new(identity, SecretString::new(format!("access-{identity}")))
}

pub fn client() -> ClientContext {
    ClientContext::builder()
        .client_id("test-client")
        .scopes(vec!["files.read".to_string()])
        .build()
}

/// Credential sink backed by a map.
#[derive(Default)]
pub struct InMemorySink {
    credentials: Mutex<BTreeMap<String, Credential>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialSink for InMemorySink {
    fn load(&self, account: &str) -> Result<Option<Credential>, AuthError> {
        Ok(self
            .credentials
            .lock()
            .unwrap()
            .get(account)
            .map(Credential::duplicate))
    }

    fn save(&self, account: &str, credential: &Credential) -> Result<(), AuthError> {
        self.credentials
            .lock()
            .unwrap()
            .insert(account.to_string(), credential.duplicate());
        Ok(())
    }

    fn clear(&self, account: &str) -> Result<(), AuthError> {
        self.credentials.lock().unwrap().remove(account);
        Ok(())
    }

    fn accounts(&self) -> Result<Vec<String>, AuthError> {
        Ok(self.credentials.lock().unwrap().keys().cloned().collect())
    }
}

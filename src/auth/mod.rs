//! Account linking: session-code pairing and OAuth device authorization.

pub mod credential;
pub mod device_code;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod pairing;
pub mod pkce;
pub mod polling;
pub mod store;
pub mod transport;

pub use credential::Credential;
pub use device_code::{DeviceAuthStatus, DeviceAuthorizationFlow, DeviceStep};
pub use engine::{AuthEngine, EngineOptions};
pub use error::AuthError;
pub use events::{AuthEvent, AuthEvents, ExpiryCause, FlowKind, PairingEvent, PairingEvents};
pub use http::HttpTransport;
pub use pairing::{PairingSession, PairingStatus, PairingTransition};
pub use pkce::{CodeChallenge, CodeVerifier};
pub use polling::{LoopEnd, PollConfig, PollHandle, PollTask, PollingLoop};
pub use store::{CredentialSink, FileCredentialStore};
pub use transport::{
    ClientContext, DeviceAuthorization, DeviceGrantStatus, IssuedPairing, PairingReport,
    RemotePairingStatus, TokenExchange, Transport,
};

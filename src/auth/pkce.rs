//! PKCE (RFC 7636) verifier and S256 challenge.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

/// Client-generated PKCE secret. Sent once, with the final token exchange.
///
/// `Debug` is redacted and the value is zeroized on drop.
#[derive(Debug)]
pub struct CodeVerifier(SecretString);

impl CodeVerifier {
    /// 32 random bytes, base64url without padding (43 characters).
    pub fn generate() -> Self {
        let mut buf = [0u8; 32];
        for chunk in buf.chunks_mut(16) {
            let id = uuid::Uuid::new_v4();
            let bytes = id.as_bytes();
            let len = chunk.len().min(16);
            chunk[..len].copy_from_slice(&bytes[..len]);
        }
        Self(SecretString::new(URL_SAFE_NO_PAD.encode(buf)))
    }

    pub fn from_secret(verifier: SecretString) -> Self {
        Self(verifier)
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn challenge(&self) -> CodeChallenge {
        let digest = Sha256::digest(self.expose().as_bytes());
        CodeChallenge(URL_SAFE_NO_PAD.encode(digest))
    }
}

/// Public half of the PKCE pair, sent when the device code is issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChallenge(String);

impl CodeChallenge {
    pub const METHOD: &'static str = "S256";

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};

/// Long-lived credentials produced by a successful link.
///
/// Secret fields are zeroized on drop and redacted from `Debug`. The engine
/// moves each credential to its caller exactly once and keeps no copy.
///
/// # Example
/// ```no_run
/// use pairlink::auth::Credential;
/// use secrecy::SecretString;
///
/// let credential = Credential::new("user-42", SecretString::new("access".to_string()))
///     .with_scopes(vec!["files.read".to_string()])
///     .with_metadata("space", "personal");
/// assert_eq!(credential.identity_id, "user-42");
/// ```
#[derive(Debug)]
pub struct Credential {
    pub identity_id: String,
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    /// Space/scope details reported by the service (quota tier, drive id, ...).
    pub metadata: BTreeMap<String, String>,
}

impl Credential {
    pub fn new(identity_id: impl Into<String>, access_token: SecretString) -> Self {
        Self {
            identity_id: identity_id.into(),
            access_token,
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: SecretString) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| exp <= Utc::now()).unwrap_or(false)
    }

    /// Duplicate the credential, secrets included. Only sinks should need this.
    pub fn duplicate(&self) -> Self {
        Self {
            identity_id: self.identity_id.clone(),
            access_token: SecretString::new(self.access_token.expose_secret().clone()),
            refresh_token: self
                .refresh_token
                .as_ref()
                .map(|t| SecretString::new(t.expose_secret().clone())),
            expires_at: self.expires_at,
            scopes: self.scopes.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_tokens() {
        let credential = Credential::new("id-1", SecretString::new("super-secret".to_string()))
            .with_refresh_token(SecretString::new("refresh-secret".to_string()));
        let rendered = format!("{credential:?}");
        assert!(rendered.contains("id-1"));
        assert!(!rendered.contains("super-secret"));
        assert!(!rendered.contains("refresh-secret"));
    }

    #[test]
    fn expiry_is_checked_against_now() {
        let fresh = Credential::new("id", SecretString::new("a".to_string()))
            .with_expires_at(Utc::now() + chrono::Duration::hours(1));
        let stale = Credential::new("id", SecretString::new("a".to_string()))
            .with_expires_at(Utc::now() - chrono::Duration::seconds(1));
        let open_ended = Credential::new("id", SecretString::new("a".to_string()));
        assert!(!fresh.is_expired());
        assert!(stale.is_expired());
        assert!(!open_ended.is_expired());
    }
}

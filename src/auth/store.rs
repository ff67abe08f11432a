use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::credential::Credential;
use super::error::AuthError;

/// Destination for the credential a successful link produces.
///
/// The engine never writes here; callers hand the terminal credential over.
pub trait CredentialSink: Send + Sync {
    fn load(&self, account: &str) -> Result<Option<Credential>, AuthError>;
    fn save(&self, account: &str, credential: &Credential) -> Result<(), AuthError>;
    fn clear(&self, account: &str) -> Result<(), AuthError>;
    /// Labels of every stored account, sorted.
    fn accounts(&self) -> Result<Vec<String>, AuthError>;
}

/// File-backed credential store, one TOML file per account label.
///
/// # Example
/// ```no_run
/// use pairlink::auth::{Credential, CredentialSink, FileCredentialStore};
/// use secrecy::SecretString;
///
/// let store = FileCredentialStore::new_default();
/// let credential = Credential::new("user-42", SecretString::new("access".to_string()));
/// store.save("default", &credential)?;
/// # Ok::<(), pairlink::auth::AuthError>(())
/// ```
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    base_dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn new_default() -> Self {
        Self {
            base_dir: default_pairlink_dir(),
        }
    }

    pub fn default_dir() -> PathBuf {
        default_pairlink_dir()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn credential_path(&self, account: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.toml", normalize_label(account)))
    }

    fn ensure_parent(path: &Path) -> Result<(), AuthError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl CredentialSink for FileCredentialStore {
    fn load(&self, account: &str) -> Result<Option<Credential>, AuthError> {
        let path = self.credential_path(account);
        let raw = match fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AuthError::Io(err.to_string())),
        };
        let file: CredentialFile = toml::from_str(&raw)?;
        Ok(Some(file.credential.into_credential()))
    }

    fn save(&self, account: &str, credential: &Credential) -> Result<(), AuthError> {
        let path = self.credential_path(account);
        Self::ensure_parent(&path)?;
        let file = CredentialFile {
            version: 1,
            account: account.to_string(),
            saved_at: Utc::now(),
            credential: CredentialRecord::from_credential(credential),
        };
        let serialized = toml::to_string(&file)?;
        fs::write(&path, serialized)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        tracing::debug!(account, path = %path.display(), "credential saved");
        Ok(())
    }

    fn clear(&self, account: &str) -> Result<(), AuthError> {
        let path = self.credential_path(account);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AuthError::Io(err.to_string())),
        }
    }

    fn accounts(&self) -> Result<Vec<String>, AuthError> {
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(AuthError::Io(err.to_string())),
        };
        let mut accounts = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                accounts.push(stem.to_string());
            }
        }
        accounts.sort();
        Ok(accounts)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CredentialFile {
    version: u32,
    account: String,
    saved_at: DateTime<Utc>,
    credential: CredentialRecord,
}

/// On-disk shape; the only place secrets leave their wrappers.
#[derive(Serialize, Deserialize)]
struct CredentialRecord {
    identity_id: String,
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("identity_id", &self.identity_id)
            .field("access_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl CredentialRecord {
    fn from_credential(credential: &Credential) -> Self {
        Self {
            identity_id: credential.identity_id.clone(),
            access_token: credential.access_token.expose_secret().clone(),
            refresh_token: credential
                .refresh_token
                .as_ref()
                .map(|t| t.expose_secret().clone()),
            expires_at: credential.expires_at,
            scopes: credential.scopes.clone(),
            metadata: credential.metadata.clone(),
        }
    }

    fn into_credential(self) -> Credential {
        let mut credential = Credential::new(self.identity_id, SecretString::new(self.access_token))
            .with_scopes(self.scopes);
        if let Some(refresh) = self.refresh_token {
            credential = credential.with_refresh_token(SecretString::new(refresh));
        }
        if let Some(expires_at) = self.expires_at {
            credential = credential.with_expires_at(expires_at);
        }
        credential.metadata = self.metadata;
        credential
    }
}

fn default_pairlink_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".pairlink"))
        .unwrap_or_else(|| PathBuf::from(".pairlink"))
}

fn normalize_label(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "default".to_string();
    }
    let out: String = trimmed
        .chars()
        .map(|ch| {
            let lower = ch.to_ascii_lowercase();
            if lower.is_ascii_alphanumeric() || lower == '-' || lower == '_' {
                lower
            } else {
                '-'
            }
        })
        .collect();
    if out.trim_matches('-').is_empty() {
        "default".to_string()
    } else {
        out
    }
}

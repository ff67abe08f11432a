//! Configuration system (layered: builder > env > config file > defaults).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::auth::{
    ClientContext, EngineOptions, FileCredentialStore, HttpTransport, PollConfig,
};
use crate::error::{PairlinkError, Result};
use crate::util::retry::RetryPolicy;

pub const ENV_BASE_URL: &str = "PAIRLINK_BASE_URL";
pub const ENV_CLIENT_ID: &str = "PAIRLINK_CLIENT_ID";
pub const ENV_SCOPE: &str = "PAIRLINK_SCOPE";
pub const ENV_POLL_INTERVAL_MS: &str = "PAIRLINK_POLL_INTERVAL_MS";
pub const ENV_POLL_MAX_ATTEMPTS: &str = "PAIRLINK_POLL_MAX_ATTEMPTS";
pub const ENV_HOME: &str = "PAIRLINK_HOME";

const DEFAULT_CLIENT_ID: &str = "pairlink-cli";
const CONFIG_FILE_NAME: &str = "config.toml";

/// Resolved settings for linking accounts.
///
/// Resolution order, lowest first:
/// 1. Built-in defaults
/// 2. `config.toml` in the pairlink home directory (or an explicit file)
/// 3. `PAIRLINK_*` environment variables (a `.env` file is loaded first)
/// 4. Explicit `with_*` calls
///
/// # Example
/// ```no_run
/// use pairlink::config::PairlinkConfig;
///
/// let config = PairlinkConfig::load()?
///     .with_base_url("https://storage.example.com/api");
/// let transport = config.transport()?;
/// # Ok::<(), pairlink::error::PairlinkError>(())
/// ```
#[derive(Clone, PartialEq)]
pub struct PairlinkConfig {
    base_url: Option<String>,
    client_id: String,
    scopes: Vec<String>,
    device_name: Option<String>,
    pairing_poll: PollConfig,
    device_poll: PollConfig,
    issue_retry: RetryPolicy,
    max_pairing_restarts: Option<u32>,
    home: PathBuf,
}

impl fmt::Debug for PairlinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairlinkConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("scopes", &self.scopes)
            .field("pairing_poll", &self.pairing_poll)
            .field("device_poll", &self.device_poll)
            .field("home", &self.home)
            .finish_non_exhaustive()
    }
}

impl Default for PairlinkConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            scopes: Vec::new(),
            device_name: None,
            pairing_poll: PollConfig::default(),
            device_poll: PollConfig::default(),
            issue_retry: RetryPolicy::default(),
            max_pairing_restarts: None,
            home: FileCredentialStore::default_dir(),
        }
    }
}

impl PairlinkConfig {
    /// Defaults, then the home config file if present, then the environment.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let lookup = |key: &str| std::env::var(key).ok();

        let mut config = Self::default();
        if let Some(home) = lookup(ENV_HOME) {
            config.home = PathBuf::from(home);
        }
        let file = config.home.join(CONFIG_FILE_NAME);
        if file.exists() {
            config = config.merge_file(&file)?;
        }
        config.apply_env(lookup)
    }

    /// Defaults plus one explicit TOML file; the environment is not consulted.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::default().merge_file(path.as_ref())
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Self::default().merge_toml(raw)
    }

    fn merge_file(self, path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        self.merge_toml(&raw).map_err(|e| {
            PairlinkError::Configuration(format!("{}: {e}", path.display()))
        })
    }

    fn merge_toml(mut self, raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw)
            .map_err(|e| PairlinkError::Configuration(e.to_string()))?;

        if let Some(base_url) = file.base_url {
            self.base_url = Some(base_url);
        }
        if let Some(client_id) = file.client_id {
            self.client_id = client_id;
        }
        if let Some(scopes) = file.scopes {
            self.scopes = scopes;
        }
        if let Some(device_name) = file.device_name {
            self.device_name = Some(device_name);
        }
        if let Some(home) = file.home {
            self.home = home;
        }
        if let Some(poll) = file.pairing_poll {
            self.pairing_poll = poll.resolve(self.pairing_poll)?;
        }
        if let Some(poll) = file.device_poll {
            self.device_poll = poll.resolve(self.device_poll)?;
        }
        if let Some(retry) = file.retry {
            if let Some(max_attempts) = retry.max_attempts {
                self.issue_retry.max_attempts = max_attempts;
            }
            if let Some(ms) = retry.initial_backoff_ms {
                self.issue_retry.initial_backoff = Duration::from_millis(ms);
            }
            if let Some(ms) = retry.max_backoff_ms {
                self.issue_retry.max_backoff = Duration::from_millis(ms);
            }
        }
        if file.max_pairing_restarts.is_some() {
            self.max_pairing_restarts = file.max_pairing_restarts;
        }
        Ok(self)
    }

    /// Overlay `PAIRLINK_*` values read through `lookup`.
    ///
    /// The poll variables apply to both flows.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.base_url = Some(url);
        }
        if let Some(client_id) = lookup(ENV_CLIENT_ID) {
            self.client_id = client_id;
        }
        if let Some(scope) = lookup(ENV_SCOPE) {
            self.scopes = split_scopes(&scope);
        }
        if let Some(home) = lookup(ENV_HOME) {
            self.home = PathBuf::from(home);
        }

        let interval = lookup(ENV_POLL_INTERVAL_MS)
            .map(|raw| parse_number::<u64>(ENV_POLL_INTERVAL_MS, &raw))
            .transpose()?
            .map(Duration::from_millis);
        let max_attempts = lookup(ENV_POLL_MAX_ATTEMPTS)
            .map(|raw| parse_number::<u32>(ENV_POLL_MAX_ATTEMPTS, &raw))
            .transpose()?;
        if interval.is_some() || max_attempts.is_some() {
            self.pairing_poll = override_poll(self.pairing_poll, interval, max_attempts)?;
            self.device_poll = override_poll(self.device_poll, interval, max_attempts)?;
        }
        Ok(self)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = Some(name.into());
        self
    }

    pub fn with_pairing_poll(mut self, poll: PollConfig) -> Self {
        self.pairing_poll = poll;
        self
    }

    pub fn with_device_poll(mut self, poll: PollConfig) -> Self {
        self.device_poll = poll;
        self
    }

    pub fn with_issue_retry(mut self, retry: RetryPolicy) -> Self {
        self.issue_retry = retry;
        self
    }

    pub fn with_max_pairing_restarts(mut self, max: Option<u32>) -> Self {
        self.max_pairing_restarts = max;
        self
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn pairing_poll(&self) -> PollConfig {
        self.pairing_poll
    }

    pub fn device_poll(&self) -> PollConfig {
        self.device_poll
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            pairing_poll: self.pairing_poll,
            device_poll: self.device_poll,
            issue_retry: self.issue_retry.clone(),
            max_pairing_restarts: self.max_pairing_restarts,
        }
    }

    pub fn client_context(&self) -> ClientContext {
        ClientContext::builder()
            .client_id(self.client_id.clone())
            .scopes(self.scopes.clone())
            .maybe_device_name(self.device_name.clone())
            .build()
    }

    pub fn transport(&self) -> Result<HttpTransport> {
        let base_url = self.base_url.as_deref().ok_or_else(|| {
            PairlinkError::Configuration(format!("{ENV_BASE_URL} is not set"))
        })?;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(PairlinkError::Configuration(format!(
                "base URL must be http(s): {base_url}"
            )));
        }
        Ok(HttpTransport::new(base_url))
    }

    pub fn credential_store(&self) -> FileCredentialStore {
        FileCredentialStore::new(self.home.join("accounts"))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    base_url: Option<String>,
    client_id: Option<String>,
    scopes: Option<Vec<String>>,
    device_name: Option<String>,
    home: Option<PathBuf>,
    max_pairing_restarts: Option<u32>,
    pairing_poll: Option<PollSection>,
    device_poll: Option<PollSection>,
    retry: Option<RetrySection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PollSection {
    interval_ms: Option<u64>,
    max_attempts: Option<u32>,
}

impl PollSection {
    fn resolve(self, current: PollConfig) -> Result<PollConfig> {
        override_poll(
            current,
            self.interval_ms.map(Duration::from_millis),
            self.max_attempts,
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrySection {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

fn override_poll(
    current: PollConfig,
    interval: Option<Duration>,
    max_attempts: Option<u32>,
) -> Result<PollConfig> {
    PollConfig::new(
        interval.unwrap_or(current.interval()),
        max_attempts.unwrap_or(current.max_attempts()),
    )
    .map_err(PairlinkError::from)
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| PairlinkError::Configuration(format!("{key} must be a number, got '{raw}'")))
}

fn split_scopes(raw: &str) -> Vec<String> {
    raw.split([' ', ','])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

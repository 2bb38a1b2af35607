//! Connection settings and the resume cursor store.
//!
//! The reader never owns configuration. It asks a [`SettingsProvider`] for a
//! fresh [`Settings`] snapshot at the start of every connection attempt and
//! reads/writes the resume cursor through the same provider.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use reqwest::Url;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Required configuration is missing or unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("no endpoint url configured")]
    MissingUrl,

    #[error("no topics configured")]
    MissingTopics,

    #[error("invalid endpoint url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Raised by the settings form only; the reader resolves both by precedence.
    #[error("provide either username and password or an access token, not both")]
    AmbiguousAuth,
}

/// The settings store could not be read or written.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("settings store unavailable: {0}")]
    Unavailable(String),

    #[error("refusing to save settings: {0}")]
    Invalid(#[from] ConfigurationError),
}

/// Raw settings as stored by the settings form.
///
/// Empty strings mean "not set". `topics` is the comma separated list typed
/// by the user.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub url: String,
    pub access_token: Option<SecretString>,
    pub username: String,
    pub password: Option<SecretString>,
    pub topics: String,
}

impl Settings {
    /// Topic names split on `,` with whitespace trimmed and empties dropped.
    pub fn topic_list(&self) -> Vec<String> {
        self.topics
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Validates the snapshot into the parameters of one connection attempt.
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConfigurationError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(ConfigurationError::MissingUrl);
        }
        let topics = self.topic_list();
        if topics.is_empty() {
            return Err(ConfigurationError::MissingTopics);
        }

        let base_url = url.trim_end_matches('/').to_string();
        Url::parse(&base_url).map_err(|err| ConfigurationError::InvalidUrl {
            url: base_url.clone(),
            reason: err.to_string(),
        })?;

        Ok(ConnectionConfig {
            base_url,
            topics,
            access_token: non_empty_secret(self.access_token.as_ref()),
            username: Some(self.username.clone()).filter(|name| !name.is_empty()),
            password: non_empty_secret(self.password.as_ref()),
        })
    }
}

fn non_empty_secret(secret: Option<&SecretString>) -> Option<SecretString> {
    secret
        .filter(|value| !value.expose_secret().is_empty())
        .cloned()
}

/// Validated parameters of one connection attempt.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Endpoint base url without trailing slash.
    pub base_url: String,
    /// Non-empty list of topic names.
    pub topics: Vec<String>,
    pub access_token: Option<SecretString>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

impl ConnectionConfig {
    /// Subscription url for the given resume cursor.
    ///
    /// The `since` parameter is omitted when no cursor has been stored yet.
    pub fn subscription_url(&self, since: Option<u64>) -> String {
        let mut url = format!("{}/{}/sse", self.base_url, self.topics.join(","));
        if let Some(since) = since {
            url.push_str(&format!("?since={since}"));
        }
        url
    }

    /// Resolves the authentication scheme. A token wins over credentials.
    pub fn auth(&self) -> AuthScheme {
        if let Some(token) = self.access_token.as_ref() {
            return AuthScheme::Bearer(token.clone());
        }
        match (self.username.as_ref(), self.password.as_ref()) {
            (Some(username), Some(password)) => AuthScheme::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => AuthScheme::None,
        }
    }
}

/// Authentication attached to the subscription request.
#[derive(Clone, Debug)]
pub enum AuthScheme {
    /// `Authorization: Basic base64(username:password)`
    Basic {
        username: String,
        password: SecretString,
    },
    /// `Authorization: Bearer <token>`
    Bearer(SecretString),
    None,
}

impl AuthScheme {
    /// Value of the `Authorization` header, if any.
    pub fn header_value(&self) -> Option<String> {
        match self {
            Self::Basic { username, password } => {
                let credentials = format!("{username}:{}", password.expose_secret());
                Some(format!("Basic {}", BASE64_STANDARD.encode(credentials)))
            }
            Self::Bearer(token) => Some(format!("Bearer {}", token.expose_secret())),
            Self::None => None,
        }
    }
}

/// Source of connection settings and keeper of the resume cursor.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    /// Fresh settings snapshot for the next connection attempt.
    async fn settings(&self) -> Result<Settings, SettingsError>;

    /// Stored resume cursor, `None` before the first handled message.
    async fn cursor(&self) -> Result<Option<u64>, SettingsError>;

    /// Persists a new resume cursor.
    async fn set_cursor(&self, cursor: u64) -> Result<(), SettingsError>;
}

/// In-process settings store.
#[derive(Debug, Default)]
pub struct MemorySettingsProvider {
    settings: RwLock<Settings>,
    cursor: RwLock<Option<u64>>,
}

impl MemorySettingsProvider {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            cursor: RwLock::new(None),
        }
    }

    pub fn with_cursor(self, cursor: u64) -> Self {
        if let Ok(mut guard) = self.cursor.write() {
            *guard = Some(cursor);
        }
        self
    }

    /// Replaces the settings seen by the next connection attempt.
    pub fn update(&self, settings: Settings) {
        if let Ok(mut guard) = self.settings.write() {
            *guard = settings;
        }
    }

    pub fn current_cursor(&self) -> Option<u64> {
        self.cursor.read().ok().and_then(|guard| *guard)
    }
}

#[async_trait]
impl SettingsProvider for MemorySettingsProvider {
    async fn settings(&self) -> Result<Settings, SettingsError> {
        self.settings
            .read()
            .map(|guard| guard.clone())
            .map_err(|_| SettingsError::Unavailable("settings lock poisoned".to_string()))
    }

    async fn cursor(&self) -> Result<Option<u64>, SettingsError> {
        self.cursor
            .read()
            .map(|guard| *guard)
            .map_err(|_| SettingsError::Unavailable("cursor lock poisoned".to_string()))
    }

    async fn set_cursor(&self, cursor: u64) -> Result<(), SettingsError> {
        let mut guard = self
            .cursor
            .write()
            .map_err(|_| SettingsError::Unavailable("cursor lock poisoned".to_string()))?;
        *guard = Some(cursor);
        Ok(())
    }
}

/// On-disk document shared by the settings form and the reader.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredSettings {
    #[serde(default)]
    pub url: String,
    #[serde(default, rename = "accessToken")]
    pub access_token: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub topics: String,
    #[serde(
        default,
        rename = "lastMessageTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message_time: Option<u64>,
}

impl StoredSettings {
    /// Checks a settings form the way the save button does and returns the
    /// normalised document.
    ///
    /// Url and topics are required and the url must parse. Exactly one of
    /// username with password or an access token must be given. Topics are
    /// trimmed and re-joined with `,`.
    pub fn validate(&self) -> Result<StoredSettings, ConfigurationError> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(ConfigurationError::MissingUrl);
        }
        let topics = Settings {
            topics: self.topics.clone(),
            ..Settings::default()
        }
        .topic_list();
        if topics.is_empty() {
            return Err(ConfigurationError::MissingTopics);
        }
        Url::parse(url).map_err(|err| ConfigurationError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;

        let access_token = self.access_token.trim();
        let username = self.username.trim();
        let credentials = !username.is_empty() && !self.password.is_empty();
        let nothing_else = username.is_empty() && self.password.is_empty();
        let valid_auth = if access_token.is_empty() {
            credentials
        } else {
            nothing_else
        };
        if !valid_auth {
            return Err(ConfigurationError::AmbiguousAuth);
        }

        Ok(StoredSettings {
            url: url.to_string(),
            access_token: access_token.to_string(),
            username: username.to_string(),
            password: self.password.clone(),
            topics: topics.join(","),
            last_message_time: self.last_message_time,
        })
    }
}

impl From<StoredSettings> for Settings {
    fn from(stored: StoredSettings) -> Self {
        Self {
            url: stored.url,
            access_token: Some(SecretString::new(stored.access_token)),
            username: stored.username,
            password: Some(SecretString::new(stored.password)),
            topics: stored.topics,
        }
    }
}

/// Settings store backed by a JSON file.
///
/// A missing file reads as empty settings. Cursor writes rewrite the whole
/// document through a temp file and rename.
#[derive(Debug)]
pub struct FileSettingsProvider {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSettingsProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored document.
    pub async fn load(&self) -> Result<StoredSettings, SettingsError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(StoredSettings::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(StoredSettings::default())
            }
            Err(err) => Err(SettingsError::Io(err)),
        }
    }

    /// Replaces the stored document as is.
    pub async fn store(&self, stored: &StoredSettings) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().await;
        self.write_document(stored).await
    }

    /// Validates and saves a settings form.
    ///
    /// The resume cursor is reset to the current time, so a reader picking up
    /// the new settings starts with fresh messages instead of the backlog.
    pub async fn save_form(
        &self,
        form: &StoredSettings,
    ) -> Result<StoredSettings, SettingsError> {
        let mut stored = form.validate()?;
        stored.last_message_time = Some(unix_now());
        self.store(&stored).await?;
        info!(event = "settings_saved", topics = %stored.topics);
        Ok(stored)
    }

    async fn write_document(&self, stored: &StoredSettings) -> Result<(), SettingsError> {
        let body = serde_json::to_vec_pretty(stored)?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp_path, body).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[async_trait]
impl SettingsProvider for FileSettingsProvider {
    async fn settings(&self) -> Result<Settings, SettingsError> {
        Ok(self.load().await?.into())
    }

    async fn cursor(&self) -> Result<Option<u64>, SettingsError> {
        Ok(self.load().await?.last_message_time)
    }

    async fn set_cursor(&self, cursor: u64) -> Result<(), SettingsError> {
        let _guard = self.write_lock.lock().await;
        let mut stored = self.load().await?;
        stored.last_message_time = Some(cursor);
        self.write_document(&stored).await
    }
}

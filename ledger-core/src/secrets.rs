//! Read-only access to chat-platform credentials.
//!
//! The ledger never writes secrets. Values are wrapped in [`SecretString`] so
//! they stay out of `Debug` output and logs.

use crate::{CredentialError, LedgerResult};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Prefix used by freshly provisioned secret documents.
pub const PLACEHOLDER_PREFIX: &str = "PLACEHOLDER_";

/// Logical names of the secrets the application needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretName {
    BotToken,
    SigningSecret,
    AppToken,
}

impl SecretName {
    pub const ALL: [SecretName; 3] = [
        SecretName::BotToken,
        SecretName::SigningSecret,
        SecretName::AppToken,
    ];

    /// Key inside the secret document.
    pub fn as_key(&self) -> &'static str {
        match self {
            SecretName::BotToken => "bot_token",
            SecretName::SigningSecret => "signing_secret",
            SecretName::AppToken => "app_token",
        }
    }

    /// Environment variable suffix, e.g. `BOT_TOKEN`.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            SecretName::BotToken => "BOT_TOKEN",
            SecretName::SigningSecret => "SIGNING_SECRET",
            SecretName::AppToken => "APP_TOKEN",
        }
    }
}

impl fmt::Display for SecretName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// A secret value that is redacted when formatted.
#[derive(Clone)]
pub struct Credential(SecretString);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        let value: String = value.into();
        Self(SecretString::new(value.into()))
    }

    /// Expose the secret value (use sparingly, only when handing it to a client).
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn len(&self) -> usize {
        self.0.expose_secret().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.expose_secret().starts_with(PLACEHOLDER_PREFIX)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential([REDACTED, {} chars])", self.len())
    }
}

/// Read-only source of named secrets.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn fetch(&self, name: SecretName) -> LedgerResult<Credential>;
}

fn checked(name: SecretName, value: Credential, source_name: &str) -> LedgerResult<Credential> {
    if value.is_empty() {
        return Err(CredentialError::Missing {
            name: name.to_string(),
            source_name: source_name.to_string(),
        }
        .into());
    }
    if value.is_placeholder() {
        return Err(CredentialError::Placeholder {
            name: name.to_string(),
        }
        .into());
    }
    Ok(value)
}

/// Secrets read from `<prefix><NAME>` environment variables.
#[derive(Debug, Clone)]
pub struct EnvCredentialStore {
    prefix: String,
}

impl Default for EnvCredentialStore {
    fn default() -> Self {
        Self::with_prefix("LEDGER_SLACK_")
    }
}

impl EnvCredentialStore {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn variable_for(&self, name: SecretName) -> String {
        format!("{}{}", self.prefix, name.env_suffix())
    }
}

#[async_trait]
impl CredentialStore for EnvCredentialStore {
    async fn fetch(&self, name: SecretName) -> LedgerResult<Credential> {
        let variable = self.variable_for(name);
        let value = std::env::var(&variable).map_err(|_| CredentialError::Missing {
            name: name.to_string(),
            source_name: variable.clone(),
        })?;
        checked(name, Credential::new(value), &variable)
    }
}

/// Secrets parsed from a JSON document of the form
/// `{"bot_token": "...", "signing_secret": "...", "app_token": "..."}`.
#[derive(Clone)]
pub struct JsonSecretDocument {
    secret_name: String,
    values: HashMap<SecretName, Credential>,
}

impl JsonSecretDocument {
    pub fn parse(secret_name: impl Into<String>, document: &str) -> LedgerResult<Self> {
        let raw: HashMap<String, serde_json::Value> =
            serde_json::from_str(document).map_err(|e| CredentialError::Malformed {
                reason: e.to_string(),
            })?;

        let mut values = HashMap::new();
        for name in SecretName::ALL {
            match raw.get(name.as_key()) {
                None => {}
                Some(serde_json::Value::String(value)) => {
                    values.insert(name, Credential::new(value.clone()));
                }
                Some(_) => {
                    return Err(CredentialError::Malformed {
                        reason: format!("{} must be a string", name),
                    }
                    .into())
                }
            }
        }

        Ok(Self {
            secret_name: secret_name.into(),
            values,
        })
    }
}

impl fmt::Debug for JsonSecretDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonSecretDocument")
            .field("secret_name", &self.secret_name)
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl CredentialStore for JsonSecretDocument {
    async fn fetch(&self, name: SecretName) -> LedgerResult<Credential> {
        let value = self
            .values
            .get(&name)
            .cloned()
            .ok_or_else(|| CredentialError::Missing {
                name: name.to_string(),
                source_name: self.secret_name.clone(),
            })?;
        checked(name, value, &self.secret_name)
    }
}

/// Fixed in-process secrets, mostly for local development.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialStore {
    values: HashMap<SecretName, Credential>,
}

impl StaticCredentialStore {
    pub fn with(mut self, name: SecretName, value: impl Into<String>) -> Self {
        self.values.insert(name, Credential::new(value));
        self
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn fetch(&self, name: SecretName) -> LedgerResult<Credential> {
        let value = self
            .values
            .get(&name)
            .cloned()
            .ok_or_else(|| CredentialError::Missing {
                name: name.to_string(),
                source_name: "static store".to_string(),
            })?;
        checked(name, value, "static store")
    }
}

/// The full credential set used by the chat integration.
#[derive(Debug, Clone)]
pub struct SlackCredentials {
    pub bot_token: Credential,
    pub signing_secret: Credential,
    pub app_token: Credential,
}

impl SlackCredentials {
    pub async fn load(store: &dyn CredentialStore) -> LedgerResult<Self> {
        Ok(Self {
            bot_token: store.fetch(SecretName::BotToken).await?,
            signing_secret: store.fetch(SecretName::SigningSecret).await?,
            app_token: store.fetch(SecretName::AppToken).await?,
        })
    }
}

//! Collaborator boundaries consumed by the relay: credentials, the account
//! directory and the model catalog, plus config-backed implementations used
//! by the CLI driver.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use http::HeaderValue;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::error::RelayError;

const EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Lifecycle status reported by the account directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    #[default]
    Active,
    Expired,
    QuotaLimited,
}

/// One credentialed account the relay may send a request through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCandidate {
    pub id: String,
    /// Opaque handle the credential provider resolves to a token.
    pub credential_ref: String,
    pub status: AccountStatus,
    pub is_default: bool,
    pub project: Option<String>,
}

/// A bearer token plus its expiry, when known.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<SystemTime>,
}

impl AccessToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
        }
    }

    #[must_use]
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at
            .is_some_and(|expires_at| now + EXPIRY_SKEW >= expires_at)
    }
}

/// Token limits and capabilities of one model. Read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimits {
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub tool_calling: bool,
    pub image_input: bool,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return a token for `account`, possibly cached.
    async fn get_token(&self, account: &AccountCandidate) -> Result<AccessToken, RelayError>;

    /// Force a refresh. `Ok(None)` means the account cannot be refreshed.
    async fn refresh(&self, account: &AccountCandidate) -> Result<Option<String>, RelayError>;

    /// Drop any cached token for `account`.
    fn invalidate(&self, _account: &AccountCandidate) {}
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Accounts for a provider key in the directory's preferred order.
    async fn accounts(&self, provider_key: &str) -> Vec<AccountCandidate>;

    async fn mark_quota_limited(&self, account_id: &str, model: &str, resets_at: SystemTime);

    async fn record_outcome(&self, account_id: &str, success: bool);
}

pub trait ModelCatalog: Send + Sync {
    fn limits(&self, model: &str) -> Option<ModelLimits>;
}

/// Build the `Authorization` header value for a token.
///
/// # Errors
///
/// Returns [`RelayError::Auth`] when the token contains bytes that are not
/// valid in a header.
pub fn bearer_header_value(token: &str) -> Result<HeaderValue, RelayError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| RelayError::Auth("token contains invalid header characters".into()))?;
    value.set_sensitive(true);
    Ok(value)
}

// ---------------------------------------------------------------------------
// Config-backed implementations
// ---------------------------------------------------------------------------

/// Tokens read from the `accounts` config section. Cannot refresh.
pub struct StaticCredentials {
    tokens: FxHashMap<String, String>,
}

impl StaticCredentials {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let tokens = config
            .accounts
            .iter()
            .map(|account| (account.id.clone(), account.token.clone()))
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get_token(&self, account: &AccountCandidate) -> Result<AccessToken, RelayError> {
        self.tokens
            .get(&account.credential_ref)
            .map(AccessToken::new)
            .ok_or_else(|| RelayError::Auth(format!("no token for account '{}'", account.id)))
    }

    async fn refresh(&self, account: &AccountCandidate) -> Result<Option<String>, RelayError> {
        tracing::warn!(
            account = %account.id,
            "static credentials cannot be refreshed"
        );
        Ok(None)
    }
}

/// In-memory directory seeded from config. Quota marks and outcomes only
/// update the in-memory status.
pub struct StaticAccountDirectory {
    accounts: RwLock<Vec<AccountCandidate>>,
}

impl StaticAccountDirectory {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let accounts = config
            .accounts
            .iter()
            .map(|account| AccountCandidate {
                id: account.id.clone(),
                credential_ref: account.id.clone(),
                status: account.status,
                is_default: account.is_default,
                project: account.project.clone(),
            })
            .collect();
        Self {
            accounts: RwLock::new(accounts),
        }
    }
}

#[async_trait]
impl AccountDirectory for StaticAccountDirectory {
    async fn accounts(&self, _provider_key: &str) -> Vec<AccountCandidate> {
        self.accounts.read().clone()
    }

    async fn mark_quota_limited(&self, account_id: &str, model: &str, resets_at: SystemTime) {
        let reset_in = resets_at
            .duration_since(SystemTime::now())
            .unwrap_or_default();
        tracing::info!(
            account = %account_id,
            model = %model,
            reset_in_secs = reset_in.as_secs(),
            "account marked quota-limited"
        );
        if let Some(account) = self.accounts.write().iter_mut().find(|a| a.id == account_id) {
            account.status = AccountStatus::QuotaLimited;
        }
    }

    async fn record_outcome(&self, account_id: &str, success: bool) {
        if !success {
            return;
        }
        if let Some(account) = self.accounts.write().iter_mut().find(|a| a.id == account_id) {
            account.status = AccountStatus::Active;
        }
    }
}

/// Model limits from the `models` config section.
pub struct StaticModelCatalog {
    models: FxHashMap<String, ModelLimits>,
}

impl StaticModelCatalog {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        let models = config
            .models
            .iter()
            .map(|model| {
                (
                    model.id.clone(),
                    ModelLimits {
                        max_input_tokens: model.max_input_tokens,
                        max_output_tokens: model.max_output_tokens,
                        tool_calling: model.tool_calling,
                        image_input: model.image_input,
                    },
                )
            })
            .collect();
        Self { models }
    }
}

impl ModelCatalog for StaticModelCatalog {
    fn limits(&self, model: &str) -> Option<ModelLimits> {
        self.models.get(model).copied()
    }
}

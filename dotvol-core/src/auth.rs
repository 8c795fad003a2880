//! Authentication and identity management
//!
//! Users live in the metadata store. A caller authenticates with its user
//! name plus either its API key or its password:
//! - API keys are the normal credential for every call
//! - the password is only required to rotate the API key
//!
//! Rotating the key rewrites the user record, so the old key stops
//! authenticating as soon as the write lands.

use crate::error::{DotError, Result};
use crate::store::{keys, read_json, write_json, CasOutcome, Expect, MetadataStore};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Which credential a caller presented
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    ApiKey,
    Password,
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub name: String,
    pub method: AuthMethod,
    pub admin: bool,
}

/// Authentication result
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    /// Authentication successful
    Success(AuthenticatedUser),
    /// Authentication failed
    Failed,
    /// Authentication error (e.g., store unavailable)
    Error(String),
}

/// Authentication provider trait
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Authenticate a user with an API key or password
    async fn authenticate(&self, username: &str, secret: &str) -> AuthResult;
}

/// Stored user account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub api_key: String,
    pub admin: bool,
    pub created_at: i64,
}

/// Public view of an account, as returned by `CurrentUser`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    /// Hex MD5 of the normalized email (avatar lookups)
    pub email_hash: String,
}

impl From<&UserRecord> for UserInfo {
    fn from(record: &UserRecord) -> Self {
        let normalized = record.email.trim().to_lowercase();
        Self {
            id: record.id,
            name: record.name.clone(),
            email: record.email.clone(),
            email_hash: format!("{:x}", md5::compute(normalized.as_bytes())),
        }
    }
}

/// Generate a fresh random API key
pub fn generate_api_key() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compare a presented API key with the stored one in constant time
///
/// Both sides are hashed first and the fold has no early exit.
pub fn api_key_matches(presented: &str, stored: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(stored.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

/// Store-backed user directory
pub struct UserDirectory {
    store: Arc<dyn MetadataStore>,
    bcrypt_cost: u32,
}

impl UserDirectory {
    pub fn new(store: Arc<dyn MetadataStore>, bcrypt_cost: u32) -> Self {
        Self { store, bcrypt_cost }
    }

    /// Create an account; fails if the name is taken
    pub async fn register(&self, name: &str, email: &str, password: &str, admin: bool) -> Result<UserRecord> {
        self.register_with_key(name, email, password, generate_api_key(), admin)
            .await
    }

    async fn register_with_key(
        &self,
        name: &str,
        email: &str,
        password: &str,
        api_key: String,
        admin: bool,
    ) -> Result<UserRecord> {
        // Namespaces are user names, so they follow the same rules
        crate::name::VolumeName::new(name, "x")
            .map_err(|_| DotError::InvalidName(name.to_string()))?;
        if password.is_empty() {
            return Err(DotError::Unauthorized("password must not be empty".to_string()));
        }

        let password_hash = bcrypt::hash(password, self.bcrypt_cost).map_err(DotError::internal)?;
        let record = UserRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            password_hash,
            api_key,
            admin,
            created_at: chrono::Utc::now().timestamp(),
        };

        match write_json(self.store.as_ref(), &keys::user(name), Expect::Absent, &record).await? {
            CasOutcome::Applied(_) => {
                tracing::info!("Registered user {}", name);
                Ok(record)
            }
            CasOutcome::Conflict(_) => Err(DotError::AlreadyExists(format!("user {}", name))),
        }
    }

    /// Make sure the admin account exists, creating it on first start
    pub async fn ensure_admin(
        &self,
        name: &str,
        password: Option<&str>,
        api_key: Option<&str>,
    ) -> Result<UserRecord> {
        if let Some((record, _)) = read_json::<UserRecord>(self.store.as_ref(), &keys::user(name)).await? {
            return Ok(record);
        }
        let password = match password {
            Some(p) => p.to_string(),
            None => generate_api_key(),
        };
        let api_key = api_key.map(str::to_string).unwrap_or_else(generate_api_key);
        match self
            .register_with_key(name, "", &password, api_key, true)
            .await
        {
            Ok(record) => Ok(record),
            // Another node bootstrapped it first
            Err(DotError::AlreadyExists(_)) => self.get(name).await,
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, name: &str) -> Result<UserRecord> {
        read_json::<UserRecord>(self.store.as_ref(), &keys::user(name))
            .await?
            .map(|(record, _)| record)
            .ok_or_else(|| DotError::NoSuchUser(name.to_string()))
    }

    pub async fn get_api_key(&self, user: &AuthenticatedUser) -> Result<String> {
        Ok(self.get(&user.name).await?.api_key)
    }

    /// Replace the caller's API key; only allowed with password auth
    pub async fn reset_api_key(&self, user: &AuthenticatedUser) -> Result<String> {
        if user.method != AuthMethod::Password {
            return Err(DotError::Unauthorized(
                "resetting the API key requires the account password".to_string(),
            ));
        }

        let key = keys::user(&user.name);
        let (mut record, revision) = read_json::<UserRecord>(self.store.as_ref(), &key)
            .await?
            .ok_or_else(|| DotError::NoSuchUser(user.name.clone()))?;
        record.api_key = generate_api_key();

        match write_json(self.store.as_ref(), &key, Expect::Revision(revision), &record).await? {
            CasOutcome::Applied(_) => {
                tracing::info!("Rotated API key for {}", user.name);
                Ok(record.api_key)
            }
            CasOutcome::Conflict(_) => Err(DotError::internal(format!(
                "user {} was modified concurrently",
                user.name
            ))),
        }
    }

    pub async fn current_user(&self, user: &AuthenticatedUser) -> Result<UserInfo> {
        Ok(UserInfo::from(&self.get(&user.name).await?))
    }

    /// Authenticate or fail with [`DotError::Unauthorized`]
    pub async fn require(&self, username: &str, secret: &str) -> Result<AuthenticatedUser> {
        match self.authenticate(username, secret).await {
            AuthResult::Success(user) => Ok(user),
            AuthResult::Failed => Err(DotError::Unauthorized(format!(
                "invalid credentials for {}",
                username
            ))),
            AuthResult::Error(e) => Err(DotError::Internal(e)),
        }
    }
}

#[async_trait]
impl AuthProvider for UserDirectory {
    async fn authenticate(&self, username: &str, secret: &str) -> AuthResult {
        if username.is_empty() || secret.is_empty() {
            return AuthResult::Failed;
        }

        let record = match read_json::<UserRecord>(self.store.as_ref(), &keys::user(username)).await {
            Ok(Some((record, _))) => record,
            Ok(None) => return AuthResult::Failed,
            Err(e) => return AuthResult::Error(e.to_string()),
        };

        if api_key_matches(secret, &record.api_key) {
            return AuthResult::Success(AuthenticatedUser {
                name: record.name,
                method: AuthMethod::ApiKey,
                admin: record.admin,
            });
        }

        match bcrypt::verify(secret, &record.password_hash) {
            Ok(true) => AuthResult::Success(AuthenticatedUser {
                name: record.name,
                method: AuthMethod::Password,
                admin: record.admin,
            }),
            Ok(false) => AuthResult::Failed,
            Err(e) => AuthResult::Error(e.to_string()),
        }
    }
}

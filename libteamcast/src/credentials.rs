//! Credential vault
//!
//! OAuth tokens are stored in `social_tokens`, one row per account, with the
//! access and refresh tokens each encrypted as an `age` file to an X25519
//! recipient. Key material is versioned: a [`KeyRing`] maps version numbers to
//! identities and names one of them current. Every row records the version it
//! was written under, so old rows stay readable after a key rotation and can
//! be migrated with [`CredentialVault::reencrypt_all`].
//!
//! # Key file
//!
//! ```toml
//! current = 2
//!
//! [keys]
//! 1 = "AGE-SECRET-KEY-1..."
//! 2 = "AGE-SECRET-KEY-1..."
//! ```
//!
//! # Example
//!
//! ```no_run
//! use libteamcast::accounts::Credentials;
//! use libteamcast::credentials::{CredentialVault, KeyRing};
//! use libteamcast::db::Database;
//! use std::sync::Arc;
//!
//! # async fn example() -> libteamcast::error::Result<()> {
//! let db = Arc::new(Database::new("~/.local/share/teamcast/teamcast.db").await?);
//! let keys = KeyRing::load_or_create(std::path::Path::new("/etc/teamcast/vault-keys.toml"))?;
//! let vault = CredentialVault::new(db, keys);
//!
//! let account_id = uuid::Uuid::new_v4();
//! vault
//!     .save(account_id, &Credentials::new("access", "12345"), chrono::Utc::now())
//!     .await?;
//! let credentials = vault.get(account_id).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use age::secrecy::ExposeSecret;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::accounts::{Credentials, Token};
use crate::error::{CredentialError, Result};
use crate::repository::{EncryptedCredentials, TokenRepository};

/// Versioned age identities
pub struct KeyRing {
    keys: BTreeMap<u32, age::x25519::Identity>,
    current: u32,
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    current: u32,
    keys: BTreeMap<String, String>,
}

impl KeyRing {
    /// A ring holding one key as version 1
    pub fn single(identity: age::x25519::Identity) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, identity);
        Self { keys, current: 1 }
    }

    /// A ring with one freshly generated key
    pub fn generate() -> Self {
        Self::single(age::x25519::Identity::generate())
    }

    pub fn current_version(&self) -> u32 {
        self.current
    }

    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    pub fn identity(
        &self,
        version: u32,
    ) -> std::result::Result<&age::x25519::Identity, CredentialError> {
        self.keys
            .get(&version)
            .ok_or(CredentialError::UnknownKeyVersion(version))
    }

    /// Add a new key and make it current. Returns its version.
    pub fn rotate(&mut self) -> u32 {
        let version = self.keys.keys().next_back().copied().unwrap_or(0) + 1;
        self.keys.insert(version, age::x25519::Identity::generate());
        self.current = version;
        version
    }

    /// Drop a retired key. The current key cannot be removed.
    pub fn retire(&mut self, version: u32) -> std::result::Result<(), CredentialError> {
        if version == self.current {
            return Err(CredentialError::KeyRing(format!(
                "key version {version} is current and cannot be retired"
            )));
        }
        self.keys
            .remove(&version)
            .map(|_| ())
            .ok_or(CredentialError::UnknownKeyVersion(version))
    }

    pub fn parse(contents: &str) -> std::result::Result<Self, CredentialError> {
        let file: KeyFile = toml::from_str(contents)
            .map_err(|e| CredentialError::KeyRing(format!("invalid key file: {e}")))?;

        let mut keys = BTreeMap::new();
        for (version, secret) in file.keys {
            let version: u32 = version
                .parse()
                .map_err(|_| CredentialError::KeyRing(format!("invalid key version '{version}'")))?;
            let identity = secret
                .trim()
                .parse::<age::x25519::Identity>()
                .map_err(|e| CredentialError::KeyRing(format!("key version {version}: {e}")))?;
            keys.insert(version, identity);
        }

        if !keys.contains_key(&file.current) {
            return Err(CredentialError::KeyRing(format!(
                "current key version {} is not in the key file",
                file.current
            )));
        }

        Ok(Self {
            keys,
            current: file.current,
        })
    }

    pub fn to_toml(&self) -> std::result::Result<String, CredentialError> {
        let file = KeyFile {
            current: self.current,
            keys: self
                .keys
                .iter()
                .map(|(version, identity)| {
                    let secret = identity.to_string().expose_secret().clone();
                    (version.to_string(), secret)
                })
                .collect(),
        };
        toml::to_string(&file).map_err(|e| CredentialError::KeyRing(e.to_string()))
    }

    pub fn load(path: &Path) -> std::result::Result<Self, CredentialError> {
        validate_not_symlink(path)?;
        let contents = Zeroizing::new(
            std::fs::read_to_string(path).map_err(|e| {
                CredentialError::KeyRing(format!("cannot read {}: {e}", path.display()))
            })?,
        );
        Self::parse(&contents)
    }

    /// Write the key file with owner-only permissions
    pub fn save(&self, path: &Path) -> std::result::Result<(), CredentialError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CredentialError::KeyRing(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let contents = Zeroizing::new(self.to_toml()?);
        std::fs::write(path, contents.as_bytes()).map_err(|e| {
            CredentialError::KeyRing(format!("cannot write {}: {e}", path.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)
                .map_err(|e| CredentialError::KeyRing(format!("cannot set permissions: {e}")))?;
        }

        debug!(path = %path.display(), versions = ?self.versions(), "wrote vault key file");
        Ok(())
    }

    /// Load the key file, generating a first key if none exists yet
    pub fn load_or_create(path: &Path) -> std::result::Result<Self, CredentialError> {
        if path.exists() {
            return Self::load(path);
        }
        let ring = Self::generate();
        ring.save(path)?;
        info!(path = %path.display(), "generated vault key");
        Ok(ring)
    }

    fn encrypt(&self, plaintext: &str) -> std::result::Result<Vec<u8>, CredentialError> {
        let recipient = self.identity(self.current)?.to_public();
        let encryptor = age::Encryptor::with_recipients(vec![Box::new(recipient)])
            .ok_or_else(|| CredentialError::Encryption("no recipients".to_string()))?;

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        Ok(encrypted)
    }

    fn decrypt(
        &self,
        version: u32,
        ciphertext: &[u8],
    ) -> std::result::Result<Token, CredentialError> {
        let identity = self.identity(version)?;

        let decryptor = match age::Decryptor::new(ciphertext) {
            Ok(age::Decryptor::Recipients(d)) => d,
            Ok(_) => {
                return Err(CredentialError::Corrupt(
                    "unexpected encryption format (expected recipient)".to_string(),
                ))
            }
            Err(e) => return Err(CredentialError::Corrupt(e.to_string())),
        };

        let mut reader = decryptor
            .decrypt(std::iter::once(identity as &dyn age::Identity))
            .map_err(|e| CredentialError::Corrupt(e.to_string()))?;

        let mut plaintext = Zeroizing::new(Vec::new());
        reader
            .read_to_end(&mut plaintext)
            .map_err(|e| CredentialError::Corrupt(e.to_string()))?;

        let text = std::str::from_utf8(&plaintext)
            .map_err(|e| CredentialError::Corrupt(format!("invalid UTF-8: {e}")))?;
        Ok(Token::new(text))
    }
}

/// Refuse to read key material through a symbolic link
fn validate_not_symlink(path: &Path) -> std::result::Result<(), CredentialError> {
    let metadata = std::fs::symlink_metadata(path).map_err(|e| {
        CredentialError::KeyRing(format!("cannot read metadata for {}: {e}", path.display()))
    })?;

    if metadata.is_symlink() {
        return Err(CredentialError::KeyRing(format!(
            "key file '{}' is a symbolic link; use a regular file",
            path.display()
        )));
    }
    Ok(())
}

/// Result of migrating rows to the current key version
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReencryptReport {
    pub migrated: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

impl ReencryptReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Encrypting front for [`TokenRepository`]
#[derive(Clone)]
pub struct CredentialVault {
    repo: Arc<dyn TokenRepository>,
    keys: Arc<KeyRing>,
}

impl CredentialVault {
    pub fn new(repo: Arc<dyn TokenRepository>, keys: KeyRing) -> Self {
        Self {
            repo,
            keys: Arc::new(keys),
        }
    }

    pub fn key_version(&self) -> u32 {
        self.keys.current_version()
    }

    /// Encrypt and store credentials, replacing any existing row
    pub async fn save(
        &self,
        account_id: Uuid,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let row = self.seal(account_id, credentials, now)?;
        self.repo.upsert_tokens(&row).await?;
        debug!(%account_id, key_version = row.key_version, "saved credentials");
        Ok(())
    }

    /// Decrypt an account's credentials
    pub async fn get(&self, account_id: Uuid) -> Result<Credentials> {
        let row = self
            .repo
            .get_tokens(account_id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(account_id.to_string()))?;
        Ok(self.open(&row)?)
    }

    /// Replace credentials after a refresh. Fields the platform did not send
    /// back (refresh token, scopes) are kept from the stored row.
    pub async fn rotate(
        &self,
        account_id: Uuid,
        credentials: Credentials,
        now: DateTime<Utc>,
    ) -> Result<Credentials> {
        let merged = match self.repo.get_tokens(account_id).await? {
            Some(row) => match self.open(&row) {
                Ok(previous) => credentials.carry_forward(&previous),
                Err(e) => {
                    warn!(
                        %account_id,
                        error = %e,
                        "previous credentials unreadable, replacing them"
                    );
                    credentials
                }
            },
            None => credentials,
        };
        self.save(account_id, &merged, now).await?;
        Ok(merged)
    }

    pub async fn delete(&self, account_id: Uuid) -> Result<bool> {
        let deleted = self.repo.delete_tokens(account_id).await?;
        if deleted {
            debug!(%account_id, "deleted credentials");
        }
        Ok(deleted)
    }

    /// Re-encrypt one row under the current key. Returns false if it already was.
    pub async fn reencrypt(&self, account_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let row = self
            .repo
            .get_tokens(account_id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(account_id.to_string()))?;
        if row.key_version == self.keys.current_version() {
            return Ok(false);
        }

        let credentials = self.open(&row)?;
        let sealed = self.seal(account_id, &credentials, now)?;
        self.repo.upsert_tokens(&sealed).await?;
        info!(
            %account_id,
            from = row.key_version,
            to = sealed.key_version,
            "re-encrypted credentials"
        );
        Ok(true)
    }

    /// Re-encrypt every row written under an older key version
    pub async fn reencrypt_all(&self, now: DateTime<Utc>) -> Result<ReencryptReport> {
        let mut report = ReencryptReport::default();
        for account_id in self
            .repo
            .accounts_with_key_version_below(self.keys.current_version())
            .await?
        {
            match self.reencrypt(account_id, now).await {
                Ok(_) => report.migrated.push(account_id),
                Err(e) => {
                    warn!(%account_id, error = %e, "failed to re-encrypt credentials");
                    report.failed.push((account_id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    fn seal(
        &self,
        account_id: Uuid,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> std::result::Result<EncryptedCredentials, CredentialError> {
        Ok(EncryptedCredentials {
            account_id,
            access_token: self.keys.encrypt(credentials.access_token.expose())?,
            refresh_token: credentials
                .refresh_token
                .as_ref()
                .map(|token| self.keys.encrypt(token.expose()))
                .transpose()?,
            expires_at: credentials.expires_at,
            scopes: credentials.scopes.clone(),
            platform_user_id: credentials.platform_user_id.clone(),
            key_version: self.keys.current_version(),
            updated_at: now,
        })
    }

    fn open(
        &self,
        row: &EncryptedCredentials,
    ) -> std::result::Result<Credentials, CredentialError> {
        let access_token = self.keys.decrypt(row.key_version, &row.access_token)?;
        let refresh_token = row
            .refresh_token
            .as_deref()
            .map(|ciphertext| self.keys.decrypt(row.key_version, ciphertext))
            .transpose()?;

        Ok(Credentials {
            access_token,
            refresh_token,
            expires_at: row.expires_at,
            scopes: row.scopes.clone(),
            platform_user_id: row.platform_user_id.clone(),
        })
    }
}

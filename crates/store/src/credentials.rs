//! Per-user provider credentials.
//!
//! Keys are stored encrypted; the cipher itself lives outside the core (the
//! embedding application injects it). Plaintext only ever exists inside the
//! arbiter while serving a request.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sp_domain::error::{Error, Result};

/// A user's encrypted key for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub user_id: String,
    pub provider: String,
    pub encrypted_key: String,
    #[serde(default)]
    pub api_base: Option<String>,
    pub is_active: bool,
}

#[async_trait::async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn get(&self, user_id: &str, provider: &str) -> Result<Option<ProviderCredential>>;
}

/// Symmetric cipher contract for stored keys. Implementations are supplied
/// by the embedding application; the core never chooses an algorithm.
pub trait KeyCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Test/dev cipher that reverses the string. Obviously not protection;
/// it exists so tests can assert that decryption actually ran.
pub struct ReversingCipher;

impl KeyCipher for ReversingCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.chars().rev().collect())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.chars().rev().collect())
    }
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    creds: RwLock<HashMap<(String, String), ProviderCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, cred: ProviderCredential) {
        self.creds
            .write()
            .insert((cred.user_id.clone(), cred.provider.clone()), cred);
    }

    /// Store a plaintext key through the given cipher.
    pub fn insert_plaintext(
        &self,
        cipher: &dyn KeyCipher,
        user_id: &str,
        provider: &str,
        plaintext_key: &str,
        api_base: Option<String>,
    ) -> Result<()> {
        if plaintext_key.is_empty() {
            return Err(Error::Config("empty provider key".into()));
        }
        self.insert(ProviderCredential {
            user_id: user_id.into(),
            provider: provider.into(),
            encrypted_key: cipher.encrypt(plaintext_key)?,
            api_base,
            is_active: true,
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl CredentialRepository for MemoryCredentialStore {
    async fn get(&self, user_id: &str, provider: &str) -> Result<Option<ProviderCredential>> {
        Ok(self
            .creds
            .read()
            .get(&(user_id.to_string(), provider.to_string()))
            .cloned())
    }
}

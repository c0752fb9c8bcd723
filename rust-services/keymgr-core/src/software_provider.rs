//! Software keyring provider
//!
//! Keeps keys in memory and, when given a directory, in a keyring file
//! encrypted with AES-256-GCM under a master key. Secret halves may be
//! additionally sealed with a passphrase and start out locked.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{KeyError, KeyResult};
use crate::key_types::{
    ExportedKeyring, Fingerprint, Key, KeyGenerateOptions, KeyId, KeyPair, KeyProviderCredentials,
    KeyPurpose, KeyRingType, KeyUnlockData, KeyringExportOptions, LockState, Parameters,
    PassphraseCallback, ProviderId, FINGERPRINT_LEN,
};
use crate::provider::KeyProvider;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Serialization format used for import and export
pub const BUNDLE_FORMAT: &str = "keymgr-bundle-v1";

/// Algorithm labels accepted for generation
pub const SUPPORTED_ALGORITHMS: [&str; 2] = ["ed25519", "x25519"];

/// Environment variable holding the storage master key
pub const MASTER_KEY_ENV: &str = "KEYMGR_MASTER_KEY";

const KEYRING_FILE: &str = "keyring.bin";
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
const MATERIAL_LEN: usize = 32;

/// Master key for encrypting the keyring file
type MasterKey = [u8; 32];

/// How the secret half is held
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protection", rename_all = "snake_case")]
enum SecretMaterial {
    Clear { material: String },
    Passphrase { salt: String, sealed: String },
}

/// One key as stored in the keyring
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKey {
    fingerprint: Fingerprint,
    user_ids: Vec<String>,
    algorithm: String,
    created_at: i64,
    public_material: String,
    #[serde(default)]
    secret: Option<SecretMaterial>,
}

impl StoredKey {
    fn public_view(&self, provider_id: &str) -> Key {
        Key {
            fingerprint: self.fingerprint,
            key_id: self.fingerprint.key_id(),
            provider_id: provider_id.to_string(),
            user_ids: self.user_ids.clone(),
            purposes: BTreeSet::from([KeyPurpose::Verification, KeyPurpose::Encryption]),
            is_secret: false,
            lock_state: LockState::Unlocked,
            created_at: self.created_at,
            metadata: HashMap::from([("algorithm".to_string(), self.algorithm.clone())]),
        }
    }

    fn secret_view(&self, provider_id: &str, unlocked: &HashSet<Fingerprint>) -> Option<Key> {
        let lock_state = match self.secret.as_ref()? {
            SecretMaterial::Clear { .. } => LockState::Unlocked,
            SecretMaterial::Passphrase { .. } if unlocked.contains(&self.fingerprint) => {
                LockState::Unlocked
            }
            SecretMaterial::Passphrase { .. } => LockState::Locked,
        };
        Some(Key {
            purposes: BTreeSet::from([KeyPurpose::Signing, KeyPurpose::Decryption]),
            is_secret: true,
            lock_state,
            ..self.public_view(provider_id)
        })
    }

    fn views(&self, provider_id: &str, unlocked: &HashSet<Fingerprint>) -> Vec<Key> {
        let mut views = vec![self.public_view(provider_id)];
        views.extend(self.secret_view(provider_id, unlocked));
        views
    }
}

/// Import/export document
#[derive(Debug, Serialize, Deserialize)]
struct KeyBundle {
    format: String,
    keys: Vec<StoredKey>,
}

/// Software keyring provider
pub struct SoftwareKeyProvider {
    id: ProviderId,
    /// Keyring directory, in-memory only when `None`
    storage_path: Option<PathBuf>,
    master_key: RwLock<MasterKey>,
    keys: RwLock<Vec<StoredKey>>,
    /// Passphrase-protected secrets unlocked in this session
    unlocked: RwLock<HashSet<Fingerprint>>,
}

impl SoftwareKeyProvider {
    /// Create a provider that never touches the disk
    pub fn in_memory(id: impl Into<ProviderId>) -> Self {
        let mut master_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut master_key);
        Self {
            id: id.into(),
            storage_path: None,
            master_key: RwLock::new(master_key),
            keys: RwLock::new(Vec::new()),
            unlocked: RwLock::new(HashSet::new()),
        }
    }

    /// Open a provider backed by a keyring directory
    ///
    /// # Arguments
    /// * `storage_path` - Directory holding the encrypted keyring
    /// * `master_key` - Optional 32-byte master key (if None, derived from
    ///   `KEYMGR_MASTER_KEY` or generated)
    pub async fn open<P: AsRef<Path>>(
        id: impl Into<ProviderId>,
        storage_path: P,
        master_key: Option<&[u8]>,
    ) -> KeyResult<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        fs::create_dir_all(&storage_path).await?;

        let master_key = match master_key {
            Some(key) => master_key_from_slice(key)
                .ok_or_else(|| KeyError::Configuration("Master key must be exactly 32 bytes".to_string()))?,
            None => Self::derive_master_key(),
        };

        let keyring_path = storage_path.join(KEYRING_FILE);
        let keys = match fs::read(&keyring_path).await {
            Ok(encrypted) => {
                let plaintext = open_sealed(&master_key, &encrypted)?;
                serde_json::from_slice::<Vec<StoredKey>>(&plaintext)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let id = id.into();
        info!(provider = %id, path = %storage_path.display(), keys = keys.len(), "Opened software keyring");

        Ok(Self {
            id,
            storage_path: Some(storage_path),
            master_key: RwLock::new(master_key),
            keys: RwLock::new(keys),
            unlocked: RwLock::new(HashSet::new()),
        })
    }

    /// Derive master key from environment variable or generate a new one
    fn derive_master_key() -> MasterKey {
        if let Ok(key_str) = std::env::var(MASTER_KEY_ENV) {
            if let Some(mk) = hex::decode(key_str.trim())
                .ok()
                .and_then(|bytes| master_key_from_slice(&bytes))
            {
                return mk;
            }
            // Otherwise, derive from the phrase
            let mut mk = [0u8; 32];
            mk.copy_from_slice(&Sha256::digest(key_str.as_bytes()));
            return mk;
        }

        warn!(
            env = MASTER_KEY_ENV,
            "No master key configured, generating one; the keyring will not be readable after restart"
        );
        let mut master_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut master_key);
        master_key
    }

    /// Write the keyring file, if this provider has one
    async fn persist(&self, keys: &[StoredKey], master_key: &MasterKey) -> KeyResult<()> {
        let Some(dir) = &self.storage_path else {
            return Ok(());
        };

        let plaintext = serde_json::to_vec(keys)?;
        let encrypted = seal(master_key, &plaintext)?;

        let path = dir.join(KEYRING_FILE);
        let tmp_path = dir.join(format!("{}.tmp", KEYRING_FILE));
        fs::write(&tmp_path, encrypted).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!(provider = %self.id, keys = keys.len(), "Keyring saved");
        Ok(())
    }

    async fn save(&self, keys: &[StoredKey]) -> KeyResult<()> {
        let master_key = self.master_key.read().await;
        self.persist(keys, &master_key).await
    }

    async fn collect_views<F>(&self, filter: F) -> Vec<Key>
    where
        F: Fn(&Key) -> bool,
    {
        let keys = self.keys.read().await;
        let unlocked = self.unlocked.read().await;
        keys.iter()
            .flat_map(|stored| stored.views(&self.id, &unlocked))
            .filter(|key| filter(key))
            .collect()
    }

    fn check_owner(&self, provider_id: &str) -> KeyResult<()> {
        if provider_id != self.id {
            return Err(KeyError::InvalidFormat(format!(
                "options belong to provider {}, not {}",
                provider_id, self.id
            )));
        }
        Ok(())
    }

    /// Check the passphrase of a sealed secret before it is imported
    async fn verify_import_unit(
        &self,
        stored: &StoredKey,
        passphrase_callback: &PassphraseCallback,
    ) -> KeyResult<()> {
        if compute_fingerprint(&stored.algorithm, stored.created_at, &stored.public_material)?
            != stored.fingerprint
        {
            return Err(KeyError::InvalidFormat(format!(
                "fingerprint mismatch for {}",
                stored.fingerprint
            )));
        }

        let Some(SecretMaterial::Passphrase { salt, sealed }) = &stored.secret else {
            return Ok(());
        };

        let identifier = format!(
            "{} {}",
            stored.fingerprint.key_id(),
            stored.user_ids.first().map(String::as_str).unwrap_or("")
        )
        .trim_end()
        .to_string();

        let passphrase = passphrase_callback(identifier.clone())
            .await
            .map_err(|e| KeyError::PassphraseRequired(format!("{}: {}", identifier, e)))?;

        unseal_with_passphrase(salt, sealed, &passphrase)
            .map(|_| ())
            .map_err(|_| KeyError::PassphraseRejected(identifier))
    }
}

#[async_trait]
impl KeyProvider for SoftwareKeyProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_all_keys(&self, keyring_type: KeyRingType) -> KeyResult<Vec<Key>> {
        Ok(self.collect_views(|key| keyring_type.includes(key)).await)
    }

    async fn get_keys_by_email(&self, email: &str) -> KeyResult<Vec<Key>> {
        Ok(self.collect_views(|key| key.has_email(email)).await)
    }

    async fn get_keys_by_key_id(&self, id: &KeyId) -> KeyResult<Vec<Key>> {
        Ok(self.collect_views(|key| key.key_id == *id).await)
    }

    /// Returns the secret half when this provider holds it
    async fn get_key_by_fingerprint(&self, fingerprint: &Fingerprint) -> KeyResult<Option<Key>> {
        let keys = self.keys.read().await;
        let unlocked = self.unlocked.read().await;
        Ok(keys
            .iter()
            .find(|stored| stored.fingerprint == *fingerprint)
            .map(|stored| {
                stored
                    .secret_view(&self.id, &unlocked)
                    .unwrap_or_else(|| stored.public_view(&self.id))
            }))
    }

    async fn get_key_generate_options(&self) -> KeyResult<Vec<KeyGenerateOptions>> {
        Ok(SUPPORTED_ALGORITHMS
            .iter()
            .map(|algorithm| KeyGenerateOptions::new(self.id.clone()).with("algorithm", *algorithm))
            .collect())
    }

    async fn generate_key_pair(
        &self,
        user_id: &str,
        options: &KeyGenerateOptions,
    ) -> KeyResult<KeyPair> {
        self.check_owner(&options.provider_id)?;
        if user_id.trim().is_empty() {
            return Err(KeyError::InvalidFormat("user id must not be empty".to_string()));
        }

        let algorithm = options.parameter_str("algorithm").unwrap_or(SUPPORTED_ALGORITHMS[0]);
        if !SUPPORTED_ALGORITHMS.contains(&algorithm) {
            return Err(KeyError::InvalidFormat(format!("unsupported algorithm {}", algorithm)));
        }

        let mut public_material = [0u8; MATERIAL_LEN];
        let mut secret_material = [0u8; MATERIAL_LEN];
        rand::thread_rng().fill_bytes(&mut public_material);
        rand::thread_rng().fill_bytes(&mut secret_material);

        let created_at = chrono::Utc::now().timestamp();
        let public_material = hex::encode(public_material);
        let fingerprint = compute_fingerprint(algorithm, created_at, &public_material)?;

        let secret = match options.parameter_str("passphrase").filter(|p| !p.is_empty()) {
            Some(passphrase) => seal_with_passphrase(&secret_material, passphrase)?,
            None => SecretMaterial::Clear {
                material: hex::encode(secret_material),
            },
        };

        let stored = StoredKey {
            fingerprint,
            user_ids: vec![user_id.trim().to_string()],
            algorithm: algorithm.to_string(),
            created_at,
            public_material,
            secret: Some(secret),
        };

        let mut keys = self.keys.write().await;
        if keys.iter().any(|k| k.fingerprint == fingerprint) {
            return Err(KeyError::AlreadyExists(fingerprint.to_string()));
        }
        keys.push(stored.clone());
        self.save(&keys).await?;
        drop(keys);

        info!(provider = %self.id, fingerprint = %fingerprint, algorithm, "Generated keypair");

        let unlocked = self.unlocked.read().await;
        let secret = stored
            .secret_view(&self.id, &unlocked)
            .ok_or_else(|| KeyError::KeyNotFound(fingerprint.to_string()))?;
        Ok(KeyPair {
            public: stored.public_view(&self.id),
            secret,
        })
    }

    async fn get_keyring_export_options(
        &self,
        keyring_type: KeyRingType,
    ) -> KeyResult<Vec<KeyringExportOptions>> {
        Ok(vec![KeyringExportOptions {
            provider_id: self.id.clone(),
            keyring_type,
            format: BUNDLE_FORMAT.to_string(),
            parameters: Parameters::new(),
        }])
    }

    async fn export_keyring(
        &self,
        keyring_type: KeyRingType,
        options: &KeyringExportOptions,
    ) -> KeyResult<ExportedKeyring> {
        self.check_owner(&options.provider_id)?;
        if options.format != BUNDLE_FORMAT {
            return Err(KeyError::InvalidFormat(format!(
                "unsupported export format {}",
                options.format
            )));
        }

        let keys = self.keys.read().await;
        let exported: Vec<StoredKey> = keys
            .iter()
            .filter(|k| keyring_type != KeyRingType::Secret || k.secret.is_some())
            .cloned()
            .map(|mut k| {
                if keyring_type == KeyRingType::Public {
                    k.secret = None;
                }
                k
            })
            .collect();
        drop(keys);

        info!(provider = %self.id, keyring = ?keyring_type, keys = exported.len(), "Exporting keyring");
        let payload = serde_json::to_vec_pretty(&KeyBundle {
            format: BUNDLE_FORMAT.to_string(),
            keys: exported,
        })?;

        Ok(ExportedKeyring {
            provider_id: self.id.clone(),
            format: BUNDLE_FORMAT.to_string(),
            payload,
        })
    }

    async fn set_credentials(&self, credentials: &KeyProviderCredentials) -> KeyResult<()> {
        let new_key = credentials
            .get("master_key")
            .and_then(|v| v.as_str())
            .and_then(|text| hex::decode(text).ok())
            .and_then(|bytes| master_key_from_slice(&bytes))
            .ok_or_else(|| {
                KeyError::CredentialRejected("expected master_key as 64 hex characters".to_string())
            })?;

        let keys = self.keys.read().await;
        let mut master_key = self.master_key.write().await;
        self.persist(&keys, &new_key).await?;
        *master_key = new_key;

        info!(provider = %self.id, "Keyring master key rotated");
        Ok(())
    }

    async fn unlock_key(&self, key: &Key, unlock_data: &KeyUnlockData) -> KeyResult<Key> {
        let stored = {
            let keys = self.keys.read().await;
            keys.iter()
                .find(|k| k.fingerprint == key.fingerprint)
                .cloned()
                .ok_or_else(|| KeyError::KeyNotFound(key.fingerprint.to_string()))?
        };

        if !key.is_secret {
            return Ok(stored.public_view(&self.id));
        }

        if let Some(SecretMaterial::Passphrase { salt, sealed }) = &stored.secret {
            if !self.unlocked.read().await.contains(&stored.fingerprint) {
                let passphrase = unlock_data
                    .get("passphrase")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| KeyError::PassphraseRequired(key.fingerprint.to_string()))?;
                unseal_with_passphrase(salt, sealed, passphrase)
                    .map_err(|_| KeyError::PassphraseRejected(key.fingerprint.to_string()))?;

                self.unlocked.write().await.insert(stored.fingerprint);
                info!(provider = %self.id, fingerprint = %stored.fingerprint, "Key unlocked");
            }
        }

        let unlocked = self.unlocked.read().await;
        stored
            .secret_view(&self.id, &unlocked)
            .ok_or_else(|| KeyError::KeyNotFound(format!("no secret key for {}", key.fingerprint)))
    }

    async fn remove_keys(&self, fingerprints: &[Fingerprint]) -> KeyResult<()> {
        let mut keys = self.keys.write().await;

        let missing: Vec<String> = fingerprints
            .iter()
            .filter(|fp| !keys.iter().any(|k| k.fingerprint == **fp))
            .map(|fp| fp.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(KeyError::KeyNotFound(missing.join(", ")));
        }

        keys.retain(|k| !fingerprints.contains(&k.fingerprint));
        self.save(&keys).await?;
        drop(keys);

        self.unlocked
            .write()
            .await
            .retain(|fp| !fingerprints.contains(fp));

        info!(provider = %self.id, removed = fingerprints.len(), "Keys removed");
        Ok(())
    }

    async fn import_keys(
        &self,
        serialization: &[u8],
        passphrase_callback: PassphraseCallback,
    ) -> KeyResult<Vec<String>> {
        let bundle: KeyBundle = serde_json::from_slice(serialization)
            .map_err(|e| KeyError::UnsupportedFormat(format!("not a key bundle: {}", e)))?;
        if bundle.format != BUNDLE_FORMAT {
            return Err(KeyError::UnsupportedFormat(format!(
                "unknown bundle format {}",
                bundle.format
            )));
        }

        // Passphrases are checked before taking the keyring lock
        let mut accepted = Vec::with_capacity(bundle.keys.len());
        for stored in bundle.keys {
            match self.verify_import_unit(&stored, &passphrase_callback).await {
                Ok(()) => accepted.push(stored),
                Err(e) => {
                    warn!(provider = %self.id, fingerprint = %stored.fingerprint, error = %e, "Skipping key during import");
                }
            }
        }

        let mut imported_user_ids = Vec::new();
        let mut keys = self.keys.write().await;
        for incoming in accepted {
            imported_user_ids.extend(incoming.user_ids.iter().cloned());
            match keys.iter_mut().find(|k| k.fingerprint == incoming.fingerprint) {
                Some(existing) => {
                    for uid in incoming.user_ids {
                        if !existing.user_ids.contains(&uid) {
                            existing.user_ids.push(uid);
                        }
                    }
                    if existing.secret.is_none() {
                        existing.secret = incoming.secret;
                    }
                }
                None => keys.push(incoming),
            }
        }
        self.save(&keys).await?;

        info!(provider = %self.id, user_ids = imported_user_ids.len(), "Import finished");
        Ok(imported_user_ids)
    }
}

fn master_key_from_slice(bytes: &[u8]) -> Option<MasterKey> {
    bytes.try_into().ok()
}

fn compute_fingerprint(algorithm: &str, created_at: i64, public_material: &str) -> KeyResult<Fingerprint> {
    let material = hex::decode(public_material)
        .map_err(|e| KeyError::InvalidFormat(format!("Invalid public material: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(algorithm.as_bytes());
    hasher.update(created_at.to_be_bytes());
    hasher.update(&material);
    Fingerprint::from_slice(&hasher.finalize()[..FINGERPRINT_LEN])
}

fn passphrase_key(salt: &[u8], passphrase: &str) -> MasterKey {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(passphrase.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&hasher.finalize());
    key
}

fn seal_with_passphrase(material: &[u8], passphrase: &str) -> KeyResult<SecretMaterial> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let sealed = seal(&passphrase_key(&salt, passphrase), material)?;
    Ok(SecretMaterial::Passphrase {
        salt: hex::encode(salt),
        sealed: hex::encode(sealed),
    })
}

fn unseal_with_passphrase(salt: &str, sealed: &str, passphrase: &str) -> KeyResult<Vec<u8>> {
    let salt = hex::decode(salt).map_err(|e| KeyError::InvalidFormat(format!("Invalid salt: {}", e)))?;
    let sealed = hex::decode(sealed).map_err(|e| KeyError::InvalidFormat(format!("Invalid sealed secret: {}", e)))?;
    open_sealed(&passphrase_key(&salt, passphrase), &sealed)
}

/// Encrypt with AES-256-GCM, nonce prepended
fn seal(key: &MasterKey, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(&(*key).into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| KeyError::Encryption(format!("Encryption failed: {}", e)))?;

    let mut result = nonce.to_vec();
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt data produced by [`seal`]
fn open_sealed(key: &MasterKey, encrypted: &[u8]) -> KeyResult<Vec<u8>> {
    if encrypted.len() < NONCE_LEN {
        return Err(KeyError::Decryption("Encrypted data too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = encrypted.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new(&(*key).into());

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| KeyError::Decryption(format!("Decryption failed: {}", e)))
}

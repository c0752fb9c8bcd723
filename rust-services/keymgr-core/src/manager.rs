//! Key manager
//!
//! The single per-application resolver for keys. It decides which
//! providers to ask, which of several matching keys is authoritative for a
//! user and purpose, how trust epochs are maintained, and which provider
//! failures can be absorbed.
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
    email_from_user_id, normalize_email, ExportedKeyring, Fingerprint, Key, KeyGenerateOptions,
    KeyId, KeyPair, KeyProviderCredentials, KeyPurpose, KeyRingType, KeyTrustData, KeyUnlockData,
    KeyringExportOptions, PassphraseCallback,
};
use crate::registry::ProviderRegistry;
use crate::trust_store::{TrustRecord, TrustStore};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Policy engine over the registered key providers
pub struct KeyManager {
    registry: ProviderRegistry,
    trust_store: Arc<TrustStore>,
}

impl KeyManager {
    /// Create a key manager over a populated registry
    pub fn new(registry: ProviderRegistry, trust_store: Arc<TrustStore>) -> Self {
        Self {
            registry,
            trust_store,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn trust_store(&self) -> &Arc<TrustStore> {
        &self.trust_store
    }

    /// Active trust epoch for (email, purpose), if any
    pub async fn trust_record(&self, email: &str, purpose: KeyPurpose) -> Option<TrustRecord> {
        self.trust_store.record(email, purpose).await
    }

    /// Trusted keys for `purpose` of the user with `email`.
    ///
    /// Empty when nothing was ever trusted for the pair. When several
    /// providers hold the same trusted key, the most preferred copy wins.
    pub async fn get_trusted_keys(&self, purpose: KeyPurpose, email: &str) -> KeyResult<Vec<Key>> {
        let Some(record) = self.trust_store.record(email, purpose).await else {
            debug!(email, purpose = %purpose, "No trust record");
            return Ok(Vec::new());
        };
        if record.fingerprints.is_empty() {
            return Ok(Vec::new());
        }

        let candidates = self
            .registry
            .fan_out("get_trusted_keys", |p| async move { p.get_keys_by_email(email).await })
            .await?;

        Ok(select_trusted(&record, &candidates, purpose))
    }

    /// Keys for `purpose` with the given key id; the wildcard id returns
    /// every key for the purpose. Results may be untrusted.
    pub async fn get_keys_by_key_id(&self, purpose: KeyPurpose, id: &KeyId) -> KeyResult<Vec<Key>> {
        if !purpose.allows_key_id_lookup() {
            return Err(KeyError::InvalidPurpose(format!(
                "{} keys must be resolved through trust, not by key id",
                purpose
            )));
        }

        let id = *id;
        let keys = if id.is_wildcard() {
            self.registry
                .fan_out("get_keys_by_key_id", |p| async move {
                    p.get_all_keys(KeyRingType::All).await
                })
                .await?
        } else {
            self.registry
                .fan_out("get_keys_by_key_id", |p| async move {
                    p.get_keys_by_key_id(&id).await
                })
                .await?
        };

        let matching: Vec<Key> = keys.into_iter().filter(|k| k.supports(purpose)).collect();
        if matching.is_empty() && !id.is_wildcard() {
            return Err(KeyError::KeyNotFound(format!("key id {} for {}", id, purpose)));
        }
        Ok(matching)
    }

    /// All public, secret or all keys, optionally from one provider only.
    /// Results may be untrusted.
    pub async fn get_all_keys(
        &self,
        keyring_type: KeyRingType,
        provider_id: Option<&str>,
    ) -> KeyResult<Vec<Key>> {
        let keys = match provider_id {
            Some(id) => {
                self.registry
                    .with_provider(id, |p| async move { p.get_all_keys(keyring_type).await })
                    .await?
            }
            None => {
                self.registry
                    .fan_out("get_all_keys", |p| async move { p.get_all_keys(keyring_type).await })
                    .await?
            }
        };
        Ok(keys.into_iter().filter(|k| keyring_type.includes(k)).collect())
    }

    /// Public and secret keys with a user id for `email`. Results may be untrusted.
    pub async fn get_all_keys_by_email(&self, email: &str) -> KeyResult<Vec<Key>> {
        self.registry
            .fan_out("get_all_keys_by_email", |p| async move { p.get_keys_by_email(email).await })
            .await
    }

    /// The key with `fingerprint`, from the most preferred provider holding
    /// it unless a provider is named. The result may be untrusted.
    pub async fn get_key_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
        provider_id: Option<&str>,
    ) -> KeyResult<Key> {
        let fingerprint = *fingerprint;
        let found = match provider_id {
            Some(id) => {
                self.registry
                    .with_provider(id, |p| async move {
                        p.get_key_by_fingerprint(&fingerprint).await
                    })
                    .await?
            }
            None => {
                self.registry
                    .first_match("get_key_by_fingerprint", |p| async move {
                        p.get_key_by_fingerprint(&fingerprint).await
                    })
                    .await?
            }
        };
        found.ok_or_else(|| KeyError::KeyNotFound(format!("fingerprint {}", fingerprint)))
    }

    /// Generation option sets of every provider
    pub async fn get_all_key_generate_options(&self) -> KeyResult<Vec<KeyGenerateOptions>> {
        self.registry
            .fan_out("get_all_key_generate_options", |p| async move {
                p.get_key_generate_options().await
            })
            .await
    }

    /// Generate a keypair with the provider named in `options`.
    ///
    /// The new keys become the only trusted keys for every purpose they
    /// support, for each e-mail address found in `user_id`.
    pub async fn generate_key_pair(
        &self,
        user_id: &str,
        options: &KeyGenerateOptions,
    ) -> KeyResult<KeyPair> {
        let pair = self
            .registry
            .with_provider_interactive(&options.provider_id, |p| async move {
                p.generate_key_pair(user_id, options).await
            })
            .await?;

        let emails: Vec<String> = email_from_user_id(user_id).into_iter().collect();
        if emails.is_empty() {
            warn!(user_id, fingerprint = %pair.public.fingerprint, "No e-mail in user id, keypair left untrusted");
        }

        let halves = [&pair.public, &pair.secret];
        for email in &emails {
            for purpose in pair.purposes() {
                let trusted: Vec<Key> = halves
                    .iter()
                    .filter(|k| k.supports(purpose))
                    .map(|k| (*k).clone())
                    .collect();
                let fingerprints = trusted.iter().map(|k| k.fingerprint).collect();
                self.trust_store.replace(email, purpose, fingerprints, None).await?;
                self.notify_trusted(&trusted, email, purpose, None).await;
            }
        }

        info!(
            provider = %options.provider_id,
            fingerprint = %pair.public.fingerprint,
            emails = emails.len(),
            "Generated keypair trusted for its purposes"
        );
        Ok(pair)
    }

    /// Export option sets of every provider for a keyring type
    pub async fn get_keyring_export_options(
        &self,
        keyring_type: KeyRingType,
    ) -> KeyResult<Vec<KeyringExportOptions>> {
        self.registry
            .fan_out("get_keyring_export_options", |p| async move {
                p.get_keyring_export_options(keyring_type).await
            })
            .await
    }

    /// Export a keyring through the provider named in `options`
    pub async fn export_keyring(
        &self,
        keyring_type: KeyRingType,
        options: &KeyringExportOptions,
    ) -> KeyResult<ExportedKeyring> {
        self.registry
            .with_provider(&options.provider_id, |p| async move {
                p.export_keyring(keyring_type, options).await
            })
            .await
    }

    /// Credentials for future calls to a provider
    pub async fn set_provider_credentials(
        &self,
        provider_id: &str,
        credentials: KeyProviderCredentials,
    ) -> KeyResult<()> {
        self.registry.set_credentials(provider_id, credentials).await
    }

    /// Make `keys` the trusted set for (email, purpose).
    ///
    /// Keys that do not support `purpose` are skipped. Every key trusted
    /// before and not listed here loses trust. Returns the keys trusted.
    pub async fn trust_keys(
        &self,
        keys: &[Key],
        email: &str,
        purpose: KeyPurpose,
        trust_data: Option<KeyTrustData>,
    ) -> KeyResult<Vec<Key>> {
        if normalize_email(email).is_empty() {
            return Err(KeyError::InvalidFormat("email must not be empty".to_string()));
        }

        let mut trusted: Vec<Key> = Vec::with_capacity(keys.len());
        for key in keys {
            if !key.supports(purpose) {
                debug!(fingerprint = %key.fingerprint, purpose = %purpose, "Key lacks purpose, not trusted");
                continue;
            }
            if !trusted
                .iter()
                .any(|k| k.fingerprint == key.fingerprint && k.is_secret == key.is_secret)
            {
                trusted.push(key.clone());
            }
        }

        let fingerprints = trusted.iter().map(|k| k.fingerprint).collect();
        self.trust_store
            .replace(email, purpose, fingerprints, trust_data.clone())
            .await?;

        self.notify_trusted(&trusted, email, purpose, trust_data.as_ref())
            .await;
        Ok(trusted)
    }

    async fn notify_trusted(
        &self,
        keys: &[Key],
        email: &str,
        purpose: KeyPurpose,
        trust_data: Option<&KeyTrustData>,
    ) {
        let mut by_provider: BTreeMap<&str, Vec<Key>> = BTreeMap::new();
        for key in keys {
            by_provider
                .entry(key.provider_id.as_str())
                .or_default()
                .push(key.clone());
        }

        let notifications = by_provider.iter().map(|(provider_id, keys)| async move {
            let result = self
                .registry
                .with_provider(provider_id, |p| async move {
                    p.keys_trusted(keys, email, purpose, trust_data).await
                })
                .await;
            (*provider_id, result)
        });

        for (provider_id, result) in join_all(notifications).await {
            if let Err(e) = result {
                warn!(provider = provider_id, error = %e, "Provider trust notification failed");
            }
        }
    }

    /// Unlock a key through its provider; an unlocked key is returned as is
    pub async fn unlock_key(&self, key: &Key, unlock_data: &KeyUnlockData) -> KeyResult<Key> {
        if key.is_unlocked() {
            debug!(fingerprint = %key.fingerprint, "Key already unlocked");
            return Ok(key.clone());
        }

        self.registry
            .with_provider_interactive(&key.provider_id, |p| async move {
                p.unlock_key(key, unlock_data).await
            })
            .await
    }

    /// Remove keys from their providers and drop them from every trust record
    pub async fn remove_keys(&self, keys: &[Key]) -> KeyResult<()> {
        let mut by_provider: BTreeMap<&str, Vec<Fingerprint>> = BTreeMap::new();
        for key in keys {
            let fingerprints = by_provider.entry(key.provider_id.as_str()).or_default();
            if !fingerprints.contains(&key.fingerprint) {
                fingerprints.push(key.fingerprint);
            }
        }

        let removals = by_provider.iter().map(|(provider_id, fingerprints)| async move {
            let result = self
                .registry
                .with_provider(provider_id, |p| async move { p.remove_keys(fingerprints).await })
                .await;
            (*provider_id, fingerprints, result)
        });

        let mut removed = Vec::new();
        let mut first_failure = None;
        for (provider_id, fingerprints, result) in join_all(removals).await {
            match result {
                Ok(()) => {
                    info!(provider = provider_id, keys = fingerprints.len(), "Keys removed");
                    removed.extend(fingerprints.iter().copied());
                }
                Err(e) => {
                    warn!(provider = provider_id, error = %e, "Key removal failed");
                    first_failure.get_or_insert(e);
                }
            }
        }

        self.trust_store.purge(&removed).await?;

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Import serialized keys through the first provider that understands
    /// them. Units that fail (e.g. a rejected passphrase) are skipped.
    /// Returns the imported user ids.
    pub async fn import_keys(
        &self,
        serialization: &[u8],
        passphrase_callback: PassphraseCallback,
    ) -> KeyResult<Vec<String>> {
        for entry in self.registry.by_preference() {
            let callback = passphrase_callback.clone();
            let result = entry
                .call_interactive(|p| async move { p.import_keys(serialization, callback).await })
                .await;

            match result {
                Ok(user_ids) => {
                    info!(provider = entry.id(), imported = user_ids.len(), "Keys imported");
                    return Ok(user_ids);
                }
                Err(KeyError::UnsupportedFormat(reason)) => {
                    debug!(provider = entry.id(), reason = %reason, "Provider cannot parse serialization");
                }
                Err(e) => return Err(e),
            }
        }

        Err(KeyError::UnsupportedFormat(
            "no registered provider accepts this serialization".to_string(),
        ))
    }
}

/// Pick the trusted keys for `purpose` out of the fan-out candidates.
///
/// Candidates arrive in provider preference order, so the first copy of a
/// (fingerprint, secret) identity is the preferred one. Output follows the
/// trust record's order.
fn select_trusted(record: &TrustRecord, candidates: &[Key], purpose: KeyPurpose) -> Vec<Key> {
    let mut chosen: Vec<Key> = Vec::new();
    for fingerprint in &record.fingerprints {
        for key in candidates
            .iter()
            .filter(|k| k.fingerprint == *fingerprint && k.supports(purpose))
        {
            let duplicate = chosen
                .iter()
                .any(|c| c.fingerprint == key.fingerprint && c.is_secret == key.is_secret);
            if !duplicate {
                chosen.push(key.clone());
            }
        }
    }
    chosen
}

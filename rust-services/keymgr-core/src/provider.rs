//! Key provider interface
//!
//! A provider owns a set of keys and performs every operation that touches
//! key material. The key manager only decides which providers to ask and
//! which answers to trust. Possible backends:
//! - Software keyring (see [`crate::software_provider`])
//! - Hardware tokens
//! - Remote key services
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


use crate::error::KeyResult;
use crate::key_types::{
    ExportedKeyring, Fingerprint, Key, KeyGenerateOptions, KeyId, KeyPair, KeyProviderCredentials,
    KeyPurpose, KeyRingType, KeyTrustData, KeyUnlockData, KeyringExportOptions,
    PassphraseCallback,
};
use async_trait::async_trait;

/// Trait for key provider backends
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Stable provider identifier
    fn id(&self) -> &str;

    /// All keys in the given keyring
    async fn get_all_keys(&self, keyring_type: KeyRingType) -> KeyResult<Vec<Key>>;

    /// Public and secret keys with a user id for `email`
    async fn get_keys_by_email(&self, email: &str) -> KeyResult<Vec<Key>>;

    /// Keys whose key id equals `id` (never called with the wildcard)
    async fn get_keys_by_key_id(&self, id: &KeyId) -> KeyResult<Vec<Key>>;

    /// The key with this fingerprint, if this provider holds it
    async fn get_key_by_fingerprint(&self, fingerprint: &Fingerprint) -> KeyResult<Option<Key>>;

    /// Generation option sets this provider accepts
    async fn get_key_generate_options(&self) -> KeyResult<Vec<KeyGenerateOptions>>;

    /// Generate a keypair for `user_id`
    async fn generate_key_pair(
        &self,
        user_id: &str,
        options: &KeyGenerateOptions,
    ) -> KeyResult<KeyPair>;

    /// Export option sets for a keyring type
    async fn get_keyring_export_options(
        &self,
        keyring_type: KeyRingType,
    ) -> KeyResult<Vec<KeyringExportOptions>>;

    /// Export a keyring
    async fn export_keyring(
        &self,
        keyring_type: KeyRingType,
        options: &KeyringExportOptions,
    ) -> KeyResult<ExportedKeyring>;

    /// Accept new credentials; failures should be reported as
    /// `KeyError::CredentialRejected`
    async fn set_credentials(&self, credentials: &KeyProviderCredentials) -> KeyResult<()>;

    /// Unlock a key, possibly waiting for user interaction
    async fn unlock_key(&self, key: &Key, unlock_data: &KeyUnlockData) -> KeyResult<Key>;

    /// Remove keys by fingerprint
    async fn remove_keys(&self, fingerprints: &[Fingerprint]) -> KeyResult<()>;

    /// Import serialized keys and return the user ids imported.
    ///
    /// Must answer `KeyError::UnsupportedFormat` without side effects when
    /// the serialization is not one this provider understands.
    async fn import_keys(
        &self,
        serialization: &[u8],
        passphrase_callback: PassphraseCallback,
    ) -> KeyResult<Vec<String>>;

    /// Notification that some of this provider's keys were trusted
    async fn keys_trusted(
        &self,
        _keys: &[Key],
        _email: &str,
        _purpose: KeyPurpose,
        _trust_data: Option<&KeyTrustData>,
    ) -> KeyResult<()> {
        Ok(())
    }
}

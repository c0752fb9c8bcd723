//! Scripted key provider shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use keymgr_core::key_types::FINGERPRINT_LEN;
use keymgr_core::{
    ExportedKeyring, Fingerprint, Key, KeyError, KeyGenerateOptions, KeyId, KeyManager, KeyPair,
    KeyProvider, KeyProviderCredentials, KeyPurpose, KeyResult, KeyRingType, KeyTrustData,
    KeyUnlockData, KeyringExportOptions, LockState, PassphraseCallback, ProviderRegistry,
    FanOutPolicy, TrustStore,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Prefix of the serialization the mock provider imports
pub const MOCK_BUNDLE_PREFIX: &str = "MOCK\n";

/// Passphrase accepted for protected mock import units
pub const MOCK_PASSPHRASE: &str = "open sesame";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    Failing,
    Hanging,
}

/// Holds one call to a gated operation until the test releases it
#[derive(Default)]
pub struct Gate {
    /// Signalled once the gated call is in flight
    pub entered: Notify,
    pub release: Notify,
}

pub struct MockProvider {
    id: String,
    keys: Mutex<Vec<Key>>,
    behavior: Mutex<Behavior>,
    pub unlock_calls: AtomicUsize,
    pub trust_notifications: Mutex<Vec<(String, KeyPurpose, usize)>>,
    next_byte: AtomicUsize,
    gate: Mutex<Option<(&'static str, Arc<Gate>)>>,
}

impl MockProvider {
    pub fn new(id: &str, keys: Vec<Key>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            keys: Mutex::new(keys),
            behavior: Mutex::new(Behavior::Healthy),
            unlock_calls: AtomicUsize::new(0),
            trust_notifications: Mutex::new(Vec::new()),
            next_byte: AtomicUsize::new(200),
            gate: Mutex::new(None),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn holds(&self, fingerprint: &Fingerprint) -> bool {
        self.keys
            .lock()
            .unwrap()
            .iter()
            .any(|k| k.fingerprint == *fingerprint)
    }

    /// Hold the next call to `operation` until the gate is released
    pub fn gate(&self, operation: &'static str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some((operation, gate.clone()));
        gate
    }

    async fn pass_gate(&self, operation: &str) {
        let gate = {
            let mut slot = self.gate.lock().unwrap();
            let gated = matches!(slot.as_ref(), Some((name, _)) if *name == operation);
            if gated {
                slot.take().map(|(_, gate)| gate)
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }

    async fn check(&self) -> KeyResult<()> {
        let behavior = *self.behavior.lock().unwrap();
        match behavior {
            Behavior::Healthy => Ok(()),
            Behavior::Failing => Err(KeyError::unavailable(self.id.clone(), "backend offline")),
            Behavior::Hanging => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }

    fn select<F: Fn(&Key) -> bool>(&self, filter: F) -> Vec<Key> {
        self.keys
            .lock()
            .unwrap()
            .iter()
            .filter(|k| filter(k))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl KeyProvider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get_all_keys(&self, keyring_type: KeyRingType) -> KeyResult<Vec<Key>> {
        self.pass_gate("get_all_keys").await;
        self.check().await?;
        Ok(self.select(|k| keyring_type.includes(k)))
    }

    async fn get_keys_by_email(&self, email: &str) -> KeyResult<Vec<Key>> {
        self.check().await?;
        Ok(self.select(|k| k.has_email(email)))
    }

    async fn get_keys_by_key_id(&self, id: &KeyId) -> KeyResult<Vec<Key>> {
        self.check().await?;
        Ok(self.select(|k| k.key_id == *id))
    }

    async fn get_key_by_fingerprint(&self, fingerprint: &Fingerprint) -> KeyResult<Option<Key>> {
        self.check().await?;
        Ok(self.select(|k| k.fingerprint == *fingerprint).into_iter().next())
    }

    async fn get_key_generate_options(&self) -> KeyResult<Vec<KeyGenerateOptions>> {
        self.check().await?;
        Ok(vec![KeyGenerateOptions::new(self.id.clone()).with("algorithm", "mock")])
    }

    async fn generate_key_pair(
        &self,
        user_id: &str,
        _options: &KeyGenerateOptions,
    ) -> KeyResult<KeyPair> {
        self.check().await?;
        let byte = self.next_byte.fetch_add(1, Ordering::SeqCst) as u8;
        let mut public = key(byte, &self.id, &[KeyPurpose::Verification, KeyPurpose::Encryption], false);
        public.user_ids = vec![user_id.to_string()];
        let mut secret = key(byte, &self.id, &[KeyPurpose::Signing, KeyPurpose::Decryption], true);
        secret.user_ids = vec![user_id.to_string()];

        let mut keys = self.keys.lock().unwrap();
        keys.push(public.clone());
        keys.push(secret.clone());
        Ok(KeyPair { public, secret })
    }

    async fn get_keyring_export_options(
        &self,
        keyring_type: KeyRingType,
    ) -> KeyResult<Vec<KeyringExportOptions>> {
        self.check().await?;
        Ok(vec![KeyringExportOptions {
            provider_id: self.id.clone(),
            keyring_type,
            format: "mock".to_string(),
            parameters: Default::default(),
        }])
    }

    async fn export_keyring(
        &self,
        keyring_type: KeyRingType,
        _options: &KeyringExportOptions,
    ) -> KeyResult<ExportedKeyring> {
        self.check().await?;
        let count = self.select(|k| keyring_type.includes(k)).len();
        Ok(ExportedKeyring {
            provider_id: self.id.clone(),
            format: "mock".to_string(),
            payload: format!("{} keys", count).into_bytes(),
        })
    }

    async fn set_credentials(&self, credentials: &KeyProviderCredentials) -> KeyResult<()> {
        self.check().await?;
        match credentials.get("token").and_then(|v| v.as_str()) {
            Some("valid") => Ok(()),
            _ => Err(KeyError::CredentialRejected("bad token".to_string())),
        }
    }

    async fn unlock_key(&self, key: &Key, _unlock_data: &KeyUnlockData) -> KeyResult<Key> {
        self.pass_gate("unlock_key").await;
        self.check().await?;
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        let mut keys = self.keys.lock().unwrap();
        let stored = keys
            .iter_mut()
            .find(|k| k.fingerprint == key.fingerprint && k.is_secret == key.is_secret)
            .ok_or_else(|| KeyError::KeyNotFound(key.fingerprint.to_string()))?;
        stored.lock_state = LockState::Unlocked;
        Ok(stored.clone())
    }

    async fn remove_keys(&self, fingerprints: &[Fingerprint]) -> KeyResult<()> {
        self.check().await?;
        self.keys
            .lock()
            .unwrap()
            .retain(|k| !fingerprints.contains(&k.fingerprint));
        Ok(())
    }

    /// Lines after the prefix are `user id` or `user id|protected`
    async fn import_keys(
        &self,
        serialization: &[u8],
        passphrase_callback: PassphraseCallback,
    ) -> KeyResult<Vec<String>> {
        let text = std::str::from_utf8(serialization)
            .ok()
            .and_then(|t| t.strip_prefix(MOCK_BUNDLE_PREFIX))
            .ok_or_else(|| KeyError::UnsupportedFormat("not a mock bundle".to_string()))?
            .to_string();
        self.check().await?;

        let mut imported = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let (user_id, protected) = match line.split_once('|') {
                Some((uid, _)) => (uid.to_string(), true),
                None => (line.to_string(), false),
            };
            if protected {
                match passphrase_callback(user_id.clone()).await {
                    Ok(passphrase) if passphrase == MOCK_PASSPHRASE => {}
                    _ => continue,
                }
            }
            let byte = self.next_byte.fetch_add(1, Ordering::SeqCst) as u8;
            let mut public = key(byte, &self.id, &[KeyPurpose::Verification], false);
            public.user_ids = vec![user_id.clone()];
            self.keys.lock().unwrap().push(public);
            imported.push(user_id);
        }
        Ok(imported)
    }

    async fn keys_trusted(
        &self,
        keys: &[Key],
        email: &str,
        purpose: KeyPurpose,
        _trust_data: Option<&KeyTrustData>,
    ) -> KeyResult<()> {
        self.trust_notifications
            .lock()
            .unwrap()
            .push((email.to_string(), purpose, keys.len()));
        Ok(())
    }
}

pub fn fingerprint(byte: u8) -> Fingerprint {
    Fingerprint::new([byte; FINGERPRINT_LEN])
}

/// Key for `a@example.com` with the given identity byte
pub fn key(byte: u8, provider: &str, purposes: &[KeyPurpose], is_secret: bool) -> Key {
    let fingerprint = fingerprint(byte);
    Key {
        fingerprint,
        key_id: fingerprint.key_id(),
        provider_id: provider.to_string(),
        user_ids: vec!["A <a@example.com>".to_string()],
        purposes: purposes.iter().copied().collect::<BTreeSet<_>>(),
        is_secret,
        lock_state: LockState::Unlocked,
        created_at: 1_700_000_000,
        metadata: HashMap::new(),
    }
}

pub fn manager_with(providers: &[(Arc<MockProvider>, u32)], policy: FanOutPolicy) -> KeyManager {
    let mut registry = ProviderRegistry::new(policy);
    for (provider, rank) in providers {
        registry.register(provider.clone(), *rank).unwrap();
    }
    KeyManager::new(registry, Arc::new(TrustStore::in_memory()))
}

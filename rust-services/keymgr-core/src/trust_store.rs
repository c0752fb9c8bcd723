//! Trust records per (email, purpose)
//!
//! Every write replaces the whole trusted set for its (email, purpose) pair
//! and starts a new trust epoch. Each pair has its own lock, so readers see
//! a complete epoch and unrelated pairs never wait on each other.
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
use crate::key_types::{normalize_email, Fingerprint, KeyPurpose, KeyTrustData, UserEmail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

const DOCUMENT_VERSION: u32 = 1;

/// Trust lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrustKey {
    pub email: UserEmail,
    pub purpose: KeyPurpose,
}

impl TrustKey {
    pub fn new(email: &str, purpose: KeyPurpose) -> Self {
        Self {
            email: normalize_email(email),
            purpose,
        }
    }
}

/// The active trust epoch for one (email, purpose) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRecord {
    pub email: UserEmail,
    pub purpose: KeyPurpose,
    /// Store-wide counter, increases with every trust write
    pub epoch: u64,
    /// Trusted fingerprints in the order they were given
    pub fingerprints: Vec<Fingerprint>,
    #[serde(default)]
    pub trust_data: Option<KeyTrustData>,
    pub updated_at: i64,
}

impl TrustRecord {
    pub fn trusts(&self, fingerprint: &Fingerprint) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    fn key(&self) -> TrustKey {
        TrustKey::new(&self.email, self.purpose)
    }
}

#[derive(Serialize, Deserialize)]
struct TrustDocument {
    version: u32,
    next_epoch: u64,
    records: Vec<TrustRecord>,
}

type Slot = Arc<RwLock<Option<TrustRecord>>>;

/// Trust record store
pub struct TrustStore {
    slots: Mutex<HashMap<TrustKey, Slot>>,
    next_epoch: AtomicU64,
    /// Write-through JSON file, if any
    storage_path: Option<PathBuf>,
    persist_lock: Mutex<()>,
}

impl TrustStore {
    /// Create a store that keeps records in memory only
    pub fn in_memory() -> Self {
        Self::with_records(Vec::new(), 1, None)
    }

    /// Open a store backed by a JSON file, loading it if present
    pub async fn open<P: AsRef<Path>>(path: P) -> KeyResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let (records, next_epoch) = match fs::read_to_string(&path).await {
            Ok(content) => {
                let document: TrustDocument = serde_json::from_str(&content)?;
                if document.version != DOCUMENT_VERSION {
                    warn!(
                        path = %path.display(),
                        version = document.version,
                        "Unexpected trust document version, loading anyway"
                    );
                }
                (document.records, document.next_epoch)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (Vec::new(), 1),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), records = records.len(), "Opened trust store");
        Ok(Self::with_records(records, next_epoch, Some(path)))
    }

    fn with_records(records: Vec<TrustRecord>, next_epoch: u64, storage_path: Option<PathBuf>) -> Self {
        let highest = records.iter().map(|r| r.epoch).max().unwrap_or(0);
        let slots = records
            .into_iter()
            .map(|record| (record.key(), Arc::new(RwLock::new(Some(record)))))
            .collect();

        Self {
            slots: Mutex::new(slots),
            next_epoch: AtomicU64::new(next_epoch.max(highest + 1)),
            storage_path,
            persist_lock: Mutex::new(()),
        }
    }

    async fn slot(&self, key: &TrustKey) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(None)))
            .clone()
    }

    /// Active trust record, `None` when the pair was never trusted
    pub async fn record(&self, email: &str, purpose: KeyPurpose) -> Option<TrustRecord> {
        let key = TrustKey::new(email, purpose);
        let slot = self.slots.lock().await.get(&key).cloned()?;
        let record = slot.read().await.clone();
        record
    }

    /// Start a new trust epoch, replacing the trusted set for the pair.
    ///
    /// Fingerprints not listed are no longer trusted afterwards. The epoch
    /// takes effect even if writing the trust file fails; that failure is
    /// logged and the next successful write catches up.
    pub async fn replace(
        &self,
        email: &str,
        purpose: KeyPurpose,
        fingerprints: Vec<Fingerprint>,
        trust_data: Option<KeyTrustData>,
    ) -> KeyResult<TrustRecord> {
        let key = TrustKey::new(email, purpose);
        let slot = self.slot(&key).await;

        let record = {
            let mut guard = slot.write().await;

            let mut unique: Vec<Fingerprint> = Vec::with_capacity(fingerprints.len());
            for fp in fingerprints {
                if !unique.contains(&fp) {
                    unique.push(fp);
                }
            }

            let record = TrustRecord {
                email: key.email.clone(),
                purpose,
                epoch: self.next_epoch.fetch_add(1, Ordering::SeqCst),
                fingerprints: unique,
                trust_data,
                updated_at: chrono::Utc::now().timestamp(),
            };

            let demoted = guard
                .as_ref()
                .map(|previous| {
                    previous
                        .fingerprints
                        .iter()
                        .filter(|fp| !record.trusts(fp))
                        .count()
                })
                .unwrap_or(0);

            info!(
                email = %key.email,
                purpose = %purpose,
                epoch = record.epoch,
                trusted = record.fingerprints.len(),
                demoted,
                "Trust epoch replaced"
            );

            *guard = Some(record.clone());
            record
        };

        self.write_through().await;
        Ok(record)
    }

    /// Drop fingerprints from every record that names them.
    ///
    /// Returns the number of records changed.
    pub async fn purge(&self, fingerprints: &[Fingerprint]) -> KeyResult<usize> {
        if fingerprints.is_empty() {
            return Ok(0);
        }

        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut changed = 0;
        for slot in slots {
            let mut guard = slot.write().await;
            if let Some(record) = guard.as_mut() {
                let before = record.fingerprints.len();
                record.fingerprints.retain(|fp| !fingerprints.contains(fp));
                if record.fingerprints.len() != before {
                    record.updated_at = chrono::Utc::now().timestamp();
                    changed += 1;
                    debug!(
                        email = %record.email,
                        purpose = %record.purpose,
                        removed = before - record.fingerprints.len(),
                        "Purged removed keys from trust record"
                    );
                }
            }
        }

        if changed > 0 {
            info!(records = changed, "Trust records purged");
            self.write_through().await;
        }
        Ok(changed)
    }

    /// Snapshot of all records, ordered by email then purpose
    pub async fn records(&self) -> Vec<TrustRecord> {
        let slots: Vec<Slot> = self.slots.lock().await.values().cloned().collect();
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(record) = slot.read().await.clone() {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        records
    }

    /// Write the current state to the trust file, if the store has one
    pub async fn flush(&self) -> KeyResult<()> {
        self.persist().await
    }

    async fn write_through(&self) {
        if let Err(e) = self.persist().await {
            error!(error = %e, "Failed to save trust store, records kept in memory");
        }
    }

    async fn persist(&self) -> KeyResult<()> {
        let Some(path) = &self.storage_path else {
            return Ok(());
        };

        let _persisting = self.persist_lock.lock().await;
        let document = TrustDocument {
            version: DOCUMENT_VERSION,
            next_epoch: self.next_epoch.load(Ordering::SeqCst),
            records: self.records().await,
        };
        let json = serde_json::to_string_pretty(&document)?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, path).await?;

        debug!(path = %path.display(), records = document.records.len(), "Trust store saved");
        Ok(())
    }
}

impl Default for TrustStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_types::FINGERPRINT_LEN;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::new([byte; FINGERPRINT_LEN])
    }

    #[tokio::test]
    async fn test_untrusted_pair_has_no_record() {
        let store = TrustStore::in_memory();
        assert!(store.record("a@example.com", KeyPurpose::Encryption).await.is_none());
    }

    #[tokio::test]
    async fn test_replace_demotes_previous_epoch() {
        let store = TrustStore::in_memory();
        let first = store
            .replace("a@example.com", KeyPurpose::Decryption, vec![fp(1), fp(2)], None)
            .await
            .unwrap();
        let second = store
            .replace("A@Example.com", KeyPurpose::Decryption, vec![fp(2), fp(3), fp(2)], None)
            .await
            .unwrap();

        assert!(second.epoch > first.epoch);
        let record = store.record("a@example.com", KeyPurpose::Decryption).await.unwrap();
        assert_eq!(record.fingerprints, vec![fp(2), fp(3)]);
        assert!(!record.trusts(&fp(1)));
    }

    #[tokio::test]
    async fn test_purposes_are_independent() {
        let store = TrustStore::in_memory();
        store
            .replace("a@example.com", KeyPurpose::Signing, vec![fp(1)], None)
            .await
            .unwrap();
        store
            .replace("a@example.com", KeyPurpose::Encryption, vec![fp(2)], None)
            .await
            .unwrap();

        let signing = store.record("a@example.com", KeyPurpose::Signing).await.unwrap();
        assert_eq!(signing.fingerprints, vec![fp(1)]);
    }

    #[tokio::test]
    async fn test_purge_removes_fingerprint_everywhere() {
        let store = TrustStore::in_memory();
        store
            .replace("a@example.com", KeyPurpose::Signing, vec![fp(1), fp(2)], None)
            .await
            .unwrap();
        store
            .replace("b@example.com", KeyPurpose::Verification, vec![fp(1)], None)
            .await
            .unwrap();
        store
            .replace("c@example.com", KeyPurpose::Verification, vec![fp(3)], None)
            .await
            .unwrap();

        assert_eq!(store.purge(&[fp(1)]).await.unwrap(), 2);
        for record in store.records().await {
            assert!(!record.trusts(&fp(1)));
        }
        let a = store.record("a@example.com", KeyPurpose::Signing).await.unwrap();
        assert_eq!(a.fingerprints, vec![fp(2)]);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust").join("records.json");

        let last_epoch = {
            let store = TrustStore::open(&path).await.unwrap();
            store
                .replace(
                    "a@example.com",
                    KeyPurpose::Encryption,
                    vec![fp(7)],
                    Some(serde_json::json!({ "verified_by": "qr" })),
                )
                .await
                .unwrap()
                .epoch
        };

        let reopened = TrustStore::open(&path).await.unwrap();
        let record = reopened.record("a@example.com", KeyPurpose::Encryption).await.unwrap();
        assert_eq!(record.fingerprints, vec![fp(7)]);
        assert_eq!(record.trust_data, Some(serde_json::json!({ "verified_by": "qr" })));

        let next = reopened
            .replace("b@example.com", KeyPurpose::Encryption, vec![], None)
            .await
            .unwrap();
        assert!(next.epoch > last_epoch);
    }

    #[tokio::test]
    async fn test_readers_never_see_partial_epoch() {
        let store = Arc::new(TrustStore::in_memory());
        let set_a = vec![fp(1), fp(2), fp(3)];
        let set_b = vec![fp(4), fp(5), fp(6)];
        store
            .replace("a@example.com", KeyPurpose::Decryption, set_a.clone(), None)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let set = if i % 2 == 0 { set_b.clone() } else { set_a.clone() };
            tasks.push(tokio::spawn(async move {
                store
                    .replace("a@example.com", KeyPurpose::Decryption, set, None)
                    .await
                    .unwrap();
            }));
        }
        for _ in 0..20 {
            let store = store.clone();
            let (a, b) = (set_a.clone(), set_b.clone());
            tasks.push(tokio::spawn(async move {
                let record = store.record("a@example.com", KeyPurpose::Decryption).await.unwrap();
                assert!(record.fingerprints == a || record.fingerprints == b);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_epoch_commits_when_trust_file_cannot_be_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = TrustStore::open(dir.path().join("records.json")).await.unwrap();
        std::fs::remove_dir_all(dir.path()).unwrap();

        let record = store
            .replace("a@example.com", KeyPurpose::Signing, vec![fp(1)], None)
            .await
            .unwrap();
        assert_eq!(record.fingerprints, vec![fp(1)]);
        assert_eq!(
            store.record("a@example.com", KeyPurpose::Signing).await,
            Some(record)
        );
        assert!(store.flush().await.is_err());
    }
}

//! Provider registry
//!
//! Holds the registered providers in preference order and runs fan-out
//! queries against them.
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
use crate::key_types::KeyProviderCredentials;
use crate::provider::KeyProvider;
use futures::future::join_all;
use keymgr_config::KeyManagerConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How fan-out queries treat failing providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutPolicy {
    /// Return the successful providers' results when at least one succeeded
    pub resolve_provider_errors: bool,
    /// Upper bound for a single provider's answer
    pub timeout: Option<Duration>,
}

impl Default for FanOutPolicy {
    fn default() -> Self {
        Self {
            resolve_provider_errors: true,
            timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl From<&KeyManagerConfig> for FanOutPolicy {
    fn from(config: &KeyManagerConfig) -> Self {
        Self {
            resolve_provider_errors: config.resolve_provider_errors,
            timeout: config.provider_timeout(),
        }
    }
}

/// A registered provider with its rank and current credentials
pub struct ProviderEntry {
    provider: Arc<dyn KeyProvider>,
    rank: u32,
    credentials: RwLock<Option<KeyProviderCredentials>>,
}

impl ProviderEntry {
    pub fn id(&self) -> &str {
        self.provider.id()
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Credentials last accepted by the provider
    pub async fn credentials(&self) -> Option<KeyProviderCredentials> {
        self.credentials.read().await.clone()
    }

    /// Run one call against the provider.
    ///
    /// Credential updates for this provider wait until the call finishes.
    pub async fn call<T, F, Fut>(&self, f: F) -> KeyResult<T>
    where
        F: FnOnce(Arc<dyn KeyProvider>) -> Fut,
        Fut: Future<Output = KeyResult<T>>,
    {
        let _credentials = self.credentials.read().await;
        f(self.provider.clone()).await
    }

    /// Run a call that may wait on the user (passphrase entry, hardware
    /// confirmation).
    ///
    /// The provider reads its credentials when the call starts; the lock is
    /// not held while the call is suspended, so credential updates and the
    /// reads queued behind them keep moving.
    pub async fn call_interactive<T, F, Fut>(&self, f: F) -> KeyResult<T>
    where
        F: FnOnce(Arc<dyn KeyProvider>) -> Fut,
        Fut: Future<Output = KeyResult<T>>,
    {
        let provider = {
            let _credentials = self.credentials.read().await;
            self.provider.clone()
        };
        f(provider).await
    }

    /// Like [`ProviderEntry::call`], with waiting for the credentials lock
    /// counted against `limit`
    async fn call_within<T, F, Fut>(&self, limit: Option<Duration>, f: F) -> KeyResult<T>
    where
        F: FnOnce(Arc<dyn KeyProvider>) -> Fut,
        Fut: Future<Output = KeyResult<T>>,
    {
        match limit {
            Some(limit) => tokio::time::timeout(limit, self.call(f))
                .await
                .unwrap_or_else(|_| {
                    Err(KeyError::unavailable(
                        self.id(),
                        format!("no answer within {:?}", limit),
                    ))
                }),
            None => self.call(f).await,
        }
    }
}

/// Ordered set of active providers
pub struct ProviderRegistry {
    /// Sorted by rank, ties in registration order
    entries: Vec<Arc<ProviderEntry>>,
    policy: FanOutPolicy,
}

impl ProviderRegistry {
    /// Create an empty registry
    pub fn new(policy: FanOutPolicy) -> Self {
        Self {
            entries: Vec::new(),
            policy,
        }
    }

    /// Register a provider with a preference rank (lower is preferred)
    pub fn register(&mut self, provider: Arc<dyn KeyProvider>, rank: u32) -> KeyResult<()> {
        let id = provider.id().to_string();
        if id.is_empty() {
            return Err(KeyError::Configuration("Provider id must not be empty".to_string()));
        }
        if self.entries.iter().any(|e| e.id() == id) {
            return Err(KeyError::AlreadyExists(format!("provider {}", id)));
        }

        info!(provider = %id, rank, "Registering key provider");
        let position = self.entries.partition_point(|e| e.rank <= rank);
        self.entries.insert(
            position,
            Arc::new(ProviderEntry {
                provider,
                rank,
                credentials: RwLock::new(None),
            }),
        );
        Ok(())
    }

    pub fn policy(&self) -> FanOutPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Provider ids in preference order
    pub fn provider_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.id().to_string()).collect()
    }

    /// Entries in preference order
    pub fn by_preference(&self) -> impl Iterator<Item = &Arc<ProviderEntry>> {
        self.entries.iter()
    }

    /// Position of a provider in preference order
    pub fn preference_of(&self, provider_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == provider_id)
    }

    /// Look up a registered provider
    pub fn entry(&self, provider_id: &str) -> KeyResult<&Arc<ProviderEntry>> {
        self.entries
            .iter()
            .find(|e| e.id() == provider_id)
            .ok_or_else(|| KeyError::unavailable(provider_id, "provider is not registered"))
    }

    /// Run a single-target call; failures surface unchanged
    pub async fn with_provider<T, F, Fut>(&self, provider_id: &str, f: F) -> KeyResult<T>
    where
        F: FnOnce(Arc<dyn KeyProvider>) -> Fut,
        Fut: Future<Output = KeyResult<T>>,
    {
        self.entry(provider_id)?.call(f).await
    }

    /// Run a single-target call that may wait on the user
    pub async fn with_provider_interactive<T, F, Fut>(&self, provider_id: &str, f: F) -> KeyResult<T>
    where
        F: FnOnce(Arc<dyn KeyProvider>) -> Fut,
        Fut: Future<Output = KeyResult<T>>,
    {
        self.entry(provider_id)?.call_interactive(f).await
    }

    /// Issue the same query to every provider concurrently and concatenate
    /// the answers in preference order.
    ///
    /// Failed providers are dropped from the result when the policy allows
    /// it and at least one provider answered; otherwise the first failure
    /// is returned.
    pub async fn fan_out<T, F, Fut>(&self, operation: &str, f: F) -> KeyResult<Vec<T>>
    where
        F: Fn(Arc<dyn KeyProvider>) -> Fut,
        Fut: Future<Output = KeyResult<Vec<T>>>,
    {
        let (f, limit) = (&f, self.policy.timeout);
        let calls = self.entries.iter().map(|entry| async move {
            let result = entry.call_within(limit, f).await;
            (entry.id(), result)
        });
        let outcomes = join_all(calls).await;

        let mut merged = Vec::new();
        let mut failures = Vec::new();
        let mut answered = 0usize;
        for (provider_id, outcome) in outcomes {
            match outcome {
                Ok(items) => {
                    answered += 1;
                    merged.extend(items);
                }
                Err(e) => failures.push((provider_id, e)),
            }
        }

        if failures.is_empty() {
            debug!(operation, providers = answered, results = merged.len(), "Fan-out complete");
            return Ok(merged);
        }

        if self.policy.resolve_provider_errors && answered > 0 {
            for (provider_id, e) in &failures {
                warn!(
                    provider = %provider_id,
                    operation,
                    error = %e,
                    "Provider failed during fan-out, using remaining providers"
                );
            }
            return Ok(merged);
        }

        let mut failures = failures.into_iter();
        match failures.next() {
            Some((_, first)) => {
                for (provider_id, e) in failures {
                    warn!(provider = %provider_id, operation, error = %e, "Provider failed during fan-out");
                }
                Err(first)
            }
            None => Ok(merged),
        }
    }

    /// Walk providers in preference order until one returns a value.
    ///
    /// Provider failures and timeouts are skipped when the policy allows
    /// it; if nothing was found and a provider failed, that failure is
    /// returned.
    pub async fn first_match<T, F, Fut>(&self, operation: &str, f: F) -> KeyResult<Option<T>>
    where
        F: Fn(Arc<dyn KeyProvider>) -> Fut,
        Fut: Future<Output = KeyResult<Option<T>>>,
    {
        let mut first_failure = None;
        for entry in &self.entries {
            match entry.call_within(self.policy.timeout, &f).await {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => continue,
                Err(e) if self.policy.resolve_provider_errors => {
                    warn!(provider = %entry.id(), operation, error = %e, "Provider failed, trying next");
                    first_failure.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Replace a provider's credentials.
    ///
    /// Waits for in-flight calls against that provider, except interactive
    /// ones that are suspended on the user; other providers are not
    /// affected.
    pub async fn set_credentials(
        &self,
        provider_id: &str,
        credentials: KeyProviderCredentials,
    ) -> KeyResult<()> {
        let entry = self.entry(provider_id)?;
        let mut current = entry.credentials.write().await;

        entry
            .provider
            .set_credentials(&credentials)
            .await
            .map_err(|e| match e {
                KeyError::CredentialRejected(_) | KeyError::ProviderUnavailable { .. } => e,
                other => KeyError::CredentialRejected(other.to_string()),
            })?;

        *current = Some(credentials);
        info!(provider = provider_id, "Provider credentials updated");
        Ok(())
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new(FanOutPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_types::{KeyGenerateOptions, KeyRingType};
    use crate::software_provider::SoftwareKeyProvider;

    fn registry_with(ids_and_ranks: &[(&str, u32)]) -> ProviderRegistry {
        let mut registry = ProviderRegistry::default();
        for (id, rank) in ids_and_ranks {
            registry
                .register(Arc::new(SoftwareKeyProvider::in_memory(*id)), *rank)
                .unwrap();
        }
        registry
    }

    #[test]
    fn test_preference_order_follows_rank_then_registration() {
        let registry = registry_with(&[("remote", 2), ("token", 0), ("local", 2), ("backup", 1)]);
        assert_eq!(
            registry.provider_ids(),
            vec!["token", "backup", "remote", "local"]
        );
        assert_eq!(registry.preference_of("remote"), Some(2));
        assert_eq!(registry.preference_of("missing"), None);
    }

    #[test]
    fn test_duplicate_provider_is_rejected() {
        let mut registry = registry_with(&[("local", 0)]);
        let result = registry.register(Arc::new(SoftwareKeyProvider::in_memory("local")), 1);
        assert!(matches!(result, Err(KeyError::AlreadyExists(_))));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_unavailable() {
        let registry = registry_with(&[("local", 0)]);
        let result = registry
            .with_provider("nowhere", |p| async move { p.get_all_keys(KeyRingType::All).await })
            .await;
        assert!(matches!(result, Err(KeyError::ProviderUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_fan_out_concatenates_in_preference_order() {
        let registry = registry_with(&[("second", 1), ("first", 0)]);
        for id in ["first", "second"] {
            registry
                .with_provider(id, |p| async move {
                    p.generate_key_pair("Alice <alice@example.com>", &KeyGenerateOptions::new(id))
                        .await
                })
                .await
                .unwrap();
        }

        let keys = registry
            .fan_out("get_all_keys", |p| async move {
                p.get_all_keys(KeyRingType::Public).await
            })
            .await
            .unwrap();
        let owners: Vec<&str> = keys.iter().map(|k| k.provider_id.as_str()).collect();
        assert_eq!(owners, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_not_stored() {
        let registry = registry_with(&[("local", 0)]);
        let result = registry
            .set_credentials("local", serde_json::json!({ "master_key": "too-short" }))
            .await;
        assert!(matches!(result, Err(KeyError::CredentialRejected(_))));
        assert!(registry.entry("local").unwrap().credentials().await.is_none());

        let credentials = serde_json::json!({ "master_key": "11".repeat(32) });
        registry.set_credentials("local", credentials.clone()).await.unwrap();
        assert_eq!(
            registry.entry("local").unwrap().credentials().await,
            Some(credentials)
        );
    }
}

//! Service integration helpers for building a key manager from configuration
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
use crate::manager::KeyManager;
use crate::provider::KeyProvider;
use crate::registry::{FanOutPolicy, ProviderRegistry};
use crate::software_provider::SoftwareKeyProvider;
use crate::trust_store::TrustStore;
use keymgr_config::KeyManagerConfig;
use std::sync::Arc;
use tracing::{info, warn};

/// Provider id of the built-in software keyring
pub const LOCAL_PROVIDER_ID: &str = "local";

/// Initialize a key manager for an application session.
///
/// Registers the software keyring plus any `extra_providers`, each ranked
/// by `config.provider_ranks`, and opens the trust store.
pub async fn init_key_manager(
    config: &KeyManagerConfig,
    extra_providers: Vec<Arc<dyn KeyProvider>>,
) -> KeyResult<Arc<KeyManager>> {
    let mut registry = ProviderRegistry::new(FanOutPolicy::from(config));

    let local: Arc<dyn KeyProvider> = match &config.key_storage_path {
        Some(path) => {
            info!(path = %path, "Using persistent software keyring");
            Arc::new(SoftwareKeyProvider::open(LOCAL_PROVIDER_ID, path, None).await?)
        }
        None => {
            warn!("No key storage path configured, software keyring is in-memory only");
            Arc::new(SoftwareKeyProvider::in_memory(LOCAL_PROVIDER_ID))
        }
    };
    registry.register(local, config.rank_for(LOCAL_PROVIDER_ID))?;

    for provider in extra_providers {
        let rank = config.rank_for(provider.id());
        registry.register(provider, rank)?;
    }

    let trust_store = match &config.trust_store_path {
        Some(path) => TrustStore::open(path).await?,
        None => {
            warn!("No trust store path configured, trust records are in-memory only");
            TrustStore::in_memory()
        }
    };

    info!(
        providers = ?registry.provider_ids(),
        resolve_provider_errors = config.resolve_provider_errors,
        "Key manager initialized"
    );

    Ok(Arc::new(KeyManager::new(registry, Arc::new(trust_store))))
}

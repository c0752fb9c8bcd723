//! Key manager for multi-provider key resolution
//!
//! Resolves keys for callers across several key providers and enforces
//! the application's trust policy: which provider is preferred, which key
//! is authoritative for a user and purpose, and which provider failures
//! can be absorbed.
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


pub mod error;
pub mod key_types;
pub mod manager;
pub mod provider;
pub mod registry;
pub mod service_integration;
pub mod software_provider;
pub mod trust_store;

pub use error::{KeyError, KeyResult};
pub use key_types::{
    passphrase_callback, ExportedKeyring, Fingerprint, Key, KeyGenerateOptions, KeyId, KeyPair,
    KeyProviderCredentials, KeyPurpose, KeyRingType, KeyTrustData, KeyUnlockData,
    KeyringExportOptions, LockState, PassphraseCallback, ProviderId, UserEmail,
};
pub use manager::KeyManager;
pub use provider::KeyProvider;
pub use registry::{FanOutPolicy, ProviderEntry, ProviderRegistry};
pub use service_integration::*;
pub use software_provider::SoftwareKeyProvider;
pub use trust_store::{TrustRecord, TrustStore};

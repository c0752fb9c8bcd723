//! Error types for key management
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


use thiserror::Error;

/// Key management errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Provider unavailable: {provider_id}: {reason}")]
    ProviderUnavailable { provider_id: String, reason: String },

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Passphrase required: {0}")]
    PassphraseRequired(String),

    #[error("Passphrase rejected: {0}")]
    PassphraseRejected(String),

    #[error("Invalid purpose: {0}")]
    InvalidPurpose(String),

    #[error("Credentials rejected: {0}")]
    CredentialRejected(String),

    #[error("Unsupported key serialization: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KeyError {
    /// Shorthand for a provider that could not serve a request
    pub fn unavailable(provider_id: impl Into<String>, reason: impl Into<String>) -> Self {
        KeyError::ProviderUnavailable {
            provider_id: provider_id.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for key operations
pub type KeyResult<T> = Result<T, KeyError>;

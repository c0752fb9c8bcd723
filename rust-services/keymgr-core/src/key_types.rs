//! Key type definitions
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
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

/// Length of a key fingerprint in bytes
pub const FINGERPRINT_LEN: usize = 20;

/// Length of a key id in bytes
pub const KEY_ID_LEN: usize = 8;

/// Identifier of a registered key provider
pub type ProviderId = String;

/// E-mail address as used for trust lookups
pub type UserEmail = String;

/// Opaque data handed to a provider when unlocking a key
pub type KeyUnlockData = serde_json::Value;

/// Opaque data recorded alongside a trust epoch
pub type KeyTrustData = serde_json::Value;

/// Opaque credentials accepted by a provider
pub type KeyProviderCredentials = serde_json::Value;

/// Provider-interpreted option values
pub type Parameters = serde_json::Map<String, serde_json::Value>;

/// Asks the user for the passphrase of one encrypted unit.
///
/// The argument is a provider-chosen identifier of the unit.
pub type PassphraseCallback =
    Arc<dyn Fn(String) -> BoxFuture<'static, KeyResult<String>> + Send + Sync>;

/// Wrap an async closure into a [`PassphraseCallback`]
pub fn passphrase_callback<F, Fut>(f: F) -> PassphraseCallback
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = KeyResult<String>> + Send + 'static,
{
    Arc::new(move |identifier| f(identifier).boxed())
}

macro_rules! hex_identity {
    ($name:ident, $len:expr, $label:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(bytes: &[u8]) -> KeyResult<Self> {
                let array: [u8; $len] = bytes.try_into().map_err(|_| {
                    KeyError::InvalidFormat(format!(
                        "{} must be {} bytes, got {}",
                        $label,
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(array))
            }

            /// Parse from hex, ignoring whitespace and an optional `0x` prefix
            pub fn from_hex(input: &str) -> KeyResult<Self> {
                let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
                let cleaned = cleaned
                    .strip_prefix("0x")
                    .or_else(|| cleaned.strip_prefix("0X"))
                    .unwrap_or(&cleaned);
                let bytes = hex::decode(cleaned).map_err(|e| {
                    KeyError::InvalidFormat(format!("Invalid {} hex: {}", $label, e))
                })?;
                Self::from_slice(&bytes)
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode_upper(self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = KeyError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                Self::from_hex(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_identity!(Fingerprint, FINGERPRINT_LEN, "fingerprint");
hex_identity!(KeyId, KEY_ID_LEN, "key id");

impl Fingerprint {
    /// Key id derived from the low-order bytes of the fingerprint
    pub fn key_id(&self) -> KeyId {
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(&self.0[FINGERPRINT_LEN - KEY_ID_LEN..]);
        KeyId(id)
    }
}

impl KeyId {
    /// Reserved id that matches every key
    pub const WILDCARD: KeyId = KeyId([0u8; KEY_ID_LEN]);

    pub fn is_wildcard(&self) -> bool {
        *self == Self::WILDCARD
    }
}

/// Cryptographic role a key is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyPurpose {
    Verification,
    Decryption,
    Signing,
    Encryption,
}

impl KeyPurpose {
    pub const ALL: [KeyPurpose; 4] = [
        KeyPurpose::Verification,
        KeyPurpose::Decryption,
        KeyPurpose::Signing,
        KeyPurpose::Encryption,
    ];

    /// Whether a bare key id is enough to select keys for this purpose.
    ///
    /// Signing and encryption need a trust-resolved identity instead.
    pub fn allows_key_id_lookup(&self) -> bool {
        matches!(self, KeyPurpose::Verification | KeyPurpose::Decryption)
    }
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyPurpose::Verification => "verification",
            KeyPurpose::Decryption => "decryption",
            KeyPurpose::Signing => "signing",
            KeyPurpose::Encryption => "encryption",
        };
        f.write_str(name)
    }
}

/// Which subset of keys an aggregate query returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRingType {
    Public,
    Secret,
    All,
}

impl KeyRingType {
    pub fn includes(&self, key: &Key) -> bool {
        match self {
            KeyRingType::Public => !key.is_secret,
            KeyRingType::Secret => key.is_secret,
            KeyRingType::All => true,
        }
    }
}

/// Whether the secret material of a key is usable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Locked,
    Unlocked,
}

/// Key identity record as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub fingerprint: Fingerprint,
    pub key_id: KeyId,
    /// Provider owning this copy of the key
    pub provider_id: ProviderId,
    /// User ids, `Name <email>` or a bare address
    pub user_ids: Vec<String>,
    pub purposes: BTreeSet<KeyPurpose>,
    pub is_secret: bool,
    pub lock_state: LockState,
    /// Creation time (unix seconds)
    pub created_at: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Key {
    pub fn supports(&self, purpose: KeyPurpose) -> bool {
        self.purposes.contains(&purpose)
    }

    pub fn is_unlocked(&self) -> bool {
        self.lock_state == LockState::Unlocked
    }

    /// Normalized e-mail addresses found in the user ids
    pub fn emails(&self) -> Vec<UserEmail> {
        let mut emails: Vec<UserEmail> = self
            .user_ids
            .iter()
            .filter_map(|uid| email_from_user_id(uid))
            .collect();
        emails.dedup();
        emails
    }

    pub fn has_email(&self, email: &str) -> bool {
        let wanted = normalize_email(email);
        self.user_ids
            .iter()
            .filter_map(|uid| email_from_user_id(uid))
            .any(|e| e == wanted)
    }
}

/// Public and secret halves of a freshly generated key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub public: Key,
    pub secret: Key,
}

impl KeyPair {
    /// Purposes supported by either half
    pub fn purposes(&self) -> BTreeSet<KeyPurpose> {
        self.public
            .purposes
            .union(&self.secret.purposes)
            .copied()
            .collect()
    }
}

/// Key generation options declared by (or chosen for) one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyGenerateOptions {
    pub provider_id: ProviderId,
    #[serde(default)]
    pub parameters: Parameters,
}

impl KeyGenerateOptions {
    pub fn new(provider_id: impl Into<ProviderId>) -> Self {
        Self {
            provider_id: provider_id.into(),
            parameters: Parameters::new(),
        }
    }

    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(name.to_string(), value.into());
        self
    }

    pub fn parameter_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(|v| v.as_str())
    }
}

/// Keyring export options declared by one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyringExportOptions {
    pub provider_id: ProviderId,
    pub keyring_type: KeyRingType,
    pub format: String,
    #[serde(default)]
    pub parameters: Parameters,
}

/// Provider-produced keyring export; the payload is not interpreted here
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedKeyring {
    pub provider_id: ProviderId,
    pub format: String,
    pub payload: Vec<u8>,
}

/// Lower-case and trim an e-mail address
pub fn normalize_email(email: &str) -> UserEmail {
    email.trim().to_lowercase()
}

/// Extract the e-mail address from a user id.
///
/// Accepts `Name <addr@host>` and bare `addr@host`.
pub fn email_from_user_id(user_id: &str) -> Option<UserEmail> {
    let trimmed = user_id.trim();
    if let (Some(start), Some(end)) = (trimmed.rfind('<'), trimmed.rfind('>')) {
        if start < end {
            let inner = trimmed[start + 1..end].trim();
            return inner.contains('@').then(|| normalize_email(inner));
        }
        return None;
    }
    if trimmed.contains('@') && !trimmed.contains(char::is_whitespace) {
        return Some(normalize_email(trimmed));
    }
    None
}

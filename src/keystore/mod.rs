use std::{fmt, str::FromStr};

use openssl::{
    error::ErrorStack,
    pkey::{PKey, Private},
    x509::{
        store::{X509Store, X509StoreBuilder},
        X509,
    },
};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

mod decode;
mod error;
pub mod loader;
pub mod reference;

pub use error::KeystoreError;
pub use loader::{load_for, load_keystore, KeystoreLoader, KeystoreTarget};
pub use reference::{stream_keystore, validate_keystore, CredentialReference};

/// Encodings a keystore can be loaded from
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KeystoreType {
    /// PKCS#12 container (`.p12` / `.pfx`)
    #[default]
    Pkcs12,
    /// PEM bundle: certificates plus an optional (possibly encrypted) private key
    Pem,
}

impl FromStr for KeystoreType {
    type Err = KeystoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pkcs12" | "p12" | "pfx" => Ok(KeystoreType::Pkcs12),
            "pem" => Ok(KeystoreType::Pem),
            _ => Err(KeystoreError::UnsupportedType(s.to_string())),
        }
    }
}

impl fmt::Display for KeystoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeystoreType::Pkcs12 => f.write_str("PKCS12"),
            KeystoreType::Pem => f.write_str("PEM"),
        }
    }
}

impl<'de> Deserialize<'de> for KeystoreType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Secret used to decrypt a keystore.
///
/// An absent password is treated as the empty string. The value is wiped from
/// memory on drop and never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeystorePassword(String);

impl KeystorePassword {
    pub fn new(password: impl Into<String>) -> Self {
        KeystorePassword(password.into())
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeystorePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeystorePassword(***)")
    }
}

impl From<&str> for KeystorePassword {
    fn from(value: &str) -> Self {
        KeystorePassword::new(value)
    }
}

impl From<String> for KeystorePassword {
    fn from(value: String) -> Self {
        KeystorePassword(value)
    }
}

impl From<Option<&str>> for KeystorePassword {
    fn from(value: Option<&str>) -> Self {
        KeystorePassword::new(value.unwrap_or_default())
    }
}

impl Serialize for KeystorePassword {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for KeystorePassword {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(KeystorePassword)
    }
}

/// A single aliased keystore entry
#[derive(Debug, Clone)]
pub enum KeystoreEntry {
    /// A trusted certificate with no private key
    Certificate(X509),
    /// A private key together with its certificate chain (leaf first)
    PrivateKey {
        key: PKey<Private>,
        chain: Vec<X509>,
    },
}

impl KeystoreEntry {
    /// The certificate of this entry (the leaf for key entries)
    pub fn certificate(&self) -> Option<&X509> {
        match self {
            KeystoreEntry::Certificate(cert) => Some(cert),
            KeystoreEntry::PrivateKey { chain, .. } => chain.first(),
        }
    }

    pub fn is_key_entry(&self) -> bool {
        matches!(self, KeystoreEntry::PrivateKey { .. })
    }
}

/// Loaded, in-memory credential store keyed by alias.
///
/// Entries keep their insertion order. Setting an alias that already exists
/// replaces its entry in place.
#[derive(Debug, Clone)]
pub struct Keystore {
    keystore_type: KeystoreType,
    entries: Vec<(String, KeystoreEntry)>,
}

impl Keystore {
    pub fn new(keystore_type: KeystoreType) -> Self {
        Keystore {
            keystore_type,
            entries: Vec::new(),
        }
    }

    pub fn keystore_type(&self) -> KeystoreType {
        self.keystore_type
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(alias, _)| alias.as_str())
    }

    pub fn contains_alias(&self, alias: &str) -> bool {
        self.entry(alias).is_some()
    }

    pub fn entry(&self, alias: &str) -> Option<&KeystoreEntry> {
        self.entries
            .iter()
            .find(|(name, _)| name == alias)
            .map(|(_, entry)| entry)
    }

    pub fn certificate(&self, alias: &str) -> Option<&X509> {
        self.entry(alias).and_then(KeystoreEntry::certificate)
    }

    pub fn set_certificate_entry(&mut self, alias: impl Into<String>, certificate: X509) {
        self.insert(alias.into(), KeystoreEntry::Certificate(certificate));
    }

    pub fn set_key_entry(&mut self, alias: impl Into<String>, key: PKey<Private>, chain: Vec<X509>) {
        self.insert(alias.into(), KeystoreEntry::PrivateKey { key, chain });
    }

    /// Certificates stored as trusted entries (key entries are skipped)
    pub fn trusted_certificates(&self) -> impl Iterator<Item = &X509> {
        self.entries.iter().filter_map(|(_, entry)| match entry {
            KeystoreEntry::Certificate(cert) => Some(cert),
            KeystoreEntry::PrivateKey { .. } => None,
        })
    }

    /// Builds an OpenSSL trust store from the trusted certificate entries
    pub fn trust_store(&self) -> Result<X509Store, ErrorStack> {
        let mut builder = X509StoreBuilder::new()?;
        for cert in self.trusted_certificates() {
            builder.add_cert(cert.clone())?;
        }

        Ok(builder.build())
    }

    fn insert(&mut self, alias: String, entry: KeystoreEntry) {
        match self.entries.iter_mut().find(|(name, _)| *name == alias) {
            Some(slot) => slot.1 = entry,
            None => self.entries.push((alias, entry)),
        }
    }
}

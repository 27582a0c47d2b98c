use std::{
    borrow::Cow,
    io::Read,
    sync::{Arc, Mutex, PoisonError},
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::{
    decode::decode, reference::stream_keystore, CredentialReference, Keystore, KeystoreError,
    KeystorePassword, KeystoreType,
};

/// Read-only view of the configuration a keystore belongs to
pub trait KeystoreTarget {
    /// Logical identity used to serialize loads for the same target
    fn identity(&self) -> Cow<'_, str>;

    fn keystore_type(&self) -> KeystoreType;

    fn keystore_password(&self) -> Option<&str>;

    /// Where this target's keystore lives, if configured
    fn keystore_reference(&self) -> Option<CredentialReference>;
}

/// Loads keystores while serializing concurrent loads for the same target.
///
/// Each target identity gets its own lock, created on first use and kept for
/// the lifetime of the loader. The lock is held from reference resolution
/// until the stream is released.
#[derive(Debug, Default)]
pub struct KeystoreLoader {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeystoreLoader {
    pub fn new() -> Self {
        KeystoreLoader::default()
    }

    /// Loads the keystore the target itself references
    pub fn load_for<T: KeystoreTarget + ?Sized>(&self, target: &T) -> Result<Keystore, KeystoreError> {
        self.load(target, target.keystore_reference())
    }

    /// Loads `source` using the target's keystore type and password
    pub fn load<T: KeystoreTarget + ?Sized>(
        &self,
        target: &T,
        source: Option<CredentialReference>,
    ) -> Result<Keystore, KeystoreError> {
        let password = KeystorePassword::from(target.keystore_password());
        self.load_keystore(&target.identity(), source, target.keystore_type(), &password)
    }

    pub fn load_keystore(
        &self,
        identity: &str,
        source: Option<CredentialReference>,
        keystore_type: KeystoreType,
        password: &KeystorePassword,
    ) -> Result<Keystore, KeystoreError> {
        let lock = self.lock_for(identity);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        debug!(identity, %keystore_type, ?source, "loading keystore");

        let mut stream = stream_keystore(source)?;
        let mut bytes = Zeroizing::new(Vec::new());
        let read = stream.read_to_end(&mut bytes);
        drop(stream);

        let result = read
            .map_err(|err| KeystoreError::Keystore(format!("failed to read keystore: {err}")))
            .and_then(|_| decode(&bytes, keystore_type, password));

        match &result {
            Ok(keystore) => debug!(
                identity,
                entries = keystore.len(),
                "keystore loaded"
            ),
            Err(err) => warn!(identity, error = %err, "failed to load keystore"),
        }

        result
    }

    fn lock_for(&self, identity: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(identity) {
            return Arc::clone(lock.value());
        }

        Arc::clone(self.locks.entry(identity.to_string()).or_default().value())
    }
}

static LOADER: Lazy<KeystoreLoader> = Lazy::new(KeystoreLoader::new);

/// Loads a keystore through the process-wide loader
pub fn load_keystore(
    identity: &str,
    source: Option<CredentialReference>,
    keystore_type: KeystoreType,
    password: &KeystorePassword,
) -> Result<Keystore, KeystoreError> {
    LOADER.load_keystore(identity, source, keystore_type, password)
}

/// Loads the target's own keystore through the process-wide loader
pub fn load_for<T: KeystoreTarget + ?Sized>(target: &T) -> Result<Keystore, KeystoreError> {
    LOADER.load_for(target)
}

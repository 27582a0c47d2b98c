use openssl::error::ErrorStack;
use thiserror::Error;

/// Raised for encrypted PEM keys when no password is configured
pub(crate) const BLANK_PASSWORD_UNSUPPORTED: &str =
    "Blank passwords not supported. You must create your keystore with a non-empty password.";

/// OpenSSL reasons raised when the password does not decrypt the keystore
const PASSWORD_REASONS: &[&str] = &[
    "mac verify failure",
    "bad decrypt",
    "bad password read",
    "pkcs12 cipherfinal error",
    "problems getting password",
    "pkcs12 pbe crypt error",
];

/// OpenSSL reasons raised when the bytes are not a valid encoding
const FORMAT_REASONS: &[&str] = &[
    "wrong tag",
    "header too long",
    "not enough data",
    "nested asn1 error",
    "too long",
    "bad object header",
    "no start line",
    "decode error",
];

/// Errors raised while resolving or decoding a keystore
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// The reference is missing, empty or points to something that is not a readable file
    #[error("Invalid keystore reference: {0}")]
    InvalidReference(String),

    /// The password could not decrypt the keystore
    #[error("Invalid keystore password: {0}")]
    InvalidPassword(String),

    /// The bytes are not a valid keystore of the declared type
    #[error("Invalid keystore format: {0}")]
    InvalidFormat(String),

    /// The requested keystore type is not known
    #[error("Unsupported keystore type: {0}")]
    UnsupportedType(String),

    /// Any other load failure
    #[error("Keystore exception: {0}")]
    Keystore(String),
}

/// The decoding step that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Structural parsing of the container
    Parse,
    /// Decrypting and extracting the contents
    Decrypt,
}

/// Maps an OpenSSL failure to a `KeystoreError` kind.
///
/// A missing algorithm (e.g. a legacy cipher whose provider is not loaded) is
/// neither a password nor a format problem and lands in `Keystore`.
pub(crate) fn classify(stage: Stage, err: &ErrorStack) -> KeystoreError {
    let reasons: Vec<String> = err
        .errors()
        .iter()
        .filter_map(|e| e.reason())
        .map(str::to_lowercase)
        .collect();

    let matches_any = |patterns: &[&str]| {
        reasons
            .iter()
            .any(|reason| patterns.iter().any(|pattern| reason.contains(pattern)))
    };

    if matches_any(PASSWORD_REASONS) {
        return KeystoreError::InvalidPassword(err.to_string());
    }

    let asn1_library = err
        .errors()
        .iter()
        .filter_map(|e| e.library())
        .any(|library| library.to_lowercase().contains("asn1"));

    if stage == Stage::Parse || asn1_library || matches_any(FORMAT_REASONS) {
        return KeystoreError::InvalidFormat(err.to_string());
    }

    KeystoreError::Keystore(err.to_string())
}

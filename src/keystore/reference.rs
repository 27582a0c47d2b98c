use std::{
    fmt,
    fs::{self, File},
    io::{BufReader, Cursor, Read},
    path::{Path, PathBuf},
};

use bytes::Bytes;

use super::KeystoreError;

/// Where keystore material lives
pub enum CredentialReference {
    /// Keystore bytes already in memory
    Bytes(Bytes),
    /// A keystore file on disk
    Path(PathBuf),
    /// An already-open stream, read to the end when loading
    Stream(Box<dyn Read + Send>),
}

impl CredentialReference {
    pub fn stream<R>(reader: R) -> Self
    where
        R: Read + Send + 'static,
    {
        CredentialReference::Stream(Box::new(reader))
    }
}

impl fmt::Debug for CredentialReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialReference::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            CredentialReference::Path(path) => write!(f, "Path({})", path.display()),
            CredentialReference::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for CredentialReference {
    fn from(value: Bytes) -> Self {
        CredentialReference::Bytes(value)
    }
}

impl From<Vec<u8>> for CredentialReference {
    fn from(value: Vec<u8>) -> Self {
        CredentialReference::Bytes(Bytes::from(value))
    }
}

impl From<PathBuf> for CredentialReference {
    fn from(value: PathBuf) -> Self {
        CredentialReference::Path(value)
    }
}

impl From<&Path> for CredentialReference {
    fn from(value: &Path) -> Self {
        CredentialReference::Path(value.to_path_buf())
    }
}

/// A string reference is always a file path
impl From<&str> for CredentialReference {
    fn from(value: &str) -> Self {
        CredentialReference::Path(PathBuf::from(value))
    }
}

impl From<String> for CredentialReference {
    fn from(value: String) -> Self {
        CredentialReference::Path(PathBuf::from(value))
    }
}

/// Checks that a reference can be resolved, without opening it.
///
/// Streams are accepted as-is since their size cannot be known upfront.
pub fn validate_keystore(reference: Option<&CredentialReference>) -> Result<(), KeystoreError> {
    match reference.ok_or_else(missing_reference)? {
        CredentialReference::Stream(_) => Ok(()),
        CredentialReference::Path(path) => validate_path(path),
        CredentialReference::Bytes(bytes) => {
            if bytes.is_empty() {
                return Err(KeystoreError::InvalidReference(
                    "Byte array is empty".to_string(),
                ));
            }
            Ok(())
        }
    }
}

/// Validates a reference and turns it into a readable stream
pub fn stream_keystore(
    reference: Option<CredentialReference>,
) -> Result<Box<dyn Read + Send>, KeystoreError> {
    validate_keystore(reference.as_ref())?;

    match reference.ok_or_else(missing_reference)? {
        CredentialReference::Stream(stream) => Ok(stream),
        CredentialReference::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes))),
        CredentialReference::Path(path) => File::open(&path)
            .map(|file| Box::new(BufReader::new(file)) as Box<dyn Read + Send>)
            .map_err(|err| {
                KeystoreError::InvalidReference(format!("{}: {err}", path.display()))
            }),
    }
}

fn validate_path(path: &Path) -> Result<(), KeystoreError> {
    let shown = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());

    if !path.exists() {
        return Err(KeystoreError::InvalidReference(format!(
            "File does not exist: {}",
            shown.display()
        )));
    }

    if !path.is_file() {
        return Err(KeystoreError::InvalidReference(format!(
            "Path does not refer to a valid file: {}",
            shown.display()
        )));
    }

    let metadata = fs::metadata(path).map_err(|err| {
        KeystoreError::InvalidReference(format!("{}: {err}", shown.display()))
    })?;
    if metadata.len() == 0 {
        return Err(KeystoreError::InvalidReference(format!(
            "File is empty: {}",
            shown.display()
        )));
    }

    Ok(())
}

fn missing_reference() -> KeystoreError {
    KeystoreError::InvalidReference("no keystore reference provided".to_string())
}

use once_cell::sync::Lazy;
use openssl::{
    pkcs12::Pkcs12,
    pkey::{PKey, Private},
    provider::Provider,
    x509::X509,
};
use tracing::warn;

use super::{
    error::{classify, Stage, BLANK_PASSWORD_UNSUPPORTED},
    Keystore, KeystoreError, KeystorePassword, KeystoreType,
};

/// Alias given to a key entry that carries no friendly name
pub(crate) const DEFAULT_KEY_ALIAS: &str = "1";

/// OpenSSL's legacy provider, kept loaded for the life of the process.
///
/// Keychain and older keytool exports encrypt their certificate bags with
/// RC2-40, which OpenSSL 3 only ships in this provider. The default provider
/// stays available next to it.
pub(crate) static LEGACY_PROVIDER: Lazy<Option<Provider>> =
    Lazy::new(|| match Provider::try_load(None, "legacy", true) {
        Ok(provider) => Some(provider),
        Err(err) => {
            warn!(error = %err, "OpenSSL legacy provider unavailable, RC2 keystores will not load");
            None
        }
    });

/// Decodes raw keystore bytes of the given type into a loaded `Keystore`
pub(crate) fn decode(
    bytes: &[u8],
    keystore_type: KeystoreType,
    password: &KeystorePassword,
) -> Result<Keystore, KeystoreError> {
    let keystore = match keystore_type {
        KeystoreType::Pkcs12 => decode_pkcs12(bytes, password)?,
        KeystoreType::Pem => decode_pem(bytes, password)?,
    };

    if keystore.is_empty() {
        return Err(KeystoreError::InvalidFormat(format!(
            "{keystore_type} keystore contains no entries"
        )));
    }

    Ok(keystore)
}

fn decode_pkcs12(bytes: &[u8], password: &KeystorePassword) -> Result<Keystore, KeystoreError> {
    Lazy::force(&LEGACY_PROVIDER);

    let pkcs12 = Pkcs12::from_der(bytes).map_err(|err| classify(Stage::Parse, &err))?;
    let parsed = pkcs12
        .parse2(password.expose())
        .map_err(|err| classify(Stage::Decrypt, &err))?;

    let mut keystore = Keystore::new(KeystoreType::Pkcs12);
    let mut chain: Vec<X509> = parsed
        .ca
        .map(|stack| stack.into_iter().collect())
        .unwrap_or_default();

    match (parsed.pkey, parsed.cert) {
        (Some(key), Some(cert)) => {
            let alias = friendly_name(&cert).unwrap_or_else(|| DEFAULT_KEY_ALIAS.to_string());
            chain.insert(0, cert);
            keystore.set_key_entry(alias, key, chain);
        }
        (Some(_), None) => {
            return Err(KeystoreError::InvalidFormat(
                "private key has no matching certificate".to_string(),
            ));
        }
        (None, cert) => {
            for (index, cert) in cert.into_iter().chain(chain).enumerate() {
                let alias = friendly_name(&cert).unwrap_or_else(|| (index + 1).to_string());
                keystore.set_certificate_entry(alias, cert);
            }
        }
    }

    Ok(keystore)
}

fn decode_pem(bytes: &[u8], password: &KeystorePassword) -> Result<Keystore, KeystoreError> {
    let certificates =
        X509::stack_from_pem(bytes).map_err(|err| classify(Stage::Parse, &err))?;
    if certificates.is_empty() {
        return Err(KeystoreError::InvalidFormat(
            "no PEM certificate found".to_string(),
        ));
    }

    let mut keystore = Keystore::new(KeystoreType::Pem);
    if contains(bytes, b"PRIVATE KEY-----") {
        let key = pem_private_key(bytes, password)?;
        keystore.set_key_entry(DEFAULT_KEY_ALIAS, key, certificates);
        return Ok(keystore);
    }

    for (index, cert) in certificates.into_iter().enumerate() {
        keystore.set_certificate_entry((index + 1).to_string(), cert);
    }

    Ok(keystore)
}

fn pem_private_key(
    bytes: &[u8],
    password: &KeystorePassword,
) -> Result<PKey<Private>, KeystoreError> {
    // Covers both PKCS#8 "ENCRYPTED PRIVATE KEY" and legacy "Proc-Type: 4,ENCRYPTED"
    let encrypted = contains(bytes, b"ENCRYPTED");

    // OpenSSL cannot decrypt with an empty passphrase; without one it would prompt on the tty
    if encrypted && password.is_blank() {
        return Err(KeystoreError::InvalidPassword(
            BLANK_PASSWORD_UNSUPPORTED.to_string(),
        ));
    }

    let key = if encrypted {
        PKey::private_key_from_pem_passphrase(bytes, password.expose().as_bytes())
    } else {
        PKey::private_key_from_pem(bytes)
    };

    key.map_err(|err| classify(Stage::Decrypt, &err))
}

fn friendly_name(cert: &X509) -> Option<String> {
    cert.alias()
        .map(|alias| String::from_utf8_lossy(alias).into_owned())
        .filter(|alias| !alias.is_empty())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

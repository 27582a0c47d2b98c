use itertools::Itertools;
use openssl::{
    hash::MessageDigest,
    x509::{X509NameRef, X509Ref, X509},
};
use tracing::debug;

/// Renders a distinguished name as `CN=..., O=...`
pub(crate) fn describe_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry.data().to_string().unwrap_or_default();
            format!("{key}={value}")
        })
        .join(", ")
}

/// Hex digest of the DER encoding, bytes separated by spaces
pub(crate) fn fingerprint(cert: &X509Ref, digest: MessageDigest) -> String {
    match cert.digest(digest) {
        Ok(bytes) => bytes.iter().map(|byte| format!("{byte:02x}")).join(" "),
        Err(err) => format!("unavailable ({err})"),
    }
}

pub(crate) fn log_certificate_chain(source: &str, chain: &[X509]) {
    debug!(source, certificates = chain.len(), "server sent {} certificate(s)", chain.len());

    for (index, cert) in chain.iter().enumerate() {
        debug!(
            index = index + 1,
            subject = %describe_name(cert.subject_name()),
            issuer = %describe_name(cert.issuer_name()),
            sha1 = %fingerprint(cert, MessageDigest::sha1()),
            md5 = %fingerprint(cert, MessageDigest::md5()),
            "certificate"
        );
    }
}

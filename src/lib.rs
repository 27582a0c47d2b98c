//! Certificate harvesting and keystore loading for push notification clients.
//!
//! [`harvest`] performs a TLS handshake against a push gateway and pins the
//! leaf certificate it presents, while [`keystore`] loads the client
//! credentials (PKCS#12 or PEM) that authenticate against it.

pub mod config;
pub mod harvest;
pub mod keystore;

mod tools;

#[cfg(test)]
mod test_support;

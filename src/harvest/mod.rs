use std::{
    fmt, io,
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use openssl::{
    error::ErrorStack,
    ssl::{HandshakeError, SslConnector, SslMethod, SslRef, SslVerifyMode},
    x509::{X509VerifyResult, X509},
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    keystore::{Keystore, KeystoreType},
    tools::log_certificate_chain,
};

mod trust;

pub use trust::{PlatformTrustManager, RecordingTrustManager, TrustManager};

/// Errors raised while harvesting a server certificate
#[derive(Debug, Error)]
pub enum HarvestError {
    /// The connection attempt completed without the server presenting a chain
    #[error("Could not obtain server certificate chain")]
    ChainNotObtained,

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The handshake failed for a reason other than certificate trust
    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("failed to set up TLS context: {0}")]
    Tls(#[from] ErrorStack),
}

/// The remote host whose certificate is harvested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Bound for connecting and for every read/write during the handshake
    pub timeout: Duration,
}

impl Endpoint {
    pub const PRODUCTION_HOST: &'static str = "feedback.push.apple.com";
    pub const SANDBOX_HOST: &'static str = "feedback.sandbox.push.apple.com";
    pub const DEFAULT_PORT: u16 = 2196;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    pub fn production() -> Self {
        Endpoint::new(Self::PRODUCTION_HOST, Self::DEFAULT_PORT)
    }

    pub fn sandbox() -> Self {
        Endpoint::new(Self::SANDBOX_HOST, Self::DEFAULT_PORT)
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Alias under which the chain entry at `index` is stored
    pub fn alias(&self, index: usize) -> String {
        format!("{}-{}", self.host, index + 1)
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::production()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Retrieves the certificate a TLS endpoint presents so it can be pinned.
///
/// This deliberately works around normal chain validation: the handshake runs
/// with a trust manager that records the presented chain, and a handshake
/// that fails only because the chain is not trusted is treated as success.
/// The harvested certificate must only be used for pinning the endpoint it
/// came from.
#[derive(Debug, Clone, Default)]
pub struct CertificateHarvester {
    endpoint: Endpoint,
}

impl CertificateHarvester {
    pub fn new(endpoint: Endpoint) -> Self {
        CertificateHarvester { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Performs one handshake and returns a keystore holding the leaf certificate
    pub fn harvest(&self) -> Result<Keystore, HarvestError> {
        let keystore = Keystore::new(KeystoreType::default());

        let trust = Arc::new(RecordingTrustManager::new(PlatformTrustManager));
        let connector = recording_connector(Arc::clone(&trust))?;

        debug!(endpoint = %self.endpoint, "opening connection");
        let stream = self.connect()?;
        let presented = self.handshake(&connector, stream)?;
        let recorded = trust.take_chain();

        // Diagnostics show the chain as sent by the peer; pinning uses the recorded leaf
        if let Some(chain) = presented.as_ref().or(recorded.as_ref()) {
            log_certificate_chain(&self.endpoint.to_string(), chain);
        }

        let keystore = pin_leaf(keystore, &self.endpoint, recorded)?;
        info!(
            endpoint = %self.endpoint,
            alias = %self.endpoint.alias(0),
            "harvested server certificate"
        );

        Ok(keystore)
    }

    fn connect(&self) -> Result<TcpStream, HarvestError> {
        let connect_error = |source| HarvestError::Connect {
            address: self.endpoint.to_string(),
            source,
        };

        let addresses = (self.endpoint.host.as_str(), self.endpoint.port)
            .to_socket_addrs()
            .map_err(connect_error)?;

        let mut last_error = None;
        for address in addresses {
            match TcpStream::connect_timeout(&address, self.endpoint.timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.endpoint.timeout))
                        .and_then(|()| stream.set_write_timeout(Some(self.endpoint.timeout)))
                        .map_err(connect_error)?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(%address, error = %err, "connection attempt failed");
                    last_error = Some(err);
                }
            }
        }

        Err(connect_error(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        })))
    }

    /// Runs the handshake; an untrusted chain is the expected outcome.
    ///
    /// Returns the chain exactly as the peer sent it, when OpenSSL kept one.
    fn handshake(
        &self,
        connector: &SslConnector,
        stream: TcpStream,
    ) -> Result<Option<Vec<X509>>, HarvestError> {
        debug!(endpoint = %self.endpoint, "starting TLS handshake");

        match connector.connect(&self.endpoint.host, stream) {
            Ok(mut tls) => {
                debug!("handshake completed, certificate is already trusted");
                let presented = presented_chain(tls.ssl());
                let _ = tls.shutdown();
                let _ = tls.get_ref().shutdown(Shutdown::Both);
                Ok(presented)
            }
            Err(HandshakeError::Failure(mid)) => {
                let verify_result = mid.ssl().verify_result();
                let _ = mid.get_ref().shutdown(Shutdown::Both);

                if verify_result == X509VerifyResult::OK {
                    return Err(HarvestError::Handshake(mid.error().to_string()));
                }

                debug!(reason = %verify_result, "server certificate is not trusted, using recorded chain");
                Ok(presented_chain(mid.ssl()))
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                let _ = mid.get_ref().shutdown(Shutdown::Both);
                Err(HarvestError::Handshake(format!(
                    "handshake did not complete within {:?}: {}",
                    self.endpoint.timeout,
                    mid.error()
                )))
            }
            Err(HandshakeError::SetupFailure(err)) => Err(HarvestError::Tls(err)),
        }
    }
}

/// Harvests the certificate presented by `endpoint`
pub fn harvest(endpoint: Endpoint) -> Result<Keystore, HarvestError> {
    CertificateHarvester::new(endpoint).harvest()
}

fn presented_chain(ssl: &SslRef) -> Option<Vec<X509>> {
    ssl.peer_cert_chain()
        .map(|chain| chain.iter().map(ToOwned::to_owned).collect())
}

/// A client connector whose trust decisions go through `trust`
fn recording_connector<T: TrustManager>(trust: Arc<T>) -> Result<SslConnector, ErrorStack> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())?;
    builder.set_verify_callback(SslVerifyMode::PEER, move |preverified, ctx| {
        trust.check_server_trusted(preverified, ctx)
    });

    Ok(builder.build())
}

/// Stores the leaf of a recorded chain under the endpoint's first alias
fn pin_leaf(
    mut keystore: Keystore,
    endpoint: &Endpoint,
    chain: Option<Vec<X509>>,
) -> Result<Keystore, HarvestError> {
    let chain = chain.filter(|chain| !chain.is_empty()).ok_or(HarvestError::ChainNotObtained)?;
    let leaf = chain.into_iter().next().ok_or(HarvestError::ChainNotObtained)?;
    keystore.set_certificate_entry(endpoint.alias(0), leaf);

    Ok(keystore)
}

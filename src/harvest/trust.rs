use std::sync::{Mutex, PoisonError};

use openssl::x509::{X509StoreContextRef, X509};
use tracing::debug;

/// Decides whether a server certificate chain is accepted during the handshake.
///
/// Called by OpenSSL for every certificate of the chain it builds, with
/// `preverified` carrying OpenSSL's own verdict for that position.
pub trait TrustManager: Send + Sync + 'static {
    fn check_server_trusted(&self, preverified: bool, ctx: &mut X509StoreContextRef) -> bool;
}

/// OpenSSL's default validation against the system verify paths
#[derive(Debug, Default, Clone, Copy)]
pub struct PlatformTrustManager;

impl TrustManager for PlatformTrustManager {
    fn check_server_trusted(&self, preverified: bool, ctx: &mut X509StoreContextRef) -> bool {
        if !preverified {
            debug!(
                depth = ctx.error_depth(),
                reason = %ctx.error(),
                "server certificate rejected by default trust manager"
            );
        }

        preverified
    }
}

/// Wraps another trust manager and keeps the chain it was asked to check.
///
/// The chain is stored before the inner manager is consulted, so it is
/// available even when the handshake is then aborted for lack of trust.
/// Only the first chain seen is kept.
#[derive(Debug)]
pub struct RecordingTrustManager<T> {
    inner: T,
    chain: Mutex<Option<Vec<X509>>>,
}

impl<T: TrustManager> RecordingTrustManager<T> {
    pub fn new(inner: T) -> Self {
        RecordingTrustManager {
            inner,
            chain: Mutex::new(None),
        }
    }

    /// The recorded chain, leaf first
    pub fn take_chain(&self) -> Option<Vec<X509>> {
        self.chain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl<T: TrustManager> TrustManager for RecordingTrustManager<T> {
    fn check_server_trusted(&self, preverified: bool, ctx: &mut X509StoreContextRef) -> bool {
        {
            let mut recorded = self.chain.lock().unwrap_or_else(PoisonError::into_inner);
            if recorded.is_none() {
                *recorded = ctx
                    .chain()
                    .map(|chain| chain.iter().map(ToOwned::to_owned).collect());
            }
        }

        self.inner.check_server_trusted(preverified, ctx)
    }
}

//! Client credentials for secure dials.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::TlsError;

/// Certificate chain and private key presented by the client.
pub struct ClientIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ClientIdentity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { cert_chain, key }
    }
}

impl Clone for ClientIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_chain", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

type CertificateProvider = Arc<dyn Fn() -> Result<ClientIdentity, TlsError> + Send + Sync>;
type AuthorityProvider =
    Arc<dyn Fn() -> Result<Vec<CertificateDer<'static>>, TlsError> + Send + Sync>;

/// Supplies credentials on every secure dial.
///
/// Providers are called per dial so rotated certificates are picked up
/// without rebuilding the client.
#[derive(Clone)]
pub struct TlsConfig {
    get_certificate: CertificateProvider,
    get_certificate_authorities: AuthorityProvider,
}

impl TlsConfig {
    pub fn new<C, A>(get_certificate: C, get_certificate_authorities: A) -> Self
    where
        C: Fn() -> Result<ClientIdentity, TlsError> + Send + Sync + 'static,
        A: Fn() -> Result<Vec<CertificateDer<'static>>, TlsError> + Send + Sync + 'static,
    {
        Self {
            get_certificate: Arc::new(get_certificate),
            get_certificate_authorities: Arc::new(get_certificate_authorities),
        }
    }

    /// Fixed credentials that never rotate.
    pub fn from_static(identity: ClientIdentity, authorities: Vec<CertificateDer<'static>>) -> Self {
        Self::new(
            move || Ok(identity.clone()),
            move || Ok(authorities.clone()),
        )
    }

    pub fn certificate(&self) -> Result<ClientIdentity, TlsError> {
        (self.get_certificate)()
    }

    pub fn certificate_authorities(&self) -> Result<Vec<CertificateDer<'static>>, TlsError> {
        (self.get_certificate_authorities)()
    }
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

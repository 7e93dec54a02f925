//! OCF identity certificate checks.
//!
//! An identity certificate carries the owning device or SDK id in its subject
//! common name as `uuid:<id>` and must be valid for both TLS roles plus the
//! OCF identity purpose.

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use uuid::Uuid;
use x509_parser::prelude::*;

use crate::error::IdentityError;
use crate::transport::PeerVerifier;

/// Extended key usage marking an OCF identity certificate.
pub const IDENTITY_CERTIFICATE_EKU: &str = "1.3.6.1.4.1.44924.1.6";

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, IdentityError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| IdentityError::Parse(e.to_string()))?;
    Ok(cert)
}

fn check_key_usage(cert: &X509Certificate<'_>) -> Result<(), IdentityError> {
    let eku = cert
        .extended_key_usage()
        .map_err(|e| IdentityError::Parse(e.to_string()))?
        .ok_or(IdentityError::MissingExtendedKeyUsage)?
        .value;

    if !eku.client_auth {
        return Err(IdentityError::MissingKeyUsage("client authentication"));
    }
    if !eku.server_auth {
        return Err(IdentityError::MissingKeyUsage("server authentication"));
    }
    if !eku
        .other
        .iter()
        .any(|oid| oid.to_id_string() == IDENTITY_CERTIFICATE_EKU)
    {
        return Err(IdentityError::MissingKeyUsage(IDENTITY_CERTIFICATE_EKU));
    }
    Ok(())
}

fn common_name_uuid(cert: &X509Certificate<'_>) -> Result<Uuid, IdentityError> {
    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .ok_or(IdentityError::MissingCommonName)?
        .as_str()
        .map_err(|e| IdentityError::InvalidCommonName(e.to_string()))?;

    let parts: Vec<&str> = cn.split(':').collect();
    if parts.len() != 2 || !parts[0].eq_ignore_ascii_case("uuid") {
        return Err(IdentityError::InvalidCommonName(cn.to_string()));
    }
    Uuid::parse_str(parts[1]).map_err(|_| IdentityError::InvalidCommonName(cn.to_string()))
}

/// Check that a DER certificate is a well-formed OCF identity certificate.
pub fn verify_identity_certificate(der: &[u8]) -> Result<(), IdentityError> {
    let cert = parse(der)?;
    check_key_usage(&cert)?;
    common_name_uuid(&cert)?;
    Ok(())
}

/// Extract the id carried by an identity certificate.
pub fn device_id_from_identity_certificate(der: &[u8]) -> Result<String, IdentityError> {
    let cert = parse(der)?;
    check_key_usage(&cert)?;
    Ok(common_name_uuid(&cert)?.to_string())
}

/// Peer verifier accepting only OCF identity certificates.
pub fn identity_verifier() -> PeerVerifier {
    Arc::new(|cert: &CertificateDer<'_>| verify_identity_certificate(cert.as_ref()))
}

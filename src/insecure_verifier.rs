//! An intentionally non-verifying TLS server certificate verifier, for connecting to
//! self-signed test fixtures and other situations where the caller has already established
//! trust out of band. Never wired in by default; callers opt in explicitly when building a
//! client [`rustls::ClientConfig`].

use std::sync::Arc;
use std::time::SystemTime;

use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, Error, ServerName};

pub struct DangerousCertificateNonverifier;

impl DangerousCertificateNonverifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl ServerCertVerifier for DangerousCertificateNonverifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }
}

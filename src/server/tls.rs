use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicServerConfig;
use quinn::{IdleTimeout, ServerConfig, TransportConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};

use crate::{wire, Result};

/// Connections with no traffic for this long are torn down by the
/// transport. This doubles as the dead peer detector.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the quinn server configuration around a fresh self-signed
/// identity for [`wire::SERVER_NAME`]. The certificate lives in memory
/// for the lifetime of the process; nothing is persisted or rotated.
pub fn server_config() -> Result<ServerConfig> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let cert = rcgen::generate_simple_self_signed(vec![wire::SERVER_NAME.into()])?;
    let cert_der = CertificateDer::from(cert.cert);
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

    let mut tls = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key.into())?;
    tls.alpn_protocols = vec![wire::ALPN.to_vec()];

    let mut config = ServerConfig::with_crypto(Arc::new(QuicServerConfig::try_from(tls)?));

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(
        IDLE_TIMEOUT.as_millis() as u32,
    ))));
    config.transport_config(Arc::new(transport));

    Ok(config)
}

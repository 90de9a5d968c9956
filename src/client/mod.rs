use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use quinn::{
    ClientConfig, Connection, Endpoint, IdleTimeout, RecvStream, SendStream, TransportConfig,
    VarInt,
};

use crate::wire::{self, Envelope};
use crate::{Error, Result};

/// Transport idle timeout, mirroring the server's.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered session with the broker.
///
/// Registration is silent on success; if the server refuses the ID the
/// refusal arrives as the first received envelope.
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
    connection: Connection,
    pub(crate) send: SendStream,
    pub(crate) recv: RecvStream,
    id: String,
}

/// Connect to the broker at `server` and register as `id`.
pub async fn connect(server: SocketAddr, id: &str) -> Result<Client> {
    if !wire::valid_client_id(id) {
        return Err(Error::InvalidClientId);
    }

    let endpoint = endpoint()?;
    let connection = endpoint
        .connect_with(config()?, server, wire::SERVER_NAME)?
        .await?;

    let (mut send, recv) = connection.open_bi().await?;
    wire::write(&mut send, &Envelope::Register { from: id.into() }).await?;

    Ok(Client {
        endpoint,
        connection,
        send,
        recv,
        id: id.into(),
    })
}

impl Client {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send `content` to the client registered as `to`.
    pub async fn send(&mut self, to: &str, content: &str) -> Result<()> {
        send(&mut self.send, &self.id, to, content).await
    }

    /// Wait for the next incoming message, returned as `(from, content)`.
    ///
    /// An `Error` envelope from the server surfaces as [`Error::Remote`].
    pub async fn receive(&mut self) -> Result<(String, String)> {
        receive(&mut self.recv).await
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (Sender, Receiver) {
        (
            Sender {
                send: self.send,
                id: self.id,
            },
            Receiver {
                recv: self.recv,
                connection: self.connection,
                endpoint: self.endpoint,
            },
        )
    }

    /// Close the connection and flush the goodbye packet.
    pub async fn close(self) {
        self.connection.close(VarInt::from_u32(0), b"client exit");
        self.endpoint.wait_idle().await;
    }
}

pub struct Sender {
    send: SendStream,
    id: String,
}

impl Sender {
    pub async fn send(&mut self, to: &str, content: &str) -> Result<()> {
        send(&mut self.send, &self.id, to, content).await
    }
}

/// The receive half also keeps the connection and endpoint alive; drop
/// it and the session dies.
pub struct Receiver {
    recv: RecvStream,
    connection: Connection,
    endpoint: Endpoint,
}

impl Receiver {
    pub async fn receive(&mut self) -> Result<(String, String)> {
        receive(&mut self.recv).await
    }

    /// Close the connection and flush the goodbye packet.
    pub async fn close(self) {
        self.connection.close(VarInt::from_u32(0), b"client exit");
        self.endpoint.wait_idle().await;
    }
}

async fn send(stream: &mut SendStream, from: &str, to: &str, content: &str) -> Result<()> {
    let envelope = Envelope::Message {
        from_id: from.into(),
        to_id: to.into(),
        content: content.into(),
    };

    wire::write(stream, &envelope).await
}

async fn receive(stream: &mut RecvStream) -> Result<(String, String)> {
    match wire::read(stream).await? {
        Envelope::Message {
            from_id, content, ..
        } => Ok((from_id, content)),
        Envelope::Error { error } => Err(Error::Remote(error)),
        Envelope::Register { .. } => Err(Error::UnexpectedEnvelope),
    }
}

pub(crate) fn endpoint() -> Result<Endpoint> {
    Endpoint::client(SocketAddr::from(([0, 0, 0, 0], 0))).map_err(Error::IO)
}

pub(crate) fn config() -> Result<ClientConfig> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut tls = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    tls.dangerous()
        .set_certificate_verifier(Arc::new(SkipServerVerification));
    tls.alpn_protocols = vec![wire::ALPN.to_vec()];

    let mut config = ClientConfig::new(Arc::new(QuicClientConfig::try_from(tls)?));

    let mut transport = TransportConfig::default();
    transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(
        IDLE_TIMEOUT.as_millis() as u32,
    ))));
    config.transport_config(Arc::new(transport));

    Ok(config)
}

/// Certificate verifier that accepts whatever the server presents.
///
/// Development posture only: the broker identifies itself with a
/// throwaway self-signed certificate, so there is nothing to verify
/// against. This must not ship to production as-is.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Err(rustls::Error::General("TLS 1.2 not supported".into()))
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

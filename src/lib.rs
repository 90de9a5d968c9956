pub mod client;
pub mod server;
pub mod wire;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("stream closed")]
    Closed,

    #[error("stream closed in the middle of a frame")]
    ShortRead,

    #[error("received a zero length frame")]
    EmptyFrame,

    #[error("frame of {0} bytes exceeds the {} byte limit", wire::MAX_FRAME_SIZE)]
    FrameTooLarge(usize),

    #[error("received a malformed envelope")]
    InvalidEnvelope,

    #[error("received an unexpected envelope")]
    UnexpectedEnvelope,

    #[error("{}", wire::ERR_INVALID_CLIENT_ID)]
    InvalidClientId,

    #[error("{}", wire::ERR_DUPLICATE_ID)]
    DuplicateClient,

    #[error("{}", wire::ERR_CAPACITY_REACHED)]
    RegistryFull,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("cipher suites incompatible with quic: {0}")]
    Cipher(#[from] quinn::crypto::rustls::NoInitialCipherSuite),

    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("connect error: {0}")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
}

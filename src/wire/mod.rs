use binary_layout::prelude::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// Application protocol identifier negotiated during the TLS handshake.
pub const ALPN: &[u8] = b"talkers";

/// Subject name carried by the server certificate.
pub const SERVER_NAME: &str = "sqirvy.xyz";

pub const LENGTH_PREFIX_SIZE: usize = 4;
pub const MESSAGE_HEADER_SIZE: usize = 2;

/// Hard cap on a serialized envelope. A bigger length prefix is treated
/// as corruption and never allocated for.
pub const MAX_FRAME_SIZE: usize = 524_288;

pub const MAX_CONTENT_CHARS: usize = 250_000;
pub const MAX_CLIENT_ID_CHARS: usize = 32;

// Fixed error catalogue. These exact strings travel inside Error
// envelopes and clients may assert on them.
pub const ERR_CONTENT_TOO_LARGE: &str = "content exceeds 250000 character limit";
pub const ERR_NOT_REGISTERED: &str = "destination client is not registered";
pub const ERR_DUPLICATE_ID: &str = "client ID is already registered";
pub const ERR_CAPACITY_REACHED: &str = "maximum number of clients (16) reached";
pub const ERR_DISCONNECTED: &str = "destination client is disconnected";
pub const ERR_UNEXPECTED_MESSAGE: &str = "unexpected message type after registration";
pub const ERR_FIRST_NOT_REGISTER: &str = "first message must be REGISTER";
pub const ERR_INVALID_CLIENT_ID: &str = "client ID must be 1-32 characters";

define_layout!(frame, BigEndian, {
    size: u32,
});

define_layout!(message_header, BigEndian, {
    from_len: u8,
    to_len: u8,
});

/// One wire message. Exactly one payload kind per envelope.
///
/// `Register` must be the first envelope of a session, `Message` carries
/// chat traffic both ways, `Error` only ever travels server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Register {
        from: String,
    },
    Error {
        error: String,
    },
    Message {
        from_id: String,
        to_id: String,
        content: String,
    },
}

#[repr(u8)]
enum Kind {
    // first and only valid envelope at session start
    Register = 1,
    // server reported a failure
    Error = 2,
    // routed chat content
    Message = 3,
}

impl TryFrom<u8> for Kind {
    type Error = &'static str;
    fn try_from(value: u8) -> std::result::Result<Self, <Self as TryFrom<u8>>::Error> {
        let result = match value {
            1 => Self::Register,
            2 => Self::Error,
            3 => Self::Message,
            _ => return Err("invalid envelope kind"),
        };

        Ok(result)
    }
}

/// True if `id` can name a client on this protocol. Length is counted
/// in characters, not bytes.
pub fn valid_client_id(id: &str) -> bool {
    let count = id.chars().count();
    count >= 1 && count <= MAX_CLIENT_ID_CHARS
}

/// Write one length-delimited envelope to `writer`.
///
/// The caller must make sure only one writer touches the stream at a
/// time so the prefix and payload stay contiguous on the wire.
pub async fn write<W>(writer: &mut W, envelope: &Envelope) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let data = encode(envelope)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(data.len()));
    }

    let mut prefix = [0; LENGTH_PREFIX_SIZE];
    let mut view = frame::View::new(&mut prefix[..]);
    view.size_mut().write(data.len() as u32);

    writer.write_all(&prefix).await?;
    writer.write_all(&data).await?;

    writer.flush().await.map_err(Error::IO)
}

/// Read the next envelope from `reader`.
///
/// Zero-length and oversize prefixes fail without consuming anything
/// past the prefix itself.
pub async fn read<R>(reader: &mut R) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0; LENGTH_PREFIX_SIZE];
    let mut filled = 0;
    while filled < LENGTH_PREFIX_SIZE {
        let count = reader.read(&mut prefix[filled..]).await?;
        if count == 0 {
            return Err(if filled == 0 {
                Error::Closed
            } else {
                Error::ShortRead
            });
        }
        filled += count;
    }

    let size = frame::View::new(&prefix[..]).size().read() as usize;
    if size == 0 {
        return Err(Error::EmptyFrame);
    }
    if size > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(size));
    }

    let mut data = vec![0; size];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::ShortRead,
            _ => Error::IO(err),
        })?;

    decode(&data)
}

fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let data = match envelope {
        Envelope::Register { from } => {
            let mut data = Vec::with_capacity(1 + from.len());
            data.push(Kind::Register as u8);
            data.extend_from_slice(from.as_bytes());
            data
        }
        Envelope::Error { error } => {
            let mut data = Vec::with_capacity(1 + error.len());
            data.push(Kind::Error as u8);
            data.extend_from_slice(error.as_bytes());
            data
        }
        Envelope::Message {
            from_id,
            to_id,
            content,
        } => {
            let from = from_id.as_bytes();
            let to = to_id.as_bytes();
            if from.len() > u8::MAX as usize || to.len() > u8::MAX as usize {
                return Err(Error::InvalidEnvelope);
            }

            let mut data = Vec::with_capacity(
                1 + MESSAGE_HEADER_SIZE + from.len() + to.len() + content.len(),
            );
            data.push(Kind::Message as u8);

            let mut header = [0; MESSAGE_HEADER_SIZE];
            let mut view = message_header::View::new(&mut header[..]);
            view.from_len_mut().write(from.len() as u8);
            view.to_len_mut().write(to.len() as u8);

            data.extend_from_slice(&header);
            data.extend_from_slice(from);
            data.extend_from_slice(to);
            data.extend_from_slice(content.as_bytes());
            data
        }
    };

    Ok(data)
}

fn decode(data: &[u8]) -> Result<Envelope> {
    let (kind, body) = match data.split_first() {
        Some((kind, body)) => (*kind, body),
        None => return Err(Error::InvalidEnvelope),
    };

    let kind = Kind::try_from(kind).map_err(|_| Error::InvalidEnvelope)?;
    let envelope = match kind {
        Kind::Register => Envelope::Register { from: text(body)? },
        Kind::Error => Envelope::Error { error: text(body)? },
        Kind::Message => {
            if body.len() < MESSAGE_HEADER_SIZE {
                return Err(Error::InvalidEnvelope);
            }

            let view = message_header::View::new(&body[..MESSAGE_HEADER_SIZE]);
            let from_len = view.from_len().read() as usize;
            let to_len = view.to_len().read() as usize;

            let rest = &body[MESSAGE_HEADER_SIZE..];
            if rest.len() < from_len + to_len {
                return Err(Error::InvalidEnvelope);
            }

            let (from, rest) = rest.split_at(from_len);
            let (to, content) = rest.split_at(to_len);

            Envelope::Message {
                from_id: text(from)?,
                to_id: text(to)?,
                content: text(content)?,
            }
        }
    };

    Ok(envelope)
}

fn text(data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec()).map_err(|_| Error::InvalidEnvelope)
}

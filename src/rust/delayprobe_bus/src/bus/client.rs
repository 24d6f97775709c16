use super::protocol::{from_cbor, read_frame, to_cbor, write_frame};
use crate::{BusReply, BusRequest, BusResponse, BusSession, BUS_SOCKET_PATH};
use std::path::Path;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use tracing::error;

/// Sent by a client as soon as it connects.
pub(crate) const MAGIC_NUMBER: [u8; 4] = *b"DPRB";
/// Returned by the server to accept the connection.
pub(crate) const MAGIC_RESPONSE: [u8; 4] = *b"BRPD";

/// Convenient wrapper for accessing the bus
///
/// ## Arguments
///
/// * `requests` a vector of `BusRequest` requests to make.
///
/// **Returns** Either an error, or a vector of `BusResponse` replies,
/// one per request.
pub async fn bus_request(requests: Vec<BusRequest>) -> Result<Vec<BusResponse>, BusClientError> {
    bus_request_at(Path::new(BUS_SOCKET_PATH), requests).await
}

/// As `bus_request`, against a socket at `socket_path`.
pub async fn bus_request_at(
    socket_path: &Path,
    requests: Vec<BusRequest>,
) -> Result<Vec<BusResponse>, BusClientError> {
    let mut stream = UnixStream::connect(socket_path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            error!(
                "{} not found. Check permissions and that delayprobed is running.",
                socket_path.display()
            );
            BusClientError::SocketNotFound
        } else {
            error!("Unable to connect to {}: {e:?}", socket_path.display());
            BusClientError::SocketNotFound
        }
    })?;

    stream
        .write_all(&MAGIC_NUMBER)
        .await
        .map_err(|_| BusClientError::StreamWriteError)?;
    let mut magic = [0u8; 4];
    stream
        .read_exact(&mut magic)
        .await
        .map_err(|_| BusClientError::StreamReadError)?;
    if magic != MAGIC_RESPONSE {
        error!("Server replied with the wrong magic number");
        return Err(BusClientError::BadMagic);
    }

    const REQUEST_ID: u64 = 1;
    let session = BusSession { requests };
    let payload = to_cbor(&session)?;
    write_frame(&mut stream, REQUEST_ID, &payload).await?;
    let (reply_id, reply_bytes) = read_frame(&mut stream).await?;
    if reply_id != REQUEST_ID {
        error!("Reply id {reply_id} does not match request id {REQUEST_ID}");
        return Err(BusClientError::DecodingError);
    }
    let reply: BusReply = from_cbor(&reply_bytes)?;
    Ok(reply.responses)
}

/// Errors raised by the bus client and the framing layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusClientError {
    /// The socket could not be opened
    #[error("Socket (typically /run/delayprobe/bus) not found. Check that delayprobed is running.")]
    SocketNotFound,
    /// The server did not complete the handshake
    #[error("The server did not return the expected magic number")]
    BadMagic,
    /// Serialization failed or the frame is too large
    #[error("Unable to encode request")]
    EncodingError,
    /// Deserialization failed or the frame is malformed
    #[error("Unable to decode response")]
    DecodingError,
    /// Writing to the socket failed
    #[error("Cannot write to socket")]
    StreamWriteError,
    /// Reading from the socket failed
    #[error("Cannot read from socket")]
    StreamReadError,
}

//! Wire framing shared by the bus client and server.
//!
//! A frame is a 16 byte header (request id and payload length, both u64
//! LE) followed by the CBOR payload split into chunks. Each chunk is at
//! most [`BUS_CHUNK_SIZE`] bytes and carries its own u32 LE length.

use super::BusClientError;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::error;

pub(crate) const BUS_CHUNK_SIZE: usize = 8 * 1024;
pub(crate) const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, BusClientError> {
    serde_cbor::to_vec(value).map_err(|e| {
        error!("CBOR encoding of {} failed: {e:?}", std::any::type_name::<T>());
        BusClientError::EncodingError
    })
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, BusClientError> {
    serde_cbor::from_slice(bytes).map_err(|e| {
        error!("CBOR decoding of {} failed: {e:?}", std::any::type_name::<T>());
        BusClientError::DecodingError
    })
}

fn write_failed(_: std::io::Error) -> BusClientError {
    BusClientError::StreamWriteError
}

fn read_failed(_: std::io::Error) -> BusClientError {
    BusClientError::StreamReadError
}

fn check_frame_size(len: usize, on_error: BusClientError) -> Result<(), BusClientError> {
    if len > MAX_FRAME_BYTES {
        error!("Bus frame of {len} bytes is over the {MAX_FRAME_BYTES} byte limit");
        return Err(on_error);
    }
    Ok(())
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: u64,
    payload: &[u8],
) -> Result<(), BusClientError> {
    check_frame_size(payload.len(), BusClientError::EncodingError)?;

    let mut header = [0u8; 16];
    header[..8].copy_from_slice(&request_id.to_le_bytes());
    header[8..].copy_from_slice(&(payload.len() as u64).to_le_bytes());
    writer.write_all(&header).await.map_err(write_failed)?;

    for chunk in payload.chunks(BUS_CHUNK_SIZE) {
        writer
            .write_u32_le(chunk.len() as u32)
            .await
            .map_err(write_failed)?;
        writer.write_all(chunk).await.map_err(write_failed)?;
    }
    writer.flush().await.map_err(write_failed)
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(u64, Vec<u8>), BusClientError> {
    let request_id = reader.read_u64_le().await.map_err(read_failed)?;
    let declared = reader.read_u64_le().await.map_err(read_failed)?;
    let total = usize::try_from(declared).map_err(|_| {
        error!("Bus frame length {declared} does not fit in memory");
        BusClientError::DecodingError
    })?;
    check_frame_size(total, BusClientError::DecodingError)?;

    // Chunks are read straight into their final position.
    let mut payload = vec![0u8; total];
    let mut filled = 0;
    while filled < total {
        let chunk_len = reader.read_u32_le().await.map_err(read_failed)? as usize;
        let left = total - filled;
        if chunk_len == 0 || chunk_len > BUS_CHUNK_SIZE || chunk_len > left {
            error!("Bad chunk length {chunk_len} with {left} bytes left in the frame");
            return Err(BusClientError::DecodingError);
        }
        reader
            .read_exact(&mut payload[filled..filled + chunk_len])
            .await
            .map_err(read_failed)?;
        filled += chunk_len;
    }

    Ok((request_id, payload))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ApiError, BusReply, BusRequest, BusResponse, BusSession, FlowDirection, FlowVariant};
    use tokio::io::duplex;

    #[test]
    fn sessions_and_replies_survive_cbor() {
        let session = BusSession {
            requests: vec![
                BusRequest::Ping,
                BusRequest::InterfaceAddDel {
                    sw_if_index: 3,
                    which: FlowVariant::Srh,
                    direction: FlowDirection::Both,
                    is_add: true,
                },
            ],
        };
        let decoded: BusSession = from_cbor(&to_cbor(&session).unwrap()).unwrap();
        assert_eq!(decoded, session);

        let reply = BusReply {
            responses: vec![BusResponse::Ack, BusResponse::Error(ApiError::NoSuchEntry)],
        };
        let decoded: BusReply = from_cbor(&to_cbor(&reply).unwrap()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn garbage_does_not_decode() {
        let result: Result<BusSession, _> = from_cbor(&[0xff, 0x00, 0x13]);
        assert_eq!(result, Err(BusClientError::DecodingError));
    }

    #[tokio::test]
    async fn frame_spanning_many_chunks() {
        let (mut client, mut server) = duplex(256 * 1024);
        let payload: Vec<u8> = (0..BUS_CHUNK_SIZE * 3 + 17).map(|i| i as u8).collect();

        let write = async { write_frame(&mut client, 11, &payload).await.unwrap() };
        let read = async { read_frame(&mut server).await.unwrap() };

        let (_, (request_id, received)) = tokio::join!(write, read);
        assert_eq!(request_id, 11);
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn empty_frame() {
        let (mut client, mut server) = duplex(1024);
        write_frame(&mut client, 2, &[]).await.unwrap();
        let (request_id, payload) = read_frame(&mut server).await.unwrap();
        assert_eq!(request_id, 2);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn rejects_oversized_length() {
        let (mut client, mut server) = duplex(1024);
        client.write_u64_le(5).await.unwrap();
        client.write_u64_le((MAX_FRAME_BYTES as u64) + 1).await.unwrap();
        assert_eq!(
            read_frame(&mut server).await,
            Err(BusClientError::DecodingError)
        );
    }

    #[tokio::test]
    async fn rejects_zero_length_chunk() {
        let (mut client, mut server) = duplex(1024);
        client.write_u64_le(1).await.unwrap();
        client.write_u64_le(10).await.unwrap();
        client.write_u32_le(0).await.unwrap();
        assert_eq!(
            read_frame(&mut server).await,
            Err(BusClientError::DecodingError)
        );
    }
}

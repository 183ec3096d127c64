//! Framed message transport.
//!
//! Every message on every connection is a fixed 8-byte header followed by
//! an opaque payload: `<u16 type, u16 reserved=0, u32 payload_len>`, all
//! header fields big-endian. Payloads are UTF-8 text; their shape depends
//! on the message type (see [`payload`]).
//!
//! Most RPCs are short-lived: open a socket, send one request, read one
//! reply, close. [`call`] packages that pattern.

pub mod payload;

pub use payload::ErrorKind;

use crate::error::{NetworkError, Result};
use crate::types::{NodeAddress, MAX_PAYLOAD_BYTES};
use bytes::{BufMut, BytesMut};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Wire message type codes. The numeric values are part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    ClientPut = 1,
    ClientGet = 2,
    PutOk = 3,
    GetOk = 4,
    Error = 5,
    ReplPut = 6,
    ReplAck = 7,
    Heartbeat = 8,
    HeartbeatAck = 9,
    TablePush = 10,
    StorageRegister = 11,
    ClientHello = 12,
    ReplConfirm = 13,
    GetAllKeys = 14,
    AllKeys = 15,
    ClientDelete = 16,
    DeleteOk = 17,
    PauseNode = 18,
    ResumeNode = 19,
    PauseAck = 20,
    ResumeAck = 21,
    AvailabilityCheck = 22,
    AvailableStatus = 23,
    ManagerGet = 24,
    ManagerDelete = 25,
}

impl TryFrom<u16> for MessageType {
    type Error = NetworkError;

    fn try_from(code: u16) -> std::result::Result<Self, NetworkError> {
        use MessageType::*;
        Ok(match code {
            1 => ClientPut,
            2 => ClientGet,
            3 => PutOk,
            4 => GetOk,
            5 => Error,
            6 => ReplPut,
            7 => ReplAck,
            8 => Heartbeat,
            9 => HeartbeatAck,
            10 => TablePush,
            11 => StorageRegister,
            12 => ClientHello,
            13 => ReplConfirm,
            14 => GetAllKeys,
            15 => AllKeys,
            16 => ClientDelete,
            17 => DeleteOk,
            18 => PauseNode,
            19 => ResumeNode,
            20 => PauseAck,
            21 => ResumeAck,
            22 => AvailabilityCheck,
            23 => AvailableStatus,
            24 => ManagerGet,
            25 => ManagerDelete,
            other => return Err(NetworkError::UnknownMessageType(other)),
        })
    }
}

/// Write one framed message to the stream.
pub async fn write_message<W>(stream: &mut W, msg_type: MessageType, payload: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = payload.as_bytes();
    if body.len() > MAX_PAYLOAD_BYTES {
        return Err(NetworkError::PayloadTooLarge(body.len()).into());
    }

    let mut frame = BytesMut::with_capacity(8 + body.len());
    frame.put_u16(msg_type as u16);
    frame.put_u16(0); // reserved
    frame.put_u32(body.len() as u32);
    frame.put_slice(body);

    stream.write_all(&frame).await.map_err(NetworkError::Io)?;
    stream.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

/// Read one framed message from the stream.
///
/// `read_exact` retries on interruption and fails with `UnexpectedEof`
/// if the peer closes before a complete frame arrives.
pub async fn read_message<R>(stream: &mut R) -> Result<(MessageType, String)>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .await
        .map_err(map_eof)?;

    let code = u16::from_be_bytes([header[0], header[1]]);
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    if len > MAX_PAYLOAD_BYTES {
        return Err(NetworkError::PayloadTooLarge(len).into());
    }
    let msg_type = MessageType::try_from(code)?;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.map_err(map_eof)?;
    let payload = String::from_utf8(body)
        .map_err(|_| NetworkError::MalformedPayload("payload is not UTF-8".into()))?;

    Ok((msg_type, payload))
}

fn map_eof(e: io::Error) -> NetworkError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        NetworkError::UnexpectedEof
    } else {
        NetworkError::Io(e)
    }
}

/// Connect to `addr` and return the stream.
pub async fn connect(addr: &NodeAddress, timeout: Duration) -> Result<TcpStream> {
    let target = addr.to_string();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&target))
        .await
        .map_err(|_| crate::error::Error::Timeout)?
        .map_err(|e| NetworkError::ConnectionFailed {
            addr: target,
            reason: e.to_string(),
        })?;
    Ok(stream)
}

/// One-shot RPC: connect, send a single request, read a single reply.
pub async fn call(
    addr: &NodeAddress,
    timeout: Duration,
    msg_type: MessageType,
    request: &str,
) -> Result<(MessageType, String)> {
    let mut stream = connect(addr, timeout).await?;
    tokio::time::timeout(timeout, async {
        write_message(&mut stream, msg_type, request).await?;
        read_message(&mut stream).await
    })
    .await
    .map_err(|_| crate::error::Error::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        write_message(&mut buf, MessageType::ClientPut, "key1|value1")
            .await
            .unwrap();

        // Header layout: type, reserved, length, then the payload bytes.
        assert_eq!(&buf[0..2], &1u16.to_be_bytes());
        assert_eq!(&buf[2..4], &0u16.to_be_bytes());
        assert_eq!(&buf[4..8], &11u32.to_be_bytes());

        let mut cursor = std::io::Cursor::new(buf);
        let (msg_type, payload) = read_message(&mut cursor).await.unwrap();
        assert_eq!(msg_type, MessageType::ClientPut);
        assert_eq!(payload, "key1|value1");
    }

    #[tokio::test]
    async fn empty_payload_round_trip() {
        let mut buf = Vec::new();
        write_message(&mut buf, MessageType::ClientHello, "")
            .await
            .unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let (msg_type, payload) = read_message(&mut cursor).await.unwrap();
        assert_eq!(msg_type, MessageType::ClientHello);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn truncated_frame_is_eof() {
        let mut buf = Vec::new();
        write_message(&mut buf, MessageType::ClientGet, "key1")
            .await
            .unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Network(NetworkError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn unknown_type_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(999);
        buf.put_u16(0);
        buf.put_u32(0);
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Network(NetworkError::UnknownMessageType(999))
        ));
    }

    #[tokio::test]
    async fn oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        buf.put_u16(0);
        buf.put_u32((MAX_PAYLOAD_BYTES + 1) as u32);
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let err = read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Network(NetworkError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn type_codes_are_stable() {
        assert_eq!(MessageType::ClientPut as u16, 1);
        assert_eq!(MessageType::ClientDelete as u16, 16);
        assert_eq!(MessageType::DeleteOk as u16, 17);
        assert_eq!(MessageType::ManagerDelete as u16, 25);
        assert_eq!(MessageType::try_from(22).unwrap(), MessageType::AvailabilityCheck);
    }
}

//! Length-prefixed binary framing shared by the server and agency clients.
//!
//! Every frame is `[1-byte opcode][4-byte big-endian length][UTF-8 payload]`.
//! There are no delimiters inside the payload; the length prefix is the only
//! message boundary. Reads and writes loop over the transport until the exact
//! byte count has moved, so short reads and short writes never split a frame.

use std::{fmt, io};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Opcode byte plus the big-endian `u32` payload length.
pub const HEADER_LEN: usize = 5;

/// Largest payload the 4-byte length prefix can describe.
pub const MAX_PAYLOAD_LEN: usize = u32::MAX as usize;

/// Operation codes understood by both ends of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Deprecated one-bet submission; closes the connection after the reply.
    LegacySingleBet = 1,
    Confirmation = 2,
    Error = 3,
    Batch = 4,
    Ready = 5,
    WinnersQuery = 6,
    WinnersResponse = 7,
    NotReady = 8,
}

impl OpCode {
    pub const ALL: [OpCode; 8] = [
        OpCode::LegacySingleBet,
        OpCode::Confirmation,
        OpCode::Error,
        OpCode::Batch,
        OpCode::Ready,
        OpCode::WinnersQuery,
        OpCode::WinnersResponse,
        OpCode::NotReady,
    ];

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = FrameError;

    fn try_from(byte: u8) -> Result<Self, FrameError> {
        OpCode::ALL
            .into_iter()
            .find(|op| op.as_byte() == byte)
            .ok_or(FrameError::UnknownOpCode(byte))
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::LegacySingleBet => "LEGACY_SINGLE_BET",
            OpCode::Confirmation => "CONFIRMATION",
            OpCode::Error => "ERROR",
            OpCode::Batch => "BATCH",
            OpCode::Ready => "READY",
            OpCode::WinnersQuery => "WINNERS_QUERY",
            OpCode::WinnersResponse => "WINNERS_RESPONSE",
            OpCode::NotReady => "NOT_READY",
        };
        f.write_str(name)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub op: OpCode,
    pub payload: String,
}

impl Message {
    pub fn new(op: OpCode, payload: impl Into<String>) -> Self {
        Self {
            op,
            payload: payload.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(OpCode::Error, text)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self.op, &self.payload)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {len} bytes exceeds the {MAX_PAYLOAD_LEN} byte limit")]
    PayloadTooLarge { len: usize },
    #[error("unknown operation code {0}")]
    UnknownOpCode(u8),
    #[error("connection closed after {read} of {expected} bytes")]
    ConnectionClosed { read: usize, expected: usize },
    #[error("peer stopped accepting data after {written} of {expected} bytes")]
    PeerClosed { written: usize, expected: usize },
    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Serializes a frame into a single buffer so it can go out in one write loop.
pub fn encode(op: OpCode, text: &str) -> Result<Vec<u8>, FrameError> {
    let len = check_payload_len(text.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + text.len());
    frame.push(op.as_byte());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(text.as_bytes());
    Ok(frame)
}

fn check_payload_len(len: usize) -> Result<u32, FrameError> {
    u32::try_from(len).map_err(|_| FrameError::PayloadTooLarge { len })
}

fn decode_header(header: [u8; HEADER_LEN]) -> Result<(OpCode, u32), FrameError> {
    let op = OpCode::try_from(header[0])?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    Ok((op, len))
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closes the stream cleanly before sending
/// any byte of a new frame. A close anywhere inside a frame is reported as
/// [`FrameError::ConnectionClosed`].
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let read = fill_buf(reader, &mut header).await?;
    if read == 0 {
        return Ok(None);
    }
    if read < HEADER_LEN {
        return Err(FrameError::ConnectionClosed {
            read,
            expected: HEADER_LEN,
        });
    }

    let (op, len) = decode_header(header)?;
    let expected = len as usize;

    // Grow the buffer as bytes arrive instead of trusting the prefix up front.
    let mut payload = Vec::with_capacity(expected.min(64 * 1024));
    let read = (&mut *reader)
        .take(u64::from(len))
        .read_to_end(&mut payload)
        .await?;
    if read < expected {
        return Err(FrameError::ConnectionClosed { read, expected });
    }

    let payload = String::from_utf8(payload)?;
    Ok(Some(Message { op, payload }))
}

/// Writes one frame, looping until the transport has accepted every byte.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = message.encode()?;
    let mut written = 0;
    while written < frame.len() {
        let n = writer.write(&frame[written..]).await?;
        if n == 0 {
            return Err(FrameError::PeerClosed {
                written,
                expected: frame.len(),
            });
        }
        written += n;
    }
    writer.flush().await?;
    Ok(())
}

async fn fill_buf<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use super::*;

    #[tokio::test]
    async fn roundtrip_every_opcode() {
        for op in OpCode::ALL {
            let message = Message::new(op, "1,Santiago,Lorca,30904465,1999-03-17,7574;ñandú");
            let frame = message.encode().expect("encode");
            let mut reader = frame.as_slice();
            let parsed = read_message(&mut reader)
                .await
                .expect("read message")
                .expect("expected message");
            assert_eq!(parsed, message);
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let frame = encode(OpCode::Batch, "abc").expect("encode");
        assert_eq!(frame, vec![4, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn length_counts_utf8_bytes() {
        let frame = encode(OpCode::Confirmation, "ñ").expect("encode");
        assert_eq!(&frame[1..HEADER_LEN], &[0, 0, 0, 2]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn rejects_payload_beyond_length_prefix() {
        assert!(check_payload_len(MAX_PAYLOAD_LEN).is_ok());
        let err = check_payload_len(MAX_PAYLOAD_LEN + 1).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn reassembles_single_byte_deliveries() {
        let (mut writer, mut reader) = tokio::io::duplex(1);
        let message = Message::new(OpCode::WinnersResponse, "30904465,28123456,40111222");
        let sent = message.clone();
        let writer_task = tokio::spawn(async move { write_message(&mut writer, &sent).await });

        let parsed = read_message(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");
        writer_task
            .await
            .expect("writer task")
            .expect("write message");
        assert_eq!(parsed, message);
    }

    #[tokio::test]
    async fn empty_payload_roundtrips() {
        let frame = encode(OpCode::WinnersResponse, "").expect("encode");
        let mut reader = frame.as_slice();
        let parsed = read_message(&mut reader).await.expect("read").expect("message");
        assert_eq!(parsed, Message::new(OpCode::WinnersResponse, ""));
    }

    #[tokio::test]
    async fn clean_close_before_header_yields_none() {
        let mut reader: &[u8] = &[];
        assert!(read_message(&mut reader).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn close_inside_header_is_framing_error() {
        let mut reader: &[u8] = &[4, 0, 0];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::ConnectionClosed {
                read: 3,
                expected: HEADER_LEN
            }
        ));
    }

    #[tokio::test]
    async fn close_inside_payload_is_framing_error() {
        let mut reader: &[u8] = &[4, 0, 0, 0, 10, b'a', b'b'];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::ConnectionClosed {
                read: 2,
                expected: 10
            }
        ));
    }

    #[tokio::test]
    async fn unknown_opcode_is_rejected() {
        let mut reader: &[u8] = &[42, 0, 0, 0, 0];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownOpCode(42)));
    }

    #[tokio::test]
    async fn invalid_utf8_is_rejected() {
        let mut reader: &[u8] = &[2, 0, 0, 0, 2, 0xc3, 0x28];
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidUtf8(_)));
    }

    #[tokio::test]
    async fn consecutive_frames_share_a_stream() {
        let mut buf = Vec::new();
        for op in [OpCode::Batch, OpCode::Batch, OpCode::Ready] {
            write_message(&mut buf, &Message::new(op, op.to_string()))
                .await
                .expect("write");
        }

        let mut reader = buf.as_slice();
        for op in [OpCode::Batch, OpCode::Batch, OpCode::Ready] {
            let parsed = read_message(&mut reader).await.expect("read").expect("message");
            assert_eq!(parsed.op, op);
        }
        assert!(read_message(&mut reader).await.expect("read").is_none());
    }

    struct ClosedWriter;

    impl AsyncWrite for ClosedWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(0))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn zero_length_write_is_peer_closed() {
        let err = write_message(&mut ClosedWriter, &Message::error("boom"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FrameError::PeerClosed {
                written: 0,
                expected: 9
            }
        ));
    }
}

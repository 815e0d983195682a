//! Request body framing at the front end.
//!
//! The parser only reads the request head and reports how the body is
//! framed. [`BodyDecoder`] then pulls the body off the client socket in
//! bounded chunks, so a large upload never sits in memory as a whole.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest chunk handed on per read.
pub const BODY_READ_SIZE: usize = 8192;

/// Longest chunk-size or trailer line accepted.
const MAX_LINE_SIZE: usize = 4096;

/// How a request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

impl BodyFraming {
    /// Body length when known up front.
    pub fn length(&self) -> Option<u64> {
        match self {
            BodyFraming::None => Some(0),
            BodyFraming::Length(length) => Some(*length),
            BodyFraming::Chunked => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Length(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Trailers,
    Done,
}

/// Reads one request body off the client connection.
///
/// Bytes already buffered behind the head are used first. Nothing past the
/// end of the body is consumed, so a pipelined request stays in the buffer.
#[derive(Debug)]
pub struct BodyDecoder {
    framing: BodyFraming,
    state: DecodeState,
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        let state = match framing {
            BodyFraming::None | BodyFraming::Length(0) => DecodeState::Done,
            BodyFraming::Length(length) => DecodeState::Length(length),
            BodyFraming::Chunked => DecodeState::ChunkSize,
        };
        Self { framing, state }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Whether the whole body has been read.
    pub fn is_done(&self) -> bool {
        self.state == DecodeState::Done
    }

    /// Next piece of decoded body, `None` once the body is complete.
    ///
    /// Cancel-safe: dropping the future loses no bytes.
    pub async fn next_chunk<R>(
        &mut self,
        reader: &mut R,
        buffer: &mut Vec<u8>,
    ) -> io::Result<Option<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            match self.state {
                DecodeState::Done => return Ok(None),
                DecodeState::Length(remaining) => {
                    let chunk = take(reader, buffer, remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        DecodeState::Done
                    } else {
                        DecodeState::Length(left)
                    };
                    return Ok(Some(chunk));
                }
                DecodeState::ChunkSize => {
                    let line = read_line(reader, buffer).await?;
                    let size = line.split(';').next().unwrap_or_default().trim();
                    let size = u64::from_str_radix(size, 16).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
                    })?;
                    self.state = if size == 0 {
                        DecodeState::Trailers
                    } else {
                        DecodeState::ChunkData(size)
                    };
                }
                DecodeState::ChunkData(remaining) => {
                    let chunk = take(reader, buffer, remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.state = if left == 0 {
                        DecodeState::ChunkEnd
                    } else {
                        DecodeState::ChunkData(left)
                    };
                    return Ok(Some(chunk));
                }
                DecodeState::ChunkEnd => {
                    if !read_line(reader, buffer).await?.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "missing CRLF after chunk data",
                        ));
                    }
                    self.state = DecodeState::ChunkSize;
                }
                DecodeState::Trailers => {
                    // Trailers are not forwarded
                    if read_line(reader, buffer).await?.is_empty() {
                        self.state = DecodeState::Done;
                    }
                }
            }
        }
    }
}

async fn fill<R>(reader: &mut R, buffer: &mut Vec<u8>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut temp = [0u8; BODY_READ_SIZE];
    let n = reader.read(&mut temp).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "client closed the connection mid-body",
        ));
    }
    buffer.extend_from_slice(&temp[..n]);
    Ok(())
}

/// Takes up to `limit` body bytes, reading if none are buffered.
async fn take<R>(reader: &mut R, buffer: &mut Vec<u8>, limit: u64) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    if buffer.is_empty() {
        fill(reader, buffer).await?;
    }
    let n = buffer
        .len()
        .min(BODY_READ_SIZE)
        .min(usize::try_from(limit).unwrap_or(usize::MAX));
    Ok(Bytes::from(buffer.drain(..n).collect::<Vec<u8>>()))
}

/// Reads one CRLF-terminated line, without the terminator.
async fn read_line<R>(reader: &mut R, buffer: &mut Vec<u8>) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buffer.windows(2).position(|w| w == b"\r\n") {
            if pos > MAX_LINE_SIZE {
                break;
            }
            let line: Vec<u8> = buffer.drain(..pos + 2).take(pos).collect();
            return String::from_utf8(line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
        }
        if buffer.len() > MAX_LINE_SIZE {
            break;
        }
        fill(reader, buffer).await?;
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        "chunk header line too long",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode_all(framing: BodyFraming, wire: &[u8]) -> io::Result<(Vec<u8>, Vec<u8>)> {
        let mut decoder = BodyDecoder::new(framing);
        let mut reader = wire;
        let mut buffer = Vec::new();
        let mut body = Vec::new();
        while let Some(chunk) = decoder.next_chunk(&mut reader, &mut buffer).await? {
            assert!(chunk.len() <= BODY_READ_SIZE);
            body.extend_from_slice(&chunk);
        }
        assert!(decoder.is_done());
        buffer.extend_from_slice(reader);
        Ok((body, buffer))
    }

    #[tokio::test]
    async fn chunked_body_leaves_pipelined_bytes() {
        let wire = b"5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Sum: 1\r\n\r\nGET / HTTP/1.1\r\n\r\n";

        let (body, rest) = decode_all(BodyFraming::Chunked, wire).await.unwrap();

        assert_eq!(body, b"hello world".to_vec());
        assert_eq!(rest, b"GET / HTTP/1.1\r\n\r\n".to_vec());
    }

    #[tokio::test]
    async fn length_body_is_read_in_bounded_pieces() {
        let wire = vec![b'x'; 3 * BODY_READ_SIZE + 7];

        let (body, rest) = decode_all(BodyFraming::Length(wire.len() as u64), &wire)
            .await
            .unwrap();

        assert_eq!(body.len(), wire.len());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let err = decode_all(BodyFraming::Length(10), b"short").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let err = decode_all(BodyFraming::Chunked, b"zz\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameReader`] yields raw frame bodies; decoding the JSON is left to the
//! caller so that a malformed body can be dropped without killing the
//! connection. Framing errors, on the other hand, mean the stream is no
//! longer in sync and the connection must be treated as dead.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (16 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const CONTENT_LENGTH: &str = "Content-Length";

/// A failure to read or write one framed message.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("Content-Length {0} exceeds maximum {MAX_FRAME_BYTES}")]
    TooLarge(usize),
    #[error("unexpected EOF while reading headers")]
    EofInHeaders,
    #[error("unexpected EOF in frame body: expected {expected} bytes")]
    EofInBody { expected: usize },
    #[error("serializing frame: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("frame I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame `body` with its `Content-Length` header.
#[must_use]
pub fn encode_frame(body: &[u8]) -> Vec<u8> {
    let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());
    let mut frame = Vec::with_capacity(header.len() + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Serialize `message` to JSON and frame it.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message)?;
    Ok(encode_frame(&body))
}

/// Reads JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame body.
    ///
    /// Returns `Ok(None)` on EOF before any header byte (clean shutdown).
    /// Bytes past the declared length stay buffered for the next call.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(content_length) = self.read_headers().await? else {
            return Ok(None);
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge(content_length));
        }

        let mut body = vec![0u8; content_length];
        self.reader
            .read_exact(&mut body)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FrameError::EofInBody {
                    expected: content_length,
                },
                _ => FrameError::Io(e),
            })?;

        Ok(Some(body))
    }

    /// Parse headers until the empty line separator.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF.
    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                // EOF is only clean before the first header line.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(FrameError::EofInHeaders);
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case(CONTENT_LENGTH)
            {
                let value = value.trim();
                let len = value
                    .parse()
                    .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
                content_length = Some(len);
            }
            // Other headers (e.g. Content-Type) are ignored.
        }

        content_length.map(Some).ok_or(FrameError::MissingContentLength)
    }
}

/// Writes JSON-RPC frames to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one complete frame for `message`.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), FrameError> {
        let frame = encode_message(message)?;
        self.write_frame(&frame).await
    }

    /// Write an already encoded frame in a single `write_all`, then flush.
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<(), FrameError> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

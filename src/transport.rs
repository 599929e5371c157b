//! LSP wire transport
//!
//! Frames and deframes JSON-RPC messages with `Content-Length` headers.
//! Generic over any async byte stream, so the same codec serves a child
//! process's stdio and a socket.
//!
//! Decoding failures are fatal to the transport: a malformed header or a
//! stream that closes before the declared body length is surfaced as an
//! `io::Error` and the connection is considered dead. Nothing is retried at
//! this layer.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::proto::Message;

/// Reading half: decodes one framed message at a time until the stream
/// closes.
pub struct Transport<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> Transport<R> {
    pub fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
        }
    }

    /// Read the next message from the stream.
    ///
    /// LSP messages are framed with headers:
    /// ```text
    /// Content-Length: 123\r\n
    /// \r\n
    /// {"jsonrpc":"2.0",...}
    /// ```
    pub async fn read_message(&mut self) -> io::Result<Message> {
        let content_length = self.read_headers().await?;

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        let json =
            String::from_utf8(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tracing::trace!("LSP <- {}", json);

        Message::parse(&json).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Read the header block and return the Content-Length value.
    async fn read_headers(&mut self) -> io::Result<usize> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed connection",
                ));
            }

            let line = line.trim();

            // Empty line marks end of headers
            if line.is_empty() {
                break;
            }

            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(
                    value
                        .trim()
                        .parse()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                );
            }
            // Ignore other headers (Content-Type, etc.)
        }

        content_length
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing Content-Length"))
    }
}

/// Writing half: serializes a payload and writes it as one fully framed
/// message. Callers serialize access; a frame is never split across writes.
pub struct MessageWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(stream: W) -> Self {
        Self { writer: stream }
    }

    pub async fn write<T: Serialize>(&mut self, payload: &T) -> io::Result<()> {
        let json = serde_json::to_string(payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        tracing::trace!("LSP -> {}", json);

        // Content-Length counts bytes, not chars
        let framed = format!("Content-Length: {}\r\n\r\n{}", json.len(), json);
        self.writer.write_all(framed.as_bytes()).await?;
        self.writer.flush().await
    }

    /// Close the underlying stream. For a child's stdin this signals EOF.
    pub async fn close(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

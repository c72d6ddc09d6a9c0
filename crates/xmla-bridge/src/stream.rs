//! Incremental JSON result streaming
//!
//! Rows are written to the sink as they come off the cursor, inside the
//! fixed response envelope:
//!
//! ```text
//! {"results":[{"tables":[{"rows":[ ... ],"error":null}],"error":null}],"error":null}
//! ```
//!
//! Cancellation is checked before every row. A cancelled or failed write
//! leaves whatever was already flushed in the sink; the document is only
//! complete when [`ResultStreamer::write`] returns `Ok`.

use serde::{Deserialize, Serialize};
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::RowCursor;
use crate::error::{Error, Result};

const ENVELOPE_OPEN: &str = r#"{"results":[{"tables":[{"rows":["#;
const ENVELOPE_CLOSE: &str = r#"],"error":null}],"error":null}],"error":null}"#;

/// Character encoding of the emitted document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    /// UTF-8
    #[default]
    Utf8,
    /// UTF-16, little endian, no byte order mark
    Utf16Le,
    /// UTF-16, big endian, no byte order mark
    Utf16Be,
}

impl TextEncoding {
    fn encode_into(self, text: &str, out: &mut Vec<u8>) {
        match self {
            Self::Utf8 => out.extend_from_slice(text.as_bytes()),
            Self::Utf16Le => text
                .encode_utf16()
                .for_each(|unit| out.extend_from_slice(&unit.to_le_bytes())),
            Self::Utf16Be => text
                .encode_utf16()
                .for_each(|unit| out.extend_from_slice(&unit.to_be_bytes())),
        }
    }
}

/// Streaming options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Output encoding
    #[serde(default)]
    pub encoding: TextEncoding,

    /// Write buffer in front of the sink, in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_buffer_size() -> usize {
    4096
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            encoding: TextEncoding::default(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl StreamOptions {
    /// Set output encoding
    pub fn with_encoding(mut self, encoding: TextEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Set buffer size
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// Result of a completed stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Rows written
    pub rows: u64,
    /// Bytes handed to the sink
    pub bytes: u64,
}

/// Buffered, encoding-aware writer over the caller's sink
struct EncodedWriter<'a, W: AsyncWrite + Unpin + ?Sized> {
    inner: BufWriter<&'a mut W>,
    encoding: TextEncoding,
    scratch: Vec<u8>,
    bytes: u64,
}

impl<'a, W: AsyncWrite + Unpin + ?Sized> EncodedWriter<'a, W> {
    fn new(sink: &'a mut W, options: &StreamOptions) -> Self {
        Self {
            inner: BufWriter::with_capacity(options.buffer_size.max(1), sink),
            encoding: options.encoding,
            scratch: Vec::new(),
            bytes: 0,
        }
    }

    async fn write_str(&mut self, text: &str) -> Result<()> {
        if self.encoding == TextEncoding::Utf8 {
            self.inner.write_all(text.as_bytes()).await?;
            self.bytes += text.len() as u64;
        } else {
            self.scratch.clear();
            self.encoding.encode_into(text, &mut self.scratch);
            self.inner.write_all(&self.scratch).await?;
            self.bytes += self.scratch.len() as u64;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

/// Writes cursors to byte sinks as the JSON response envelope
#[derive(Debug, Clone, Default)]
pub struct ResultStreamer {
    options: StreamOptions,
}

impl ResultStreamer {
    /// Create a streamer
    pub fn new(options: StreamOptions) -> Self {
        Self { options }
    }

    /// Streaming options
    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Stream every row of `cursor` into `sink`.
    ///
    /// The cursor is closed on every exit path. The sink is flushed only
    /// when the whole document was written.
    pub async fn write<C, W>(
        &self,
        cursor: &mut C,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary>
    where
        C: RowCursor + ?Sized,
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let start = Instant::now();
        let mut out = EncodedWriter::new(sink, &self.options);

        let written = Self::write_document(cursor, &mut out, cancel).await;
        let closed = cursor.close().await;

        let rows = match (written, closed) {
            (Ok(rows), Ok(())) => rows,
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    debug!(error = %close_err, "Error closing cursor after failed stream");
                }
                if matches!(e, Error::Cancelled) {
                    warn!(bytes = out.bytes, "Result stream cancelled");
                } else {
                    warn!(bytes = out.bytes, error = %e, "Result stream aborted");
                }
                return Err(e);
            }
            (Ok(_), Err(e)) => return Err(e),
        };

        out.flush().await?;
        metrics::counter!("xmla_stream_rows_total").increment(rows);

        debug!(
            rows,
            bytes = out.bytes,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Streamed result set"
        );

        Ok(StreamSummary {
            rows,
            bytes: out.bytes,
        })
    }

    async fn write_document<C, W>(
        cursor: &mut C,
        out: &mut EncodedWriter<'_, W>,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        C: RowCursor + ?Sized,
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        out.write_str(ENVELOPE_OPEN).await?;

        let mut rows = 0u64;
        let mut fragment = String::new();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = cursor.next() => next?,
            };
            let Some(row) = next else {
                break;
            };

            fragment.clear();
            if rows > 0 {
                fragment.push(',');
            }
            fragment.push_str(&serde_json::to_string(&row)?);
            out.write_str(&fragment).await?;
            rows += 1;
        }

        out.write_str(ENVELOPE_CLOSE).await?;
        Ok(rows)
    }

    /// Render the whole document as a string.
    ///
    /// Produces the same bytes as [`write`](Self::write) with UTF-8 output.
    pub async fn to_string<C>(&self, cursor: &mut C) -> Result<String>
    where
        C: RowCursor + ?Sized,
    {
        let streamer = Self::new(StreamOptions {
            encoding: TextEncoding::Utf8,
            ..self.options.clone()
        });
        let mut buf: Vec<u8> = Vec::new();
        streamer
            .write(cursor, &mut buf, &CancellationToken::new())
            .await?;
        String::from_utf8(buf).map_err(|e| Error::internal(format!("invalid UTF-8 output: {}", e)))
    }
}

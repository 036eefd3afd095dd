//! Line-framed transport for MCP sessions.
//!
//! This module implements the stdio framing as specified by MCP, over any
//! async byte stream:
//!
//! - Messages are UTF-8 encoded JSON-RPC
//! - Messages are delimited by newlines
//! - Messages must not contain embedded newlines
//! - stdin/stdout carry protocol messages, stderr is left for logging
//!
//! # Thread Safety
//!
//! A [`Transport`] is split into a [`FrameReader`] owned by the session's
//! reader loop and a [`FrameWriter`] the session keeps behind a lock, so
//! reading and writing proceed independently.

use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Reads newline-delimited frames.
pub struct FrameReader {
    reader: BufReader<BoxedReader>,
}

impl FrameReader {
    /// Reads the next frame, without its line terminator.
    ///
    /// Returns `None` if the stream is closed (EOF). A final frame without a
    /// trailing newline is still returned.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from the stream fails.
    pub async fn read_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut frame = Vec::new();
        let bytes_read = self.reader.read_until(b'\n', &mut frame).await?;

        if bytes_read == 0 {
            // EOF - peer closed its end
            return Ok(None);
        }

        if frame.last() == Some(&b'\n') {
            frame.pop();
            if frame.last() == Some(&b'\r') {
                frame.pop();
            }
        }

        Ok(Some(frame))
    }
}

/// Writes newline-delimited frames.
pub struct FrameWriter {
    writer: BoxedWriter,
}

impl FrameWriter {
    /// Writes one frame followed by a newline and flushes.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub async fn write_frame(&mut self, frame: &str) -> io::Result<()> {
        // MCP spec: messages must not contain embedded newlines
        debug_assert!(
            !frame.contains('\n'),
            "JSON message must not contain embedded newlines"
        );

        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Flushes and closes the write half.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying stream fails to shut down.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

/// A bidirectional, order-preserving, line-framed byte channel.
pub struct Transport {
    reader: FrameReader,
    writer: FrameWriter,
}

impl Transport {
    /// Creates a transport over an arbitrary read half and write half.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: FrameReader {
                reader: BufReader::new(Box::new(reader)),
            },
            writer: FrameWriter {
                writer: Box::new(writer),
            },
        }
    }

    /// Creates a transport over this process's stdin and stdout.
    #[must_use]
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Creates a transport over a child process's stdout (read) and stdin (write).
    #[must_use]
    pub fn child(stdout: tokio::process::ChildStdout, stdin: tokio::process::ChildStdin) -> Self {
        Self::new(stdout, stdin)
    }

    /// Creates two transports connected to each other in memory.
    ///
    /// Whatever one side writes, the other side reads. Dropping or stopping
    /// one side makes the other side observe end-of-stream.
    #[must_use]
    pub fn pair(max_buf_size: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(max_buf_size);
        (Self::from_duplex(a), Self::from_duplex(b))
    }

    fn from_duplex(stream: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self::new(read, write)
    }

    /// Splits the transport into its read and write halves.
    #[must_use]
    pub fn into_parts(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }
}

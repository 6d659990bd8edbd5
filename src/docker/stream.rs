//! Streaming response decoders
//!
//! The daemon streams three shapes: newline-delimited JSON (events, stats,
//! pull progress) and the multiplexed log framing (8-byte header carrying
//! the stream id and payload length). Decoders are incremental state
//! machines over byte chunks so the network driver can feed them whatever
//! the socket yields; the async side lives in the client.

use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;

use super::types::{ProcessEvent, StdStream};

/// Why a stream finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The daemon closed the response.
    Closed,
    /// The caller's cancel token fired; the response was closed cleanly.
    Cancelled,
    /// The transport or decoder failed mid-stream.
    Error(String),
}

impl StreamEnd {
    pub fn message(&self) -> String {
        match self {
            StreamEnd::Closed => "stream closed".to_string(),
            StreamEnd::Cancelled => "interrupted".to_string(),
            StreamEnd::Error(e) => e.clone(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StreamEnd::Cancelled)
    }
}

/// Multiplexed log framing: `[stream_id, 0, 0, 0, len_be_u32]` then `len`
/// payload bytes. Stream id 1 is stdout, 2 is stderr; stdin echo frames
/// (id 0) and unknown ids are dropped.
#[derive(Debug, Default)]
pub struct LogFrameDecoder {
    buf: BytesMut,
}

impl LogFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, or `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<ProcessEvent> {
        loop {
            if self.buf.len() < 8 {
                return None;
            }
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
                as usize;
            if self.buf.len() < 8 + len {
                return None;
            }
            let stream_id = self.buf[0];
            self.buf.advance(8);
            let data = self.buf.split_to(len).freeze();

            let stream = match stream_id {
                1 => StdStream::Stdout,
                2 => StdStream::Stderr,
                _ => continue,
            };
            return Some(ProcessEvent { stream, data });
        }
    }
}

/// Newline-delimited JSON decoder. Blank lines (daemon keepalives) are
/// skipped; a non-blank line that fails to parse is surfaced as an error.
#[derive(Debug)]
pub struct JsonLineDecoder<T> {
    buf: BytesMut,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> JsonLineDecoder<T> {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete item, or `None` when more bytes are needed.
    pub fn next_item(&mut self) -> Option<Result<T, serde_json::Error>> {
        loop {
            let newline = self.buf.iter().position(|&b| b == b'\n')?;
            let line = self.buf.split_to(newline + 1);
            let text = &line[..newline];
            if text.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            return Some(serde_json::from_slice(text));
        }
    }
}

impl<T: DeserializeOwned> Default for JsonLineDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

//! Demultiplexer for the container engine's combined log stream.
//!
//! Without a TTY the engine interleaves stdout and stderr on one byte stream,
//! each write prefixed by an 8-byte header:
//!
//! ```text
//! [kind: u8][0u8; 3][length: u32 big-endian][payload; length]
//! ```
//!
//! Network reads do not line up with frames. A frame may span several chunks
//! and a chunk may carry several frames, so bytes are accumulated until a
//! whole frame is available. Frames do not line up with characters either:
//! an incomplete UTF-8 sequence at the end of a frame is held back and
//! prepended to the next frame on the same channel.

use bytes::{Buf, BytesMut};

/// Size of the per-frame header.
pub const HEADER_LEN: usize = 8;

const KIND_STDOUT: u8 = 1;
const KIND_STDERR: u8 = 2;

/// Origin of an output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    fn from_kind(kind: u8) -> Option<Self> {
        match kind {
            KIND_STDOUT => Some(Channel::Stdout),
            KIND_STDERR => Some(Channel::Stderr),
            _ => None,
        }
    }

    /// Header byte for this channel.
    pub fn kind(&self) -> u8 {
        match self {
            Channel::Stdout => KIND_STDOUT,
            Channel::Stderr => KIND_STDERR,
        }
    }
}

/// One decoded write from the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub channel: Channel,
    pub text: String,
}

impl OutputFrame {
    pub fn new(channel: Channel, text: impl Into<String>) -> Self {
        Self {
            channel,
            text: text.into(),
        }
    }
}

/// Stateful frame parser. Unparsed bytes carry over between calls to
/// [`Demultiplexer::push`].
#[derive(Debug, Default)]
pub struct Demultiplexer {
    buffer: BytesMut,
    stdout_tail: Vec<u8>,
    stderr_tail: Vec<u8>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every frame that is now complete.
    ///
    /// Zero-length frames and frames of unknown kind are consumed without
    /// producing output.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<OutputFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            if let Some(frame) = frame {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Flush characters left incomplete when the stream ended, as U+FFFD.
    pub fn finish(&mut self) -> Vec<OutputFrame> {
        [Channel::Stdout, Channel::Stderr]
            .into_iter()
            .filter_map(|channel| {
                let tail = std::mem::take(self.tail_mut(channel));
                if tail.is_empty() {
                    None
                } else {
                    Some(OutputFrame::new(channel, String::from_utf8_lossy(&tail)))
                }
            })
            .collect()
    }

    fn tail_mut(&mut self, channel: Channel) -> &mut Vec<u8> {
        match channel {
            Channel::Stdout => &mut self.stdout_tail,
            Channel::Stderr => &mut self.stderr_tail,
        }
    }

    /// Decode `payload` after the channel's held-back bytes. Invalid
    /// sequences become U+FFFD; a truncated one at the end is kept for later.
    fn decode(&mut self, channel: Channel, payload: &[u8]) -> String {
        let mut bytes = std::mem::take(self.tail_mut(channel));
        bytes.extend_from_slice(payload);

        let mut text = String::with_capacity(bytes.len());
        let mut rest: &[u8] = &bytes;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            let tail = after.to_vec();
                            *self.tail_mut(channel) = tail;
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    /// `None` when more data is needed; `Some(None)` when a frame was consumed
    /// but yields nothing.
    fn next_frame(&mut self) -> Option<Option<OutputFrame>> {
        if self.buffer.len() < HEADER_LEN {
            return None;
        }

        let kind = self.buffer[0];
        let length = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;

        if self.buffer.len() < HEADER_LEN + length {
            return None;
        }

        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(length);

        if length == 0 {
            return Some(None);
        }

        let Some(channel) = Channel::from_kind(kind) else {
            return Some(None);
        };
        let text = self.decode(channel, &payload);
        if text.is_empty() {
            return Some(None);
        }
        Some(Some(OutputFrame { channel, text }))
    }
}

/// Encode a frame in the engine's wire format.
pub fn encode_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

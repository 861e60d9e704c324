//! H.264 elementary-stream framer
//!
//! The encoder writes a headerless Annex B bytestream to its stdout: no
//! container, no timestamps, just NAL units introduced by a 4-byte start
//! code. The encoder configuration emits one access-unit delimiter (AUD,
//! NAL type 9) per encoded frame, so an AUD start code marks a frame
//! boundary. The framer accumulates bytes and splits on those
//! boundaries, yielding one opaque byte sequence per access unit.

use bytes::{Bytes, BytesMut};
use tracing::warn;

/// Annex B start code preceding every NAL unit
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
/// NAL unit type marking an access-unit delimiter
const NAL_TYPE_AUD: u8 = 9;
/// Accumulation ceiling before the degenerate flush kicks in
const MAX_BUFFER_SIZE: usize = 256 * 1024;

/// Incremental frame-boundary detector for a raw H.264 stream
pub struct H264Framer {
    buffer: BytesMut,
    /// Degenerate flushes performed so far, a health signal: repeated
    /// overflows mean the encoder is not emitting AUDs at all
    overflow_flushes: u64,
}

impl H264Framer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            overflow_flushes: 0,
        }
    }

    /// Append newly read bytes and return any completed frames
    ///
    /// A frame is complete when the next AUD start code is found past the
    /// buffer start; the AUD itself stays in the buffer as the lead-in of
    /// the following frame. If the buffer grows past the ceiling without
    /// a boundary, the whole buffer is flushed as one degenerate frame,
    /// trading boundary alignment for bounded memory.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        // A boundary at offset 0 is the current frame's own lead-in and
        // carries no new information, so the scan starts past it.
        while let Some(idx) = find_aud_boundary(&self.buffer, 1) {
            frames.push(self.buffer.split_to(idx).freeze());
        }

        if self.buffer.len() > MAX_BUFFER_SIZE {
            self.overflow_flushes += 1;
            warn!(
                "No frame boundary within {} bytes, flushing whole buffer (flush #{})",
                self.buffer.len(),
                self.overflow_flushes
            );
            frames.push(self.buffer.split().freeze());
        }

        frames
    }

    /// Bytes retained while waiting for the next boundary
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Take whatever is buffered, boundary or not
    ///
    /// Used on stream end so the trailing access unit is not lost.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }

    /// How many times the overflow guard has fired
    pub fn overflow_flushes(&self) -> u64 {
        self.overflow_flushes
    }
}

impl Default for H264Framer {
    fn default() -> Self {
        Self::new()
    }
}

/// Find the offset of the next AUD start code at or after `from`
///
/// Scans for `00 00 00 01` followed by a NAL header whose low five bits
/// equal 9. Returns None when no such boundary is visible yet.
fn find_aud_boundary(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + START_CODE.len() < data.len() {
        if data[i..i + 4] == START_CODE {
            let nal_header = data[i + 4];
            if nal_header & 0x1f == NAL_TYPE_AUD {
                return Some(i);
            }
            // Not an AUD, resume after this start code
            i += START_CODE.len();
        } else {
            i += 1;
        }
    }
    None
}

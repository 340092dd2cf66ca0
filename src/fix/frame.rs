//! Frame decoder: extracts complete FIX frames from a byte stream.
//!
//! Ported from `original_source/src/fix/fix_frame_decoder.cpp`, with the
//! thrown `std::runtime_error`s replaced by a typed `Result` per
//! DESIGN NOTES, and the overflow check kept as a subtraction (not an
//! addition) to avoid wrapping on adversarial input.

use crate::error::FrameError;

const BEGIN_STRING_PREFIX: &[u8] = b"8=FIX.4.0\x01";
const BODY_LENGTH_TAG: &[u8] = b"\x019=";
const TRAILER_LEN: usize = 7; // "10=NNN\x01"

pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_buffer_size: usize,
    max_body_length: usize,
}

impl FrameDecoder {
    pub fn new(max_buffer_size: usize, max_body_length: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_buffer_size,
            max_body_length,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn can_append(&self, len: usize) -> bool {
        let size = self.buffer.len();
        if size >= self.max_buffer_size {
            return false;
        }
        len <= self.max_buffer_size - size
    }

    /// Appends bytes to the internal buffer. Fails without mutating state
    /// if acceptance would exceed the cap.
    pub fn append(&mut self, data: &[u8]) -> Result<(), FrameError> {
        if !self.can_append(data.len()) {
            return Err(FrameError::BufferOverflow);
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Pulls the next complete frame out of the buffer, if any.
    ///
    /// Must be called in a loop after each `append` to drain pipelined
    /// frames. An invalid BodyLength is fatal: it clears the buffer and
    /// surfaces as an error to the caller.
    pub fn next_message(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }

        let begin_pos = match find(&self.buffer, BEGIN_STRING_PREFIX) {
            Some(p) => p,
            None => {
                // No valid start found anywhere in the buffer; drop it so
                // garbage input can't grow the buffer unbounded.
                self.buffer.clear();
                return Ok(None);
            }
        };
        if begin_pos > 0 {
            self.buffer.drain(0..begin_pos);
        }

        let body_len_tag_pos = match find(&self.buffer, BODY_LENGTH_TAG) {
            Some(p) => p,
            None => return Ok(None), // not enough data yet for the tag
        };
        let body_len_val_pos = body_len_tag_pos + BODY_LENGTH_TAG.len();
        let body_len_end_pos = match find(&self.buffer[body_len_val_pos..], b"\x01") {
            Some(p) => body_len_val_pos + p,
            None => return Ok(None), // body length value not fully buffered yet
        };

        let body_len_str = std::str::from_utf8(&self.buffer[body_len_val_pos..body_len_end_pos])
            .ok()
            .map(str::to_owned);
        let body_length: usize = match body_len_str.and_then(|s| s.parse::<i64>().ok()) {
            Some(n) if n >= 0 && (n as usize) <= self.max_body_length => n as usize,
            other => {
                let raw = other.map(|n| n.to_string()).unwrap_or_default();
                self.buffer.clear();
                return Err(FrameError::InvalidBodyLength(raw));
            }
        };

        let soh_after_body_length = body_len_end_pos + 1;
        let total_len = soh_after_body_length + body_length + TRAILER_LEN;

        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let frame = self.buffer[0..total_len].to_vec();
        self.buffer.drain(0..total_len);
        Ok(Some(frame))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(body: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"8=FIX.4.0\x01");
        out.extend_from_slice(format!("9={}\x01", body.len()).as_bytes());
        out.extend_from_slice(body.as_bytes());
        out.extend_from_slice(b"10=000\x01");
        out
    }

    #[test]
    fn extracts_single_frame() {
        let frame = sample_frame("35=A\x01");
        let mut dec = FrameDecoder::new(1024, 1024);
        dec.append(&frame).unwrap();
        let got = dec.next_message().unwrap().unwrap();
        assert_eq!(got, frame);
        assert!(dec.is_empty());
    }

    #[test]
    fn extracts_pipelined_frames_in_order() {
        let a = sample_frame("35=A\x01");
        let b = sample_frame("35=0\x01");
        let mut combined = a.clone();
        combined.extend_from_slice(&b);

        let mut dec = FrameDecoder::new(4096, 4096);
        dec.append(&combined).unwrap();
        assert_eq!(dec.next_message().unwrap().unwrap(), a);
        assert_eq!(dec.next_message().unwrap().unwrap(), b);
        assert!(dec.next_message().unwrap().is_none());
    }

    #[test]
    fn leftover_suffix_survives_partial_frame() {
        let frame = sample_frame("35=A\x01");
        let mut dec = FrameDecoder::new(4096, 4096);
        dec.append(&frame[..frame.len() - 3]).unwrap();
        assert!(dec.next_message().unwrap().is_none());
        assert_eq!(dec.len(), frame.len() - 3);
    }

    #[test]
    fn overflow_is_rejected_without_mutation() {
        let mut dec = FrameDecoder::new(10, 10);
        dec.append(b"12345").unwrap();
        let err = dec.append(b"123456").unwrap_err();
        assert!(matches!(err, FrameError::BufferOverflow));
        assert_eq!(dec.len(), 5);
    }

    #[test]
    fn invalid_body_length_clears_buffer_and_errors() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"8=FIX.4.0\x01");
        raw.extend_from_slice(b"9=-1\x01");
        raw.extend_from_slice(b"35=A\x0110=000\x01");
        let mut dec = FrameDecoder::new(4096, 4096);
        dec.append(&raw).unwrap();
        let err = dec.next_message().unwrap_err();
        assert!(matches!(err, FrameError::InvalidBodyLength(_)));
        assert!(dec.is_empty());
    }

    #[test]
    fn leading_garbage_before_begin_string_is_discarded() {
        let frame = sample_frame("35=A\x01");
        let mut garbage = b"garbage-bytes-here".to_vec();
        garbage.extend_from_slice(&frame);
        let mut dec = FrameDecoder::new(4096, 4096);
        dec.append(&garbage).unwrap();
        assert_eq!(dec.next_message().unwrap().unwrap(), frame);
    }
}

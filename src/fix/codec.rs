//! Encodes/decodes `FixMessage`s to and from the FIX 4.0 wire form.
//!
//! Ported from `original_source/include/fix/fix_codec.hpp`'s `FixCodec`,
//! with thrown errors replaced by `CodecError` per DESIGN NOTES.

use chrono::Utc;

use crate::error::CodecError;
use crate::fix::message::FixMessage;
use crate::fix::tags::{self, STD_HEADER_ORDER};

const SOH: u8 = 0x01;

pub struct Codec;

impl Codec {
    pub fn new() -> Self {
        Self
    }

    /// Encodes `msg` to wire bytes. Sets `SendingTime` (52) to the current
    /// UTC timestamp if the caller hasn't already set it.
    pub fn encode(&self, msg: &mut FixMessage) -> Vec<u8> {
        if !msg.has(tags::SENDING_TIME) {
            msg.set(tags::SENDING_TIME, Utc::now().format("%Y%m%d-%H:%M:%S").to_string());
        }

        let mut header_rest = Vec::new();
        for &tag in &STD_HEADER_ORDER {
            if let Some(v) = msg.get_string_opt(tag) {
                header_rest.extend_from_slice(format!("{}=", tag).as_bytes());
                header_rest.extend_from_slice(v.as_bytes());
                header_rest.push(SOH);
            }
        }

        let body = self.build_body(msg);
        let body_length = header_rest.len() + body.len();
        msg.set_int(tags::BODY_LENGTH, body_length as i64);

        let mut prefix = Vec::new();
        prefix.extend_from_slice(format!("{}={}", tags::BEGIN_STRING, tags::BEGIN_STRING_FIX40).as_bytes());
        prefix.push(SOH);
        prefix.extend_from_slice(format!("{}={}", tags::BODY_LENGTH, body_length).as_bytes());
        prefix.push(SOH);
        prefix.extend_from_slice(&header_rest);
        prefix.extend_from_slice(&body);

        let checksum = checksum_of(&prefix);
        prefix.extend_from_slice(format!("{}={:03}", tags::CHECK_SUM, checksum).as_bytes());
        prefix.push(SOH);
        prefix
    }

    /// Decodes a wire frame into a `FixMessage`, verifying the checksum and
    /// re-measuring the body-length field against the actual byte range.
    pub fn decode(&self, raw: &[u8]) -> Result<FixMessage, CodecError> {
        let checksum_tag = format!("\x01{}=", tags::CHECK_SUM);
        let checksum_pos = rfind(raw, checksum_tag.as_bytes()).ok_or(CodecError::MissingChecksum)?;
        let prefix = &raw[0..=checksum_pos]; // up to and including the leading SOH
        let expected_start = checksum_pos + checksum_tag.len();
        let expected = std::str::from_utf8(&raw[expected_start..expected_start + 3])
            .map_err(|_| CodecError::MalformedField("checksum".into()))?
            .to_string();
        let actual = format!("{:03}", checksum_of(prefix));
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }

        let mut msg = FixMessage::new();
        let mut pos = 0usize;
        while let Some(rel) = find(&raw[pos..], &[SOH]) {
            let field_end = pos + rel;
            let field = &raw[pos..field_end];
            pos = field_end + 1;
            if field.is_empty() {
                continue;
            }
            let eq = find(field, b"=").ok_or_else(|| {
                CodecError::MalformedField(String::from_utf8_lossy(field).to_string())
            })?;
            let tag_str = std::str::from_utf8(&field[0..eq])
                .map_err(|_| CodecError::MalformedField("non-utf8 tag".into()))?;
            let tag: u32 = tag_str
                .parse()
                .map_err(|_| CodecError::MalformedField(format!("bad tag {tag_str}")))?;
            let value = String::from_utf8_lossy(&field[eq + 1..]).to_string();
            msg.set(tag, value);
        }

        let declared = msg.get_int(tags::BODY_LENGTH)? as usize;
        let body_len_tag = format!("{}=", tags::BODY_LENGTH);
        let tag_pos = find(raw, body_len_tag.as_bytes())
            .ok_or_else(|| CodecError::MalformedField("9= not found".into()))?;
        let body_start = find(&raw[tag_pos..], &[SOH])
            .map(|p| tag_pos + p + 1)
            .ok_or_else(|| CodecError::MalformedField("9= not terminated".into()))?;
        let actual_len = (checksum_pos + 1) - body_start;
        if declared != actual_len {
            return Err(CodecError::BodyLengthMismatch {
                declared,
                actual: actual_len,
            });
        }

        Ok(msg)
    }

    fn build_body(&self, msg: &FixMessage) -> Vec<u8> {
        let mut body = Vec::new();
        for (&tag, value) in msg.fields() {
            if is_std_header_or_trailer(tag) {
                continue;
            }
            body.extend_from_slice(format!("{}=", tag).as_bytes());
            body.extend_from_slice(value.as_bytes());
            body.push(SOH);
        }
        body
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

fn is_std_header_or_trailer(tag: u32) -> bool {
    tag == tags::BEGIN_STRING
        || tag == tags::BODY_LENGTH
        || tag == tags::CHECK_SUM
        || STD_HEADER_ORDER.contains(&tag)
}

fn checksum_of(data: &[u8]) -> u32 {
    data.iter().map(|&b| b as u32).sum::<u32>() % 256
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let codec = Codec::new();
        let mut msg = FixMessage::new();
        msg.set(tags::MSG_TYPE, "A");
        msg.set(tags::SENDER_COMP_ID, "CLIENT1");
        msg.set(tags::TARGET_COMP_ID, "GATEWAY");
        msg.set_int(tags::MSG_SEQ_NUM, 1);
        msg.set_int(tags::HEART_BT_INT, 30);

        let wire = codec.encode(&mut msg);
        let decoded = codec.decode(&wire).unwrap();

        assert_eq!(decoded.get_string(tags::MSG_TYPE).unwrap(), "A");
        assert_eq!(decoded.get_int(tags::HEART_BT_INT).unwrap(), 30);
        assert_eq!(decoded.get_int(tags::MSG_SEQ_NUM).unwrap(), 1);
    }

    #[test]
    fn bit_flip_breaks_checksum_or_body_length() {
        let codec = Codec::new();
        let mut msg = FixMessage::new();
        msg.set(tags::MSG_TYPE, "0");
        msg.set(tags::SENDER_COMP_ID, "A");
        msg.set(tags::TARGET_COMP_ID, "B");
        msg.set_int(tags::MSG_SEQ_NUM, 5);

        let mut wire = codec.encode(&mut msg);
        let mid = wire.len() / 2;
        wire[mid] ^= 0xFF;

        assert!(codec.decode(&wire).is_err());
    }

    #[test]
    fn body_length_matches_measured_range() {
        let codec = Codec::new();
        let mut msg = FixMessage::new();
        msg.set(tags::MSG_TYPE, "D");
        msg.set(tags::SENDER_COMP_ID, "C1");
        msg.set(tags::TARGET_COMP_ID, "GW");
        msg.set_int(tags::MSG_SEQ_NUM, 2);
        msg.set(tags::SYMBOL, "TEST");

        let wire = codec.encode(&mut msg);
        let decoded = codec.decode(&wire).unwrap();
        let declared = decoded.get_int(tags::BODY_LENGTH).unwrap();

        let checksum_tag = b"\x0110=";
        let checksum_pos = rfind(&wire, checksum_tag).unwrap();
        let body_len_tag_pos = find(&wire, b"9=").unwrap();
        let body_start = find(&wire[body_len_tag_pos..], &[SOH]).unwrap() + body_len_tag_pos + 1;
        let measured = (checksum_pos + 1) - body_start;
        assert_eq!(declared as usize, measured);
    }
}

//! The wire-agnostic FIX message: a tag -> value map.
//!
//! Mirrors `original_source/include/fix/fix_codec.hpp`'s `FixMessage`, but
//! returns typed `Result`s instead of throwing, per DESIGN NOTES' mandate
//! to turn codec exceptions into typed results.

use std::collections::BTreeMap;

use crate::error::CodecError;

/// A FIX message as a mapping from integer tag to string value.
///
/// Tags are unique within a message; a `BTreeMap` keeps iteration in tag
/// order for free, which the codec's body-encoding step relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixMessage {
    fields: BTreeMap<u32, String>,
}

impl FixMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, tag: u32, value: impl Into<String>) -> &mut Self {
        self.fields.insert(tag, value.into());
        self
    }

    pub fn set_int(&mut self, tag: u32, value: i64) -> &mut Self {
        self.set(tag, value.to_string())
    }

    pub fn get_string(&self, tag: u32) -> Result<&str, CodecError> {
        self.fields
            .get(&tag)
            .map(String::as_str)
            .ok_or(CodecError::MissingTag(tag))
    }

    pub fn get_string_opt(&self, tag: u32) -> Option<&str> {
        self.fields.get(&tag).map(String::as_str)
    }

    pub fn get_int(&self, tag: u32) -> Result<i64, CodecError> {
        let raw = self.get_string(tag)?;
        raw.parse()
            .map_err(|_| CodecError::NotAnInteger(tag, raw.to_string()))
    }

    pub fn get_f64(&self, tag: u32) -> Result<f64, CodecError> {
        let raw = self.get_string(tag)?;
        raw.parse()
            .map_err(|_| CodecError::NotAnInteger(tag, raw.to_string()))
    }

    pub fn has(&self, tag: u32) -> bool {
        self.fields.contains_key(&tag)
    }

    pub fn msg_type(&self) -> Result<&str, CodecError> {
        self.get_string(crate::fix::tags::MSG_TYPE)
    }

    pub fn fields(&self) -> &BTreeMap<u32, String> {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let mut msg = FixMessage::new();
        msg.set(35, "A").set_int(34, 7);
        assert_eq!(msg.get_string(35).unwrap(), "A");
        assert_eq!(msg.get_int(34).unwrap(), 7);
    }

    #[test]
    fn missing_tag_is_typed_error() {
        let msg = FixMessage::new();
        assert!(matches!(
            msg.get_string(100),
            Err(CodecError::MissingTag(100))
        ));
    }
}

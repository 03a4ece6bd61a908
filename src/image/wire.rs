//! Raw protobuf fields
//!
//! Descriptor fields the image model does not name are carried as their
//! original key and value bytes, so decoding and re-encoding a file never
//! loses options, declarations, or extensions added by newer compilers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use prost::bytes::{Buf, BufMut};
use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};
use prost::DecodeError;

const MAX_GROUP_DEPTH: u32 = 100;

/// One field exactly as it appeared on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawField {
    pub tag: u32,
    /// Key and value, ready to be written back verbatim
    pub bytes: Vec<u8>,
}

impl RawField {
    /// Read the value of a field whose key was already consumed
    pub fn read<B: Buf>(tag: u32, wire_type: WireType, buf: &mut B) -> Result<Self, DecodeError> {
        let mut bytes = Vec::new();
        copy_value(tag, wire_type, buf, &mut bytes, 0)?;
        Ok(Self { tag, bytes })
    }
}

fn underflow() -> DecodeError {
    DecodeError::new("buffer underflow")
}

fn copy_value<B: Buf>(tag: u32, wire_type: WireType, buf: &mut B, out: &mut Vec<u8>, depth: u32) -> Result<(), DecodeError> {
    encode_key(tag, wire_type, out);
    match wire_type {
        WireType::Varint => encode_varint(decode_varint(buf)?, out),
        WireType::SixtyFourBit => {
            if buf.remaining() < 8 {
                return Err(underflow());
            }
            out.put_u64_le(buf.get_u64_le());
        }
        WireType::ThirtyTwoBit => {
            if buf.remaining() < 4 {
                return Err(underflow());
            }
            out.put_u32_le(buf.get_u32_le());
        }
        WireType::LengthDelimited => {
            let len = decode_varint(buf)?;
            if len > buf.remaining() as u64 {
                return Err(underflow());
            }
            encode_varint(len, out);
            let value = buf.copy_to_bytes(len as usize);
            out.extend_from_slice(&value);
        }
        WireType::StartGroup => {
            if depth >= MAX_GROUP_DEPTH {
                return Err(DecodeError::new("recursion limit reached"));
            }
            loop {
                if !buf.has_remaining() {
                    return Err(DecodeError::new("unterminated group"));
                }
                let (inner_tag, inner_type) = decode_key(buf)?;
                if inner_type == WireType::EndGroup {
                    if inner_tag != tag {
                        return Err(DecodeError::new("unexpected end group tag"));
                    }
                    encode_key(inner_tag, inner_type, out);
                    break;
                }
                copy_value(inner_tag, inner_type, buf, out, depth + 1)?;
            }
        }
        WireType::EndGroup => return Err(DecodeError::new("unexpected end group tag")),
    }
    Ok(())
}

/// Split a run of encoded fields back into [`RawField`]s
pub fn split_fields(mut data: &[u8]) -> Result<Vec<RawField>, DecodeError> {
    let mut fields = Vec::new();
    while data.has_remaining() {
        let (tag, wire_type) = decode_key(&mut data)?;
        fields.push(RawField::read(tag, wire_type, &mut data)?);
    }
    Ok(fields)
}

/// Write every field whose tag lies in `range`, in the order they were read
pub(crate) fn put_fields<B: BufMut>(fields: &[RawField], range: std::ops::Range<u32>, buf: &mut B) {
    for field in fields.iter().filter(|f| range.contains(&f.tag)) {
        buf.put_slice(&field.bytes);
    }
}

/// JSON form: the fields concatenated and base64-encoded
pub(crate) mod base64_fields {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(fields: &[RawField], serializer: S) -> Result<S::Ok, S::Error> {
        let joined: Vec<u8> = fields.iter().flat_map(|f| f.bytes.iter().copied()).collect();
        serializer.serialize_str(&STANDARD.encode(joined))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<RawField>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)?;
        split_fields(&bytes).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_keeps_every_wire_type() {
        let mut data = Vec::new();
        encode_key(7, WireType::Varint, &mut data);
        encode_varint(300, &mut data);
        encode_key(8, WireType::LengthDelimited, &mut data);
        encode_varint(2, &mut data);
        data.extend_from_slice(b"hi");
        encode_key(9, WireType::SixtyFourBit, &mut data);
        data.put_u64_le(42);
        encode_key(10, WireType::ThirtyTwoBit, &mut data);
        data.put_u32_le(7);
        encode_key(11, WireType::StartGroup, &mut data);
        encode_key(1, WireType::Varint, &mut data);
        encode_varint(1, &mut data);
        encode_key(11, WireType::EndGroup, &mut data);

        let fields = split_fields(&data).unwrap();
        assert_eq!(fields.iter().map(|f| f.tag).collect::<Vec<_>>(), vec![7, 8, 9, 10, 11]);
        let joined: Vec<u8> = fields.iter().flat_map(|f| f.bytes.clone()).collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn test_truncated_field_fails() {
        let mut data = Vec::new();
        encode_key(8, WireType::LengthDelimited, &mut data);
        encode_varint(10, &mut data);
        data.extend_from_slice(b"short");
        assert!(split_fields(&data).is_err());
    }

    #[test]
    fn test_mismatched_group_end_fails() {
        let mut data = Vec::new();
        encode_key(11, WireType::StartGroup, &mut data);
        encode_key(12, WireType::EndGroup, &mut data);
        assert!(split_fields(&data).is_err());
    }
}

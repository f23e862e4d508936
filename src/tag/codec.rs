//! Binary propagation format for tag sets.
//!
//! Layout: a version byte, then for every tag a field id, the varint-prefixed
//! key and the varint-prefixed value. Encoding walks the set in key order so
//! equal sets always encode to equal bytes.

use super::{is_valid_key, is_valid_value, TagError, TagKey, TagSet};

const VERSION: u8 = 0;
const FIELD_TAG: u8 = 0;

/// Upper bound on an encoded tag set.
pub const MAX_ENCODED_LEN: usize = 8192;

/// Encodes a tag set for propagation.
pub fn encode(tags: &TagSet) -> Result<Vec<u8>, TagError> {
    let mut buf = Vec::with_capacity(1 + tags.len() * 16);
    buf.push(VERSION);

    for (key, value) in tags.iter() {
        buf.push(FIELD_TAG);
        write_varint(&mut buf, key.name().len() as u32);
        buf.extend_from_slice(key.name().as_bytes());
        write_varint(&mut buf, value.len() as u32);
        buf.extend_from_slice(value.as_bytes());
    }

    if buf.len() > MAX_ENCODED_LEN {
        return Err(TagError::EncodedTooLarge {
            size: buf.len(),
            limit: MAX_ENCODED_LEN,
        });
    }

    Ok(buf)
}

/// Decodes a propagated tag set. Empty input decodes to an empty set.
///
/// Decoding stops at the first unknown field id, so newer senders can append
/// fields that older receivers skip.
pub fn decode(data: &[u8]) -> Result<TagSet, TagError> {
    let mut tags = TagSet::new();
    let Some(&version) = data.first() else {
        return Ok(tags);
    };
    if version != VERSION {
        return Err(TagError::UnsupportedVersion { version });
    }
    if data.len() > MAX_ENCODED_LEN {
        return Err(TagError::EncodedTooLarge {
            size: data.len(),
            limit: MAX_ENCODED_LEN,
        });
    }

    let mut reader = Reader { data, pos: 1 };

    while let Some(field) = reader.next_byte() {
        if field != FIELD_TAG {
            tracing::debug!(field, "unknown tag encoding field, ignoring remainder");
            break;
        }

        let key = reader.read_string()?;
        let value = reader.read_string()?;

        if !is_valid_key(&key) {
            return Err(TagError::InvalidKey { key });
        }
        if !is_valid_value(&value) {
            return Err(TagError::InvalidValue { key });
        }

        // Later duplicates override earlier ones.
        tags.upsert(TagKey::new(key)?, value)?;
    }

    Ok(tags)
}

fn write_varint(buf: &mut Vec<u8>, mut v: u32) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(b)
    }

    fn read_varint(&mut self) -> Result<u32, TagError> {
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let offset = self.pos;
            let b = self.next_byte().ok_or(TagError::Truncated { offset })?;
            if shift >= 32 {
                return Err(TagError::Truncated { offset });
            }
            result |= u32::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    fn read_string(&mut self) -> Result<String, TagError> {
        let len = self.read_varint()? as usize;
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(TagError::Truncated { offset: start })?;
        self.pos = end;
        Ok(String::from_utf8_lossy(&self.data[start..end]).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> TagKey {
        TagKey::new(name).expect("valid key")
    }

    fn sample() -> TagSet {
        TagSet::new()
            .with(key("k1"), "v1")
            .and_then(|t| t.with(key("grpc.method"), "method"))
            .expect("build tags")
    }

    #[test]
    fn test_encode_layout() {
        let tags = TagSet::new().with(key("ab"), "xyz").expect("build tags");
        let encoded = encode(&tags).expect("encode");
        assert_eq!(encoded, vec![0, 0, 2, b'a', b'b', 3, b'x', b'y', b'z']);
    }

    #[test]
    fn test_encode_decode() {
        let tags = sample();
        let decoded = decode(&encode(&tags).expect("encode")).expect("decode");
        assert_eq!(decoded, tags);
    }

    #[test]
    fn test_decode_is_order_independent() {
        // Same tags, written in reverse key order.
        let mut reversed = vec![VERSION];
        for (k, v) in [("k1", "v1"), ("grpc.method", "method")] {
            reversed.push(FIELD_TAG);
            write_varint(&mut reversed, k.len() as u32);
            reversed.extend_from_slice(k.as_bytes());
            write_varint(&mut reversed, v.len() as u32);
            reversed.extend_from_slice(v.as_bytes());
        }

        assert_eq!(decode(&reversed).expect("decode"), sample());
    }

    #[test]
    fn test_decode_empty_input() {
        assert!(decode(&[]).expect("decode").is_empty());
        assert!(decode(&[VERSION]).expect("decode").is_empty());
    }

    #[test]
    fn test_decode_rejects_unknown_version() {
        assert_eq!(
            decode(&[7, 0]).unwrap_err(),
            TagError::UnsupportedVersion { version: 7 }
        );
    }

    #[test]
    fn test_decode_rejects_truncated_value() {
        let mut encoded = encode(&sample()).expect("encode");
        encoded.truncate(encoded.len() - 1);
        assert!(matches!(
            decode(&encoded),
            Err(TagError::Truncated { .. })
        ));
    }

    #[test]
    fn test_decode_stops_at_unknown_field() {
        let mut encoded = encode(&sample()).expect("encode");
        encoded.extend_from_slice(&[9, 1, 2, 3]);
        assert_eq!(decode(&encoded).expect("decode"), sample());
    }

    #[test]
    fn test_varint_multibyte_length() {
        let long_value = "v".repeat(200);
        let tags = TagSet::new()
            .with(key("long"), long_value.clone())
            .expect("build tags");
        let encoded = encode(&tags).expect("encode");
        // 200 needs two varint bytes.
        assert_eq!(&encoded[7..9], &[0xc8, 0x01]);
        assert_eq!(
            decode(&encoded).expect("decode").get(&key("long")),
            Some(long_value.as_str())
        );
    }

    #[test]
    fn test_encode_rejects_oversized_set() {
        let mut tags = TagSet::new();
        for i in 0..40 {
            tags.upsert(key(&format!("key{i:03}")), "v".repeat(250))
                .expect("upsert");
        }
        assert!(matches!(
            encode(&tags),
            Err(TagError::EncodedTooLarge { .. })
        ));
    }
}

// src/ndef.rs
use serde::Serialize;
use serde_json::Value;
use std::str;

use crate::error::{NfcError, Result};

/// TLV type for an NDEF message block.
pub const TLV_NDEF_MESSAGE: u8 = 0x03;
/// Terminator TLV.
pub const TLV_TERMINATOR: u8 = 0xFE;
/// Largest value the single-byte TLV length field carries.
pub const MAX_TLV_LENGTH: usize = 255;

/// Empty NDEF message, written by a format.
pub const EMPTY_NDEF_MESSAGE: [u8; 3] = [TLV_NDEF_MESSAGE, 0x00, TLV_TERMINATOR];

// MB=1, ME=1, CF=0, SR=1, IL=0, TNF=001 (NFC Forum Well Known Type)
const TEXT_RECORD_HEADER: u8 = 0xD1;
const TNF_MASK: u8 = 0x07;
const TNF_WELL_KNOWN: u8 = 0x01;
const RTD_TEXT: u8 = b'T';
const LANG_LENGTH_MASK: u8 = 0x3F;

/// Best-effort view of what was read off a tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DecodedPayload {
    Json(Value),
    Text { text: String },
    Raw { raw: String },
}

impl DecodedPayload {
    fn raw(buffer: &[u8]) -> Self {
        DecodedPayload::Raw {
            raw: hex::encode(buffer),
        }
    }
}

/// Language codes are 1 to 63 ASCII bytes, the length has to fit the
/// status byte.
pub fn validate_language(lang: &str) -> Result<()> {
    if lang.is_empty() || !lang.is_ascii() || lang.len() > LANG_LENGTH_MASK as usize {
        return Err(NfcError::InvalidLanguageCode(lang.to_string()));
    }
    Ok(())
}

// Text Record payload: [Status Byte] + [Lang Code] + [Text]
pub fn create_text_record_payload(text: &str, lang: &str) -> Result<Vec<u8>> {
    validate_language(lang)?;
    let lang_bytes = lang.as_bytes();

    let mut payload = Vec::with_capacity(1 + lang_bytes.len() + text.len());
    // Bit 7=0 (UTF-8), bits 5-0 = lang length
    payload.push(lang_bytes.len() as u8);
    payload.extend_from_slice(lang_bytes);
    payload.extend_from_slice(text.as_bytes());
    Ok(payload)
}

/// Builds the single short Text record. Does not add the TLV envelope.
pub fn encode_ndef_message(text: &str, lang: &str) -> Result<Vec<u8>> {
    let payload = create_text_record_payload(text, lang)?;
    let record_len = payload.len() + 4;
    if record_len > MAX_TLV_LENGTH {
        return Err(NfcError::CapacityExceeded {
            size: record_len,
            max: MAX_TLV_LENGTH,
        });
    }

    let mut record = Vec::with_capacity(record_len);
    record.push(TEXT_RECORD_HEADER);
    record.push(1); // Type Length
    record.push(payload.len() as u8);
    record.push(RTD_TEXT);
    record.extend_from_slice(&payload);
    Ok(record)
}

pub fn wrap_in_tlv(ndef_bytes: &[u8]) -> Result<Vec<u8>> {
    if ndef_bytes.len() > MAX_TLV_LENGTH {
        return Err(NfcError::CapacityExceeded {
            size: ndef_bytes.len(),
            max: MAX_TLV_LENGTH,
        });
    }

    let mut tlv = Vec::with_capacity(ndef_bytes.len() + 3);
    tlv.push(TLV_NDEF_MESSAGE);
    tlv.push(ndef_bytes.len() as u8);
    tlv.extend_from_slice(ndef_bytes);
    tlv.push(TLV_TERMINATOR);
    Ok(tlv)
}

/// Text record wrapped in its TLV, ready to be laid out on pages.
pub fn encode_text(text: &str, lang: &str) -> Result<Vec<u8>> {
    wrap_in_tlv(&encode_ndef_message(text, lang)?)
}

/// Serialises an application object for the tag. Strings are stored as-is,
/// anything else as compact JSON.
pub fn begin_encoding(payload: &Value, lang: &str) -> Result<Vec<u8>> {
    let text = match payload {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other)?,
    };
    encode_text(&text, lang)
}

/// Position of the first NDEF TLV and its declared value length.
pub fn find_ndef_tlv(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.iter().position(|&b| b == TLV_NDEF_MESSAGE)?;
    let len = *buffer.get(start + 1)? as usize;
    Some((start, len))
}

/// Byte range covering the first NDEF TLV, its value and terminator.
/// The end may lie past `buffer.len()` when the read stopped early.
pub fn tlv_extent(buffer: &[u8]) -> Option<(usize, usize)> {
    find_ndef_tlv(buffer).map(|(start, len)| (start, start + 2 + len + 1))
}

/// Never fails: anything that is not a well-formed Text record comes back
/// as hex.
pub fn decode_ndef(buffer: &[u8]) -> DecodedPayload {
    match extract_text(buffer) {
        Some(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => DecodedPayload::Json(value),
            Err(_) => DecodedPayload::Text { text },
        },
        None => DecodedPayload::raw(buffer),
    }
}

fn extract_text(buffer: &[u8]) -> Option<String> {
    let (start, record_len) = find_ndef_tlv(buffer)?;
    let offset = start + 2;
    if offset + record_len > buffer.len() {
        return None;
    }

    let header = *buffer.get(offset)?;
    let payload_len = *buffer.get(offset + 2)? as usize;
    let record_type = *buffer.get(offset + 3)?;
    if header & TNF_MASK != TNF_WELL_KNOWN || record_type != RTD_TEXT {
        return None;
    }

    let lang_len = (*buffer.get(offset + 4)? & LANG_LENGTH_MASK) as usize;
    let text_start = offset + 5 + lang_len;
    let text_len = payload_len.checked_sub(lang_len + 1)?;
    let text_bytes = buffer.get(text_start..text_start + text_len)?;

    str::from_utf8(text_bytes).ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn text_record_layout() {
        let bytes = encode_text("hi", "fr").unwrap();
        assert_eq!(
            bytes,
            vec![0x03, 0x09, 0xD1, 0x01, 0x05, 0x54, 0x02, b'f', b'r', b'h', b'i', 0xFE]
        );
        // record + TLV type, length and terminator
        assert_eq!(bytes.len(), bytes[1] as usize + 3);
    }

    #[test]
    fn json_object_round_trip() {
        let card = json!({"nom": "DUPONT", "numero_carte": "FR-2024-001"});
        let bytes = begin_encoding(&card, "fr").unwrap();
        assert_eq!(decode_ndef(&bytes), DecodedPayload::Json(card));
    }

    #[test]
    fn string_payload_is_stored_verbatim() {
        let bytes = begin_encoding(&json!("bonjour"), "fr").unwrap();
        assert_eq!(
            decode_ndef(&bytes),
            DecodedPayload::Text {
                text: "bonjour".into()
            }
        );
    }

    #[test]
    fn capacity_boundary() {
        // 4 header bytes + status byte + "fr" leaves 248 bytes of text for a 255 byte record
        let fits = "a".repeat(248);
        let bytes = encode_text(&fits, "fr").unwrap();
        assert_eq!(bytes[1], 255);
        assert_eq!(bytes.len(), 258);

        let too_big = "a".repeat(249);
        match encode_text(&too_big, "fr") {
            Err(NfcError::CapacityExceeded { size, max }) => {
                assert_eq!(size, 256);
                assert_eq!(max, 255);
            }
            other => panic!("expected capacity error, got {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_language_codes() {
        assert!(matches!(
            encode_text("x", ""),
            Err(NfcError::InvalidLanguageCode(_))
        ));
        assert!(matches!(
            encode_text("x", &"e".repeat(64)),
            Err(NfcError::InvalidLanguageCode(_))
        ));
    }

    #[test]
    fn decode_without_tlv_is_raw() {
        assert_eq!(
            decode_ndef(&[0x00, 0x11, 0xFF]),
            DecodedPayload::Raw {
                raw: "0011ff".into()
            }
        );
        assert_eq!(decode_ndef(&[]), DecodedPayload::Raw { raw: String::new() });
    }

    #[test]
    fn decode_truncated_tlv_is_raw() {
        let mut bytes = encode_text("hello", "fr").unwrap();
        bytes.truncate(6);
        assert!(matches!(decode_ndef(&bytes), DecodedPayload::Raw { .. }));
    }

    #[test]
    fn decode_empty_message_is_raw() {
        let formatted = [0x03, 0x00, 0xFE, 0x00];
        assert_eq!(
            decode_ndef(&formatted),
            DecodedPayload::Raw {
                raw: "0300fe00".into()
            }
        );
    }

    #[test]
    fn decode_uri_record_is_raw() {
        // Well-known 'U' record
        let bytes = [0x03, 0x06, 0xD1, 0x01, 0x02, 0x55, 0x04, b'a', 0xFE];
        assert!(matches!(decode_ndef(&bytes), DecodedPayload::Raw { .. }));
    }

    #[test]
    fn decode_skips_leading_bytes() {
        let mut bytes = vec![0x00, 0x00];
        bytes.extend(encode_text("plain text", "en").unwrap());
        assert_eq!(
            decode_ndef(&bytes),
            DecodedPayload::Text {
                text: "plain text".into()
            }
        );
    }

    #[test]
    fn tlv_extent_covers_terminator() {
        let bytes = encode_text("abc", "fr").unwrap();
        assert_eq!(tlv_extent(&bytes), Some((0, bytes.len())));
        assert_eq!(tlv_extent(&EMPTY_NDEF_MESSAGE), Some((0, 3)));
        assert_eq!(tlv_extent(&[0x00, 0x03]), None);
    }

    #[test]
    fn decoded_payload_serialization() {
        let raw = serde_json::to_value(DecodedPayload::Raw { raw: "00".into() }).unwrap();
        assert_eq!(raw, json!({"raw": "00"}));
        let text = serde_json::to_value(DecodedPayload::Text { text: "t".into() }).unwrap();
        assert_eq!(text, json!({"text": "t"}));
    }

    proptest! {
        #[test]
        fn round_trip(s in "\\PC{0,60}") {
            let bytes = encode_text(&s, "fr").unwrap();
            prop_assert_eq!(bytes[0], TLV_NDEF_MESSAGE);
            prop_assert_eq!(*bytes.last().unwrap(), TLV_TERMINATOR);

            let expected = match serde_json::from_str::<Value>(&s) {
                Ok(v) => DecodedPayload::Json(v),
                Err(_) => DecodedPayload::Text { text: s.clone() },
            };
            prop_assert_eq!(decode_ndef(&bytes), expected);
        }

        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..1000)) {
            use std::panic::{catch_unwind, AssertUnwindSafe};
            let res = catch_unwind(AssertUnwindSafe(|| decode_ndef(&bytes)));
            prop_assert!(res.is_ok());
        }
    }
}

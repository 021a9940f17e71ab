// src/geometry.rs
//! Memory layout of the supported NTAG21x tag families, and the ATR
//! heuristics used to tell tag families apart.

use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Tag family identifiers, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TagType {
    #[serde(rename = "NTAG_213")]
    Ntag213,
    #[serde(rename = "NTAG_215")]
    Ntag215,
    #[serde(rename = "NTAG_216")]
    Ntag216,
    #[serde(rename = "MIFARE_CLASSIC_1K")]
    MifareClassic1k,
    #[serde(rename = "MIFARE_CLASSIC_4K")]
    MifareClassic4k,
    MifareUltralight,
    MifareDesfire,
    #[serde(rename = "ISO14443A")]
    Iso14443a,
}

/// Family this deployment targets unless configured otherwise; also what an
/// unrecognised ATR is taken to be.
pub const DEFAULT_TAG_TYPE: TagType = TagType::Ntag216;

/// NXP manufacturer byte, first byte of every NTAG UID.
pub const NXP_MANUFACTURER_ID: u8 = 0x04;

impl TagType {
    pub const ALL: [TagType; 8] = [
        TagType::MifareClassic1k,
        TagType::MifareClassic4k,
        TagType::MifareUltralight,
        TagType::MifareDesfire,
        TagType::Ntag213,
        TagType::Ntag215,
        TagType::Ntag216,
        TagType::Iso14443a,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            TagType::Ntag213 => "NTAG_213",
            TagType::Ntag215 => "NTAG_215",
            TagType::Ntag216 => "NTAG_216",
            TagType::MifareClassic1k => "MIFARE_CLASSIC_1K",
            TagType::MifareClassic4k => "MIFARE_CLASSIC_4K",
            TagType::MifareUltralight => "MIFARE_ULTRALIGHT",
            TagType::MifareDesfire => "MIFARE_DESFIRE",
            TagType::Iso14443a => "ISO14443A",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            TagType::Ntag213 => "NTAG 213",
            TagType::Ntag215 => "NTAG 215",
            TagType::Ntag216 => "NTAG 216",
            TagType::MifareClassic1k => "MIFARE Classic 1K",
            TagType::MifareClassic4k => "MIFARE Classic 4K",
            TagType::MifareUltralight => "MIFARE Ultralight",
            TagType::MifareDesfire => "MIFARE DESFire",
            TagType::Iso14443a => "ISO 14443-A",
        }
    }
}

impl fmt::Display for TagType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for TagType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        TagType::ALL
            .iter()
            .copied()
            .find(|t| t.id().replace('_', "") == wanted)
            .ok_or_else(|| format!("unknown tag family: {}", s))
    }
}

/// Static description of an NTAG21x memory map. All counts are in bytes
/// unless the name says pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagGeometry {
    pub tag_type: TagType,
    pub manufacturer: &'static str,
    pub total_memory_bytes: usize,
    pub usable_memory_bytes: usize,
    pub total_pages: usize,
    pub user_pages: usize,
    pub page_size_bytes: usize,
    pub uid_length_bytes: usize,
    pub first_data_page: u8,
    pub last_data_page: u8,
    pub config_page: u8,
    pub password_page: u8,
    pub max_ndef_payload_bytes: usize,
}

pub const PAGE_SIZE: usize = 4;

pub const NTAG213: TagGeometry = TagGeometry {
    tag_type: TagType::Ntag213,
    manufacturer: "NXP Semiconductors",
    total_memory_bytes: 180,
    usable_memory_bytes: 144,
    total_pages: 45,
    user_pages: 36,
    page_size_bytes: PAGE_SIZE,
    uid_length_bytes: 7,
    first_data_page: 4,
    last_data_page: 39,
    config_page: 41,
    password_page: 43,
    max_ndef_payload_bytes: 144,
};

pub const NTAG215: TagGeometry = TagGeometry {
    tag_type: TagType::Ntag215,
    manufacturer: "NXP Semiconductors",
    total_memory_bytes: 540,
    usable_memory_bytes: 504,
    total_pages: 135,
    user_pages: 126,
    page_size_bytes: PAGE_SIZE,
    uid_length_bytes: 7,
    first_data_page: 4,
    last_data_page: 129,
    config_page: 131,
    password_page: 133,
    max_ndef_payload_bytes: 504,
};

pub const NTAG216: TagGeometry = TagGeometry {
    tag_type: TagType::Ntag216,
    manufacturer: "NXP Semiconductors",
    total_memory_bytes: 924,
    usable_memory_bytes: 888,
    total_pages: 231,
    user_pages: 222,
    page_size_bytes: PAGE_SIZE,
    uid_length_bytes: 7,
    first_data_page: 4,
    last_data_page: 225,
    config_page: 227,
    password_page: 229,
    max_ndef_payload_bytes: 888,
};

lazy_static! {
    static ref GEOMETRIES: HashMap<TagType, TagGeometry> = {
        let mut m = HashMap::new();
        for g in [NTAG213, NTAG215, NTAG216] {
            m.insert(g.tag_type, g);
        }
        m
    };
}

impl TagGeometry {
    /// Layout for `tag_type`, if it is an NTAG21x family.
    pub fn lookup(tag_type: TagType) -> Option<&'static TagGeometry> {
        GEOMETRIES.get(&tag_type)
    }

    pub fn data_pages(&self) -> usize {
        (self.last_data_page - self.first_data_page) as usize + 1
    }

    pub fn info(&self) -> TagTypeInfo {
        TagTypeInfo {
            family: self.tag_type.display_name(),
            manufacturer: self.manufacturer,
            total_memory_bytes: self.total_memory_bytes,
            usable_memory_bytes: self.usable_memory_bytes,
            total_pages: self.total_pages,
            uid_length_bytes: self.uid_length_bytes,
            compatibility_standards: &["ISO/IEC 14443-3A", "NFC Forum Type 2 Tag"],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagTypeInfo {
    pub family: &'static str,
    pub manufacturer: &'static str,
    pub total_memory_bytes: usize,
    pub usable_memory_bytes: usize,
    pub total_pages: usize,
    pub uid_length_bytes: usize,
    pub compatibility_standards: &'static [&'static str],
}

/// Upper-case hex substrings of the ATR, checked in order.
pub const ATR_PATTERNS: [(&str, TagType); 7] = [
    ("0044", TagType::Ntag216),
    ("0042", TagType::Ntag215),
    ("003E", TagType::Ntag213),
    ("0001", TagType::MifareClassic1k),
    ("0002", TagType::MifareClassic4k),
    ("0003", TagType::MifareUltralight),
    ("0004", TagType::MifareDesfire),
];

/// Infers the tag family from its ATR. Unknown or missing ATRs map to
/// `fallback`, the family the deployment targets.
pub fn tag_type_from_atr(atr: Option<&[u8]>, fallback: TagType) -> TagType {
    let Some(atr) = atr else {
        return fallback;
    };
    let atr_hex = hex::encode_upper(atr);
    ATR_PATTERNS
        .iter()
        .find(|(pattern, _)| atr_hex.contains(*pattern))
        .map(|(_, tag_type)| *tag_type)
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometries_respect_capacity_invariants() {
        for g in [NTAG213, NTAG215, NTAG216] {
            assert!(g.max_ndef_payload_bytes <= g.usable_memory_bytes);
            assert!(g.data_pages() * g.page_size_bytes >= g.max_ndef_payload_bytes);
            assert_eq!(g.data_pages(), g.user_pages);
            assert_eq!(g.page_size_bytes, 4);
        }
    }

    #[test]
    fn ntag216_layout() {
        let g = TagGeometry::lookup(TagType::Ntag216).unwrap();
        assert_eq!(g.first_data_page, 4);
        assert_eq!(g.last_data_page, 225);
        assert_eq!(g.max_ndef_payload_bytes, 888);
        assert_eq!(g.uid_length_bytes, 7);
        assert!(TagGeometry::lookup(TagType::MifareClassic1k).is_none());
    }

    #[test]
    fn atr_lookup() {
        // ACR122U-style ATR for an NTAG216
        let atr = [
            0x3B, 0x8F, 0x80, 0x01, 0x80, 0x4F, 0x0C, 0xA0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00,
            0x44, 0x00, 0x00, 0x00, 0x00, 0x6A,
        ];
        assert_eq!(tag_type_from_atr(Some(&atr), DEFAULT_TAG_TYPE), TagType::Ntag216);
        assert_eq!(
            tag_type_from_atr(Some(&[0x3B, 0x00, 0x3E]), DEFAULT_TAG_TYPE),
            TagType::Ntag213
        );
        assert_eq!(
            tag_type_from_atr(Some(&[0xAA, 0xBB]), DEFAULT_TAG_TYPE),
            DEFAULT_TAG_TYPE
        );
        assert_eq!(tag_type_from_atr(None, TagType::Ntag215), TagType::Ntag215);
    }

    #[test]
    fn parse_tag_family() {
        assert_eq!("NTAG216".parse::<TagType>().unwrap(), TagType::Ntag216);
        assert_eq!("ntag_215".parse::<TagType>().unwrap(), TagType::Ntag215);
        assert!("felica".parse::<TagType>().is_err());
    }

    #[test]
    fn tag_type_serializes_as_id() {
        for t in TagType::ALL {
            assert_eq!(serde_json::to_value(t).unwrap(), t.id());
        }
    }
}

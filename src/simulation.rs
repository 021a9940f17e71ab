// src/simulation.rs
//! Stand-in results for when no reader or no tag is present, so callers
//! never wait on hardware that is not there. Everything here is flagged
//! `simulated` and touches no I/O.

use rand::Rng;
use serde_json::json;

use crate::geometry::{NXP_MANUFACTURER_ID, TagGeometry};
use crate::ndef::DecodedPayload;
use crate::types::{FormatData, OperationResult, ReadData, ReaderInfo, WriteData};

pub const SIMULATED_READER_NAME: &str = "Luca 40 KM - NFC Reader (Simulated)";

/// Fresh random UID with the NXP manufacturer byte in front.
pub fn simulated_uid(geometry: &TagGeometry) -> Vec<u8> {
    let mut uid = vec![0u8; geometry.uid_length_bytes];
    if let Some((first, rest)) = uid.split_first_mut() {
        *first = NXP_MANUFACTURER_ID;
        rand::rng().fill(rest);
    }
    uid
}

pub fn simulated_reader(geometry: &TagGeometry) -> ReaderInfo {
    ReaderInfo {
        name: SIMULATED_READER_NAME.to_string(),
        connected: false,
        simulated: true,
        supported_type: geometry.tag_type.display_name(),
    }
}

pub fn read(geometry: &TagGeometry) -> OperationResult<ReadData> {
    OperationResult::simulated(ReadData {
        uid: hex::encode_upper(simulated_uid(geometry)),
        tag_type: geometry.tag_type,
        capacity_bytes: geometry.usable_memory_bytes,
        atr: None,
        decoded_payload: DecodedPayload::Json(json!({
            "message": "Simulation mode - no real data"
        })),
    })
}

/// `encoded_len` must already have passed the capacity check.
pub fn write(geometry: &TagGeometry, encoded_len: usize) -> OperationResult<WriteData> {
    OperationResult::simulated(WriteData {
        uid: hex::encode_upper(simulated_uid(geometry)),
        tag_type: geometry.tag_type,
        bytes_written: encoded_len,
        capacity_remaining: geometry.max_ndef_payload_bytes.saturating_sub(encoded_len),
    })
}

pub fn format(geometry: &TagGeometry) -> OperationResult<FormatData> {
    OperationResult::simulated(FormatData {
        message: format!("{} format simulated", geometry.tag_type),
    })
}
